#![forbid(unsafe_code)]

use std::fmt;

/// A dotted module path, e.g. `std::net` is `["std", "net"]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ModuleId(pub Vec<String>);

/// Module id reserved for symbols that live in the plain C namespace
/// (runtime builtins, FFI functions). These are never prefixed on output.
const BUILTIN_MODULE: &str = "______builtin______";

impl ModuleId {
    pub fn new(parts: Vec<String>) -> Self {
        ModuleId(parts)
    }

    pub fn single(name: impl Into<String>) -> Self {
        ModuleId(vec![name.into()])
    }

    pub fn builtin() -> Self {
        ModuleId(vec![BUILTIN_MODULE.to_string()])
    }

    pub fn is_builtin(&self) -> bool {
        self.0.len() == 1 && self.0[0] == BUILTIN_MODULE
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable lookup key for module tables.
    pub fn key(&self) -> String {
        self.0.join("::")
    }

    pub fn display_name(&self) -> String {
        self.key()
    }

    /// C-identifier-safe encoding of the path.
    pub fn namespace(&self) -> String {
        self.0.join("__").replace('-', "_")
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A fully resolved struct identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct StructId {
    pub module: ModuleId,
    pub name: String,
}

impl StructId {
    pub fn new(module: ModuleId, name: impl Into<String>) -> Self {
        StructId {
            module,
            name: name.into(),
        }
    }

    pub fn blank() -> Self {
        StructId::default()
    }

    pub fn is_blank(&self) -> bool {
        self.name.is_empty()
    }

    pub fn key(&self) -> String {
        format!("{}::{}", self.module.key(), self.name)
    }
}

impl fmt::Display for StructId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module.key(), self.name)
    }
}

/// A fully resolved function identifier: the owning module, the owning
/// struct (blank for free functions) and the user-facing name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FunctionId {
    pub module: ModuleId,
    pub struct_id: StructId,
    pub name: String,
}

impl FunctionId {
    pub fn free(module: ModuleId, name: impl Into<String>) -> Self {
        FunctionId {
            module,
            struct_id: StructId::blank(),
            name: name.into(),
        }
    }

    pub fn method(module: ModuleId, struct_id: StructId, name: impl Into<String>) -> Self {
        FunctionId {
            module,
            struct_id,
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.struct_id.is_blank() {
            write!(f, "{}::{}", self.module.key(), self.name)
        } else {
            write!(f, "{}.{}", self.struct_id, self.name)
        }
    }
}
