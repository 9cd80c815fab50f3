#![forbid(unsafe_code)]

use crate::ids::{FunctionId, ModuleId, StructId};
use crate::scope::{CFunction, Scope, StructLayout};
use crate::tle::{Tle, TleContainer};
use crate::types::Type;

/// External C functions and source supplied alongside a module.
#[derive(Clone, Debug, Default)]
pub struct FfiDefinitions {
    /// Raw C source concatenated into the build.
    pub src: String,
    pub functions: Vec<CFunction>,
    pub linker_flags: Vec<String>,
}

/// A struct (explicit or synthesized for a tuple) that the emitter must
/// produce a C type for.
#[derive(Clone, Debug)]
pub struct RequiredStruct {
    pub generated_for_tuple: bool,
    /// Structural identity; deduplicates repeat instantiations.
    pub type_id: String,
    pub id: StructId,
    pub layout: StructLayout,
}

/// What an importer needs to know about a function in another module.
#[derive(Clone, Debug)]
pub struct FunctionInfo {
    pub id: FunctionId,
    pub ty: Type,
    pub exported: bool,
}

#[derive(Clone, Debug)]
pub struct StructInfo {
    pub id: StructId,
    pub exported: bool,
}

/// A parsed source unit. Immutable after parsing except for the mutation
/// pass (which appends synthesized elements and rewrites nodes) and the
/// attachment of required struct instantiations after the first analysis
/// pass.
#[derive(Debug)]
pub struct Module {
    pub id: ModuleId,
    pub elements: Vec<TleContainer>,
    pub structs: Vec<RequiredStruct>,
    pub scope: Scope,
    pub ffi: Option<FfiDefinitions>,
}

impl Module {
    pub fn function_info(&self, name: &str) -> Option<FunctionInfo> {
        for tlec in &self.elements {
            if let Tle::Function(fd) = &tlec.element {
                if fd.id.name == name {
                    return Some(FunctionInfo {
                        id: fd.id.clone(),
                        ty: fd.our_type(),
                        exported: fd.exported,
                    });
                }
            }
        }
        None
    }

    pub fn struct_info(&self, name: &str) -> Option<StructInfo> {
        for tlec in &self.elements {
            if let Tle::Struct(sds) = &tlec.element {
                if sds.id.name == name {
                    return Some(StructInfo {
                        id: sds.id.clone(),
                        exported: sds.exported,
                    });
                }
            }
        }
        None
    }
}
