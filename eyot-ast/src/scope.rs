#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::functions::Locus;
use crate::ids::{ModuleId, StructId};
use crate::types::{FunctionType, Type};

/// A callable provided by the runtime or by FFI, bound under its exact C
/// name.
#[derive(Clone, Debug)]
pub struct CFunction {
    pub name: String,
    pub return_type: Type,
    pub argument_types: Vec<Type>,
}

#[derive(Clone, Debug)]
pub struct VariableBinding {
    pub ty: Type,
    pub assignable: bool,
}

#[derive(Clone, Debug)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
}

/// Immutable snapshot of a struct's shape as seen by lookups: its fields
/// in declaration order plus the types of its bound functions.
#[derive(Clone, Debug, Default)]
pub struct StructLayout {
    pub fields: Vec<StructField>,
    pub methods: Vec<(String, Type)>,
}

impl StructLayout {
    /// Resolve a name against the fields first, then the methods.
    pub fn field(&self, name: &str) -> Option<StructField> {
        if let Some(f) = self.fields.iter().find(|f| f.name == name) {
            return Some(f.clone());
        }

        self.methods
            .iter()
            .find(|(m, _)| m == name)
            .map(|(m, ty)| StructField {
                name: m.clone(),
                ty: ty.clone(),
            })
    }
}

#[derive(Debug, Default)]
struct ScopeData {
    parent: Option<Scope>,
    variables: HashMap<String, VariableBinding>,
    modules: HashMap<String, ModuleId>,
    structs: HashMap<String, StructLayout>,
}

/// A lexical environment. Handles are cheap clones of a shared node;
/// parents are reached through the chain, so lookup walks outward.
#[derive(Clone, Debug)]
pub struct Scope(Rc<RefCell<ScopeData>>);

impl Scope {
    pub fn new(parent: Option<&Scope>) -> Scope {
        Scope(Rc::new(RefCell::new(ScopeData {
            parent: parent.cloned(),
            ..ScopeData::default()
        })))
    }

    pub fn parent(&self) -> Option<Scope> {
        self.0.borrow().parent.clone()
    }

    /// Returns the binding's type and assignability.
    pub fn lookup_variable(&self, ident: &str) -> Option<(Type, bool)> {
        let data = self.0.borrow();
        if let Some(b) = data.variables.get(ident) {
            return Some((b.ty.clone(), b.assignable));
        }
        data.parent.as_ref().and_then(|p| p.lookup_variable(ident))
    }

    /// Variables cannot be shadowed within one scope level.
    pub fn defined_at_this_level(&self, ident: &str) -> bool {
        self.0.borrow().variables.contains_key(ident)
    }

    pub fn lookup_module(&self, ident: &str) -> Option<ModuleId> {
        let data = self.0.borrow();
        if let Some(m) = data.modules.get(ident) {
            return Some(m.clone());
        }
        data.parent.as_ref().and_then(|p| p.lookup_module(ident))
    }

    pub fn lookup_struct(&self, id: &StructId) -> Option<StructLayout> {
        let data = self.0.borrow();
        if let Some(layout) = data.structs.get(&id.key()) {
            return Some(layout.clone());
        }
        data.parent.as_ref().and_then(|p| p.lookup_struct(id))
    }

    /// Bind a variable. When the same identifier is bound to both a CPU
    /// and a GPU function, the binding is relaxed to an `Anywhere`
    /// callable instead of replaced.
    pub fn set_variable(&self, ident: &str, ty: Type, assignable: bool) {
        if let Type::Function(ref new_ft) = ty {
            let mut data = self.0.borrow_mut();
            if let Some(binding) = data.variables.get_mut(ident) {
                if let Type::Function(existing) = &mut binding.ty {
                    let pair = (existing.locus, new_ft.locus);
                    if pair == (Locus::Cpu, Locus::Gpu) || pair == (Locus::Gpu, Locus::Cpu) {
                        existing.locus = Locus::Anywhere;
                        return;
                    }
                }
            }
            data.variables.insert(
                ident.to_string(),
                VariableBinding { ty, assignable },
            );
            return;
        }

        self.0.borrow_mut().variables.insert(
            ident.to_string(),
            VariableBinding { ty, assignable },
        );
    }

    pub fn set_module(&self, ident: &str, module: ModuleId) {
        self.0
            .borrow_mut()
            .modules
            .insert(ident.to_string(), module);
    }

    pub fn set_struct(&self, id: &StructId, layout: StructLayout) {
        self.0.borrow_mut().structs.insert(id.key(), layout);
    }

    pub fn add_c_function(&self, cf: CFunction) {
        let ty = Type::Function(FunctionType {
            params: cf.argument_types,
            ret: Box::new(cf.return_type),
            locus: Locus::Cpu,
            builtin: true,
            bound_struct: None,
        });
        self.set_variable(&cf.name, ty, false);
    }

    pub fn add_c_functions(&self, cfs: &[CFunction]) {
        for cf in cfs {
            self.add_c_function(cf.clone());
        }
    }

    /// Whether a value of this type may cross onto the GPU. Nothing
    /// reference-shaped qualifies. Returns the offending inner type on
    /// failure so diagnostics can name it.
    pub fn can_pass_to_gpu(&self, ty: &Type) -> Result<(), Type> {
        match ty {
            Type::Tuple(items) => {
                for t in items {
                    self.can_pass_to_gpu(t)?;
                }
                Ok(())
            }
            Type::Struct(sid) => {
                let layout = self.lookup_struct(sid).ok_or_else(|| ty.clone())?;
                for field in &layout.fields {
                    self.can_pass_to_gpu(&field.ty)?;
                }
                Ok(())
            }
            Type::Float { width } => {
                if *width == 32 {
                    Ok(())
                } else {
                    Err(ty.clone())
                }
            }
            Type::Integer | Type::Str | Type::Boolean | Type::Character | Type::Void => Ok(()),
            Type::Null
            | Type::Closure { .. }
            | Type::Function(_)
            | Type::Pointer(_)
            | Type::Vector(_)
            | Type::Worker { .. } => Err(ty.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parent_scopes() {
        let root = Scope::new(None);
        root.set_variable("x", Type::Integer, true);
        let child = Scope::new(Some(&root));
        assert_eq!(child.lookup_variable("x"), Some((Type::Integer, true)));
        assert!(child.lookup_variable("y").is_none());
    }

    #[test]
    fn shadowing_is_detectable_per_level() {
        let root = Scope::new(None);
        root.set_variable("x", Type::Integer, true);
        let child = Scope::new(Some(&root));
        assert!(root.defined_at_this_level("x"));
        assert!(!child.defined_at_this_level("x"));
    }

    #[test]
    fn cpu_gpu_function_pair_relaxes_to_anywhere() {
        let scope = Scope::new(None);
        scope.set_variable(
            "f",
            Type::function(vec![Type::Integer], Type::Integer, Locus::Cpu),
            false,
        );
        scope.set_variable(
            "f",
            Type::function(vec![Type::Integer], Type::Integer, Locus::Gpu),
            false,
        );

        let (ty, _) = scope.lookup_variable("f").unwrap();
        match ty {
            Type::Function(ft) => assert_eq!(ft.locus, Locus::Anywhere),
            other => panic!("expected function type, got {other}"),
        }
    }

    #[test]
    fn gpu_admissibility_names_the_offending_inner_type() {
        let scope = Scope::new(None);
        let bad = Type::Tuple(vec![Type::Integer, Type::vector(Type::Integer)]);
        let offending = scope.can_pass_to_gpu(&bad).unwrap_err();
        assert_eq!(offending, Type::vector(Type::Integer));

        assert!(scope.can_pass_to_gpu(&Type::float32()).is_ok());
        assert!(scope.can_pass_to_gpu(&Type::float64()).is_err());
    }
}
