#![forbid(unsafe_code)]

use std::fmt;
use std::fmt::Write as _;

use crate::expr::{Expr, FloatLit, IntLit, StrLit, StructLit, StructLitPair};
use crate::functions::Locus;
use crate::ids::StructId;
use crate::scope::Scope;

/// The payload of a callable type.
#[derive(Clone, Debug)]
pub struct FunctionType {
    pub params: Vec<Type>,
    pub ret: Box<Type>,
    pub locus: Locus,
    /// Builtins are runtime- or FFI-provided C symbols; they are emitted
    /// without namespacing.
    pub builtin: bool,
    /// Set when the function is bound to a struct.
    pub bound_struct: Option<String>,
}

/// The cross-device value-type model.
#[derive(Clone, Debug)]
pub enum Type {
    Integer,
    Float { width: u8 },
    Boolean,
    Character,
    Str,
    Void,
    /// The type of the `null` literal; assignable to any pointer.
    Null,
    Pointer(Box<Type>),
    /// Vectors are always reference-shaped: constructors yield
    /// `Pointer(Vector(T))`.
    Vector(Box<Type>),
    /// Anonymous; identified structurally by its element types.
    Tuple(Vec<Type>),
    Struct(StructId),
    Function(FunctionType),
    /// A partial application: at runtime a function id plus a fixed-size
    /// packed argument blob.
    Closure { params: Vec<Type>, ret: Box<Type> },
    Worker { send: Box<Type>, recv: Box<Type> },
}

impl Default for Type {
    fn default() -> Self {
        Type::Void
    }
}

impl Type {
    pub fn pointer(inner: Type) -> Type {
        Type::Pointer(Box::new(inner))
    }

    /// The reference-shaped vector type: a pointer to a vector of `inner`.
    pub fn vector(inner: Type) -> Type {
        Type::pointer(Type::Vector(Box::new(inner)))
    }

    pub fn float32() -> Type {
        Type::Float { width: 32 }
    }

    pub fn float64() -> Type {
        Type::Float { width: 64 }
    }

    pub fn function(params: Vec<Type>, ret: Type, locus: Locus) -> Type {
        Type::Function(FunctionType {
            params,
            ret: Box::new(ret),
            locus,
            builtin: false,
            bound_struct: None,
        })
    }

    pub fn builtin_function(params: Vec<Type>, ret: Type) -> Type {
        Type::Function(FunctionType {
            params,
            ret: Box::new(ret),
            locus: Locus::Cpu,
            builtin: true,
            bound_struct: None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Integer | Type::Float { .. })
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Type::Function(_) | Type::Closure { .. })
    }

    /// Peel one pointer layer, if present.
    pub fn unwrapped(&self) -> &Type {
        match self {
            Type::Pointer(inner) => inner,
            other => other,
        }
    }

    /// A short name for the type's category, used in diagnostics.
    pub fn rough_name(&self) -> &'static str {
        match self {
            Type::Null => "null",
            Type::Integer => "integer",
            Type::Str => "string",
            Type::Boolean => "boolean",
            Type::Character => "character",
            Type::Float { .. } => "float",
            Type::Void => "void",
            Type::Function(_) => "function",
            Type::Closure { .. } => "closure",
            Type::Struct(_) => "struct",
            Type::Vector(_) => "vector",
            Type::Worker { .. } => "worker",
            Type::Pointer(_) => "pointer",
            Type::Tuple(_) => "tuple",
        }
    }

    fn write_id(&self, out: &mut String) {
        match self {
            Type::Null => out.push('l'),
            Type::Integer => out.push('i'),
            Type::Str => out.push('s'),
            Type::Boolean => out.push('b'),
            Type::Character => out.push('a'),
            Type::Float { width } => out.push(if *width == 64 { 'F' } else { 'f' }),
            Type::Void => out.push('v'),
            Type::Function(ft) => {
                out.push('n');
                ft.ret.write_id(out);
                out.push('N');
            }
            Type::Closure { ret, .. } => {
                out.push('b');
                ret.write_id(out);
                out.push('B');
            }
            Type::Struct(sid) => {
                out.push_str("s_");
                out.push_str(&sid.name);
                for (i, cpt) in sid.module.parts().iter().enumerate() {
                    if i > 0 {
                        out.push('_');
                    } else {
                        out.push_str("__");
                    }
                    out.push_str(cpt);
                }
                out.push_str("_S");
            }
            Type::Vector(inner) => {
                out.push('v');
                inner.write_id(out);
                out.push('V');
            }
            Type::Worker { send, recv } => {
                out.push('c');
                send.write_id(out);
                out.push('c');
                recv.write_id(out);
                out.push('C');
            }
            Type::Pointer(inner) => {
                out.push('p');
                inner.write_id(out);
                out.push('P');
            }
            Type::Tuple(items) => {
                out.push('_');
                for ty in items {
                    ty.write_id(out);
                }
                out.push('_');
            }
        }
    }

    fn namespaced_identifier(&self, ns: &str) -> String {
        let mut out = String::new();
        if !ns.is_empty() {
            out.push_str("ey_");
            out.push_str(ns);
        }
        self.write_id(&mut out);
        if out.ends_with('_') {
            out.pop();
        }
        out
    }

    /// Canonical ASCII encoding of the type, sufficient to name C symbols
    /// derived from it. Structurally identical tuples share one.
    pub fn raw_identifier(&self) -> String {
        self.namespaced_identifier("")
    }

    /// The C struct name used for tuple instantiations of this type.
    pub fn tuple_identifier(&self) -> String {
        self.namespaced_identifier("tuple")
    }

    /// Name of the generated typed append helper for a vector of this
    /// element type.
    pub fn vector_append_name(&self) -> String {
        format!("ey_vector_append_{}", self.raw_identifier())
    }

    /// Both integers, both floats of any width, or equal.
    pub fn numerically_compatible(&self, rhs: &Type) -> bool {
        if self == rhs {
            return true;
        }
        matches!(
            (self, rhs),
            (Type::Float { .. }, Type::Float { .. })
        )
    }

    /// Whether a value of `self` may be assigned into a slot of `rhs`.
    pub fn can_assign_to(&self, rhs: &Type) -> bool {
        if self.numerically_compatible(rhs) {
            return true;
        }

        match (self, rhs) {
            (Type::Tuple(lhs), Type::Tuple(rhs)) => {
                lhs.len() == rhs.len()
                    && lhs.iter().zip(rhs.iter()).all(|(l, r)| l.can_assign_to(r))
            }
            // Integer literals flow into float slots, and floats narrow to
            // integers, for convenience.
            (Type::Integer, Type::Float { .. }) => true,
            (Type::Float { .. }, Type::Integer) => true,
            (Type::Pointer(_), Type::Null) => true,
            _ => false,
        }
    }

    /// Worst-case C size used only to bound the packed closure argument
    /// block. Reference-shaped values occupy one pointer slot.
    pub fn estimate_c_size(&self, scope: &Scope) -> usize {
        match self {
            Type::Float { width } => {
                if *width == 64 {
                    8
                } else {
                    4
                }
            }
            Type::Integer | Type::Boolean | Type::Character => 8,
            Type::Void => 0,
            Type::Tuple(items) => items.iter().map(|ty| ty.estimate_c_size(scope)).sum(),
            Type::Struct(sid) => match scope.lookup_struct(sid) {
                Some(layout) => layout
                    .fields
                    .iter()
                    .map(|f| f.ty.estimate_c_size(scope))
                    .sum(),
                None => 0,
            },
            Type::Str
            | Type::Null
            | Type::Pointer(_)
            | Type::Vector(_)
            | Type::Worker { .. }
            | Type::Function(_) => 8,
            Type::Closure { .. } => 16,
        }
    }

    /// The literal used for a default-initialized struct field of this
    /// type, or `None` when the type has no default.
    pub fn default_value_expression(&self, scope: &Scope) -> Option<Expr> {
        match self {
            Type::Integer => Some(Expr::Int(IntLit { value: 0 })),
            Type::Str => Some(Expr::Str(StrLit {
                value: String::new(),
                id: 0,
            })),
            Type::Boolean => Some(Expr::Bool(crate::expr::BoolLit { value: false })),
            Type::Character => Some(Expr::Character(crate::expr::CharLit { code_point: 0 })),
            Type::Float { width } => Some(Expr::Float(FloatLit {
                int_part: 0,
                zeros: 1,
                frac_part: 0,
                width: *width,
            })),
            // Admits null pointers; removing them needs a story for
            // recursive structs.
            Type::Pointer(_) | Type::Null => Some(Expr::Null),
            Type::Struct(sid) => {
                let layout = scope.lookup_struct(sid)?;
                let mut pairs = Vec::new();
                for field in &layout.fields {
                    let value = field.ty.default_value_expression(scope)?;
                    pairs.push(StructLitPair {
                        field_name: field.name.clone(),
                        value,
                    });
                }
                Some(Expr::StructLit(StructLit {
                    id: sid.clone(),
                    pairs,
                }))
            }
            Type::Closure { .. }
            | Type::Function(_)
            | Type::Worker { .. }
            | Type::Vector(_)
            | Type::Tuple(_)
            | Type::Void => None,
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, rhs: &Type) -> bool {
        match (self, rhs) {
            (Type::Integer, Type::Integer)
            | (Type::Boolean, Type::Boolean)
            | (Type::Str, Type::Str)
            | (Type::Character, Type::Character)
            | (Type::Void, Type::Void)
            | (Type::Null, Type::Null) => true,
            (Type::Float { width: l }, Type::Float { width: r }) => l == r,
            (Type::Vector(l), Type::Vector(r)) | (Type::Pointer(l), Type::Pointer(r)) => l == r,
            (
                Type::Worker { send: ls, recv: lr },
                Type::Worker { send: rs, recv: rr },
            ) => ls == rs && lr == rr,
            (Type::Function(l), Type::Function(r)) => {
                l.locus == r.locus
                    && l.ret == r.ret
                    && l.bound_struct == r.bound_struct
                    && l.params == r.params
            }
            (
                Type::Closure { params: lp, ret: lr },
                Type::Closure { params: rp, ret: rr },
            ) => lr == rr && lp == rp,
            (Type::Struct(l), Type::Struct(r)) => l == r,
            (Type::Tuple(l), Type::Tuple(r)) => l == r,
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Integer => write!(f, "i64"),
            Type::Str => write!(f, "string"),
            Type::Boolean => write!(f, "boolean"),
            Type::Character => write!(f, "character"),
            Type::Float { width } => write!(f, "f{width}"),
            Type::Void => write!(f, "void"),
            Type::Null => write!(f, "null"),
            Type::Pointer(inner) => write!(f, "*{inner}"),
            Type::Vector(inner) => write!(f, "[{inner}]"),
            Type::Closure { params, ret } => {
                write!(f, "{ret}(closure)(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}")?;
                }
                f.write_char(')')
            }
            Type::Function(ft) => {
                write!(f, "{}(", ft.ret)?;
                for (i, p) in ft.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}")?;
                }
                f.write_char(')')
            }
            Type::Tuple(items) => {
                f.write_char('(')?;
                for (i, ty) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ty}")?;
                }
                f.write_char(')')
            }
            Type::Worker { send, recv } => write!(f, "worker({send}){recv}"),
            Type::Struct(sid) => write!(f, "struct({}, {})", sid.module.key(), sid.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ModuleId;

    fn all_sample_types() -> Vec<Type> {
        vec![
            Type::Integer,
            Type::float32(),
            Type::float64(),
            Type::Boolean,
            Type::Character,
            Type::Str,
            Type::pointer(Type::Integer),
            Type::vector(Type::Integer),
            Type::Tuple(vec![Type::Integer, Type::Str]),
            Type::Struct(StructId::new(ModuleId::single("m"), "Point")),
            Type::Worker {
                send: Box::new(Type::Integer),
                recv: Box::new(Type::Integer),
            },
            Type::Closure {
                params: vec![Type::Integer],
                ret: Box::new(Type::Integer),
            },
        ]
    }

    #[test]
    fn every_type_assigns_to_itself() {
        for ty in all_sample_types() {
            assert!(ty.can_assign_to(&ty), "{ty} should assign to itself");
        }
    }

    #[test]
    fn equality_implies_mutual_assignability() {
        for a in all_sample_types() {
            for b in all_sample_types() {
                if a == b {
                    assert!(a.can_assign_to(&b));
                    assert!(b.can_assign_to(&a));
                }
            }
        }
    }

    #[test]
    fn float_widths_are_distinct_but_compatible() {
        assert_ne!(Type::float32(), Type::float64());
        assert!(Type::float32().numerically_compatible(&Type::float64()));
    }

    #[test]
    fn null_assigns_to_pointers_only() {
        assert!(Type::pointer(Type::Integer).can_assign_to(&Type::Null));
        assert!(!Type::Integer.can_assign_to(&Type::Null));
    }

    #[test]
    fn structural_tuples_share_a_raw_identifier() {
        let a = Type::Tuple(vec![Type::Integer, Type::Integer]);
        let b = Type::Tuple(vec![Type::Integer, Type::Integer]);
        assert_eq!(a.raw_identifier(), b.raw_identifier());
        assert_ne!(
            a.raw_identifier(),
            Type::Tuple(vec![Type::Integer, Type::Str]).raw_identifier()
        );
    }

    #[test]
    fn vector_append_names_derive_from_the_element_type() {
        assert_eq!(Type::Integer.vector_append_name(), "ey_vector_append_i");
        assert_eq!(
            Type::float32().vector_append_name(),
            "ey_vector_append_f"
        );
    }

    #[test]
    fn function_equality_includes_the_locus() {
        let cpu = Type::function(vec![Type::Integer], Type::Integer, Locus::Cpu);
        let gpu = Type::function(vec![Type::Integer], Type::Integer, Locus::Gpu);
        assert_ne!(cpu, gpu);
    }
}
