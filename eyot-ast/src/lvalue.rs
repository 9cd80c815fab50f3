#![forbid(unsafe_code)]

use std::fmt;

use crate::expr::Expr;
use crate::types::Type;

#[derive(Clone, Debug)]
pub struct IdentLValue {
    pub name: String,
    pub cached: Type,
}

#[derive(Clone, Debug, Default)]
pub struct SelfLValue {
    pub cached: Type,
}

#[derive(Clone, Debug)]
pub struct AccessLValue {
    pub inner: Box<LValue>,
    pub field_name: String,
    pub cached: Type,
}

#[derive(Clone, Debug)]
pub struct IndexLValue {
    pub indexed: Box<LValue>,
    pub index: Expr,
    pub cached: Type,
}

/// An assignable place.
#[derive(Clone, Debug)]
pub enum LValue {
    Ident(IdentLValue),
    SelfLv(SelfLValue),
    Deref(Box<LValue>),
    Access(AccessLValue),
    Index(IndexLValue),
    /// Tuple destructuring: `a, b = pair()`.
    Multiple(Vec<LValue>),
}

impl LValue {
    pub fn ident(name: impl Into<String>) -> LValue {
        LValue::Ident(IdentLValue {
            name: name.into(),
            cached: Type::Void,
        })
    }

    pub fn ty(&self) -> Type {
        match self {
            LValue::Ident(lv) => lv.cached.clone(),
            LValue::SelfLv(lv) => lv.cached.clone(),
            LValue::Deref(inner) => match inner.ty() {
                Type::Pointer(pointee) => *pointee,
                _ => Type::Void,
            },
            LValue::Access(lv) => lv.cached.clone(),
            LValue::Index(lv) => lv.cached.clone(),
            LValue::Multiple(lvs) => Type::Tuple(lvs.iter().map(LValue::ty).collect()),
        }
    }
}

impl fmt::Display for LValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LValue::Ident(lv) => write!(f, "{}", lv.name),
            LValue::SelfLv(_) => write!(f, "self"),
            LValue::Deref(inner) => write!(f, "*{inner}"),
            LValue::Access(lv) => write!(f, "{}.{}", lv.inner, lv.field_name),
            LValue::Index(lv) => write!(f, "{}[...]", lv.indexed),
            LValue::Multiple(lvs) => {
                for (i, lv) in lvs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{lv}")?;
                }
                Ok(())
            }
        }
    }
}
