#![forbid(unsafe_code)]

//! Data model shared by every stage of the Eyot compiler: identifiers,
//! the value-type model, the scope tree, the AST itself, the deduplicating
//! function registry and the diagnostic collector.

pub mod diag;
pub mod expr;
pub mod functions;
pub mod ids;
pub mod lvalue;
pub mod module;
pub mod scope;
pub mod stmt;
pub mod tle;
pub mod types;

pub use miette::SourceSpan;

pub type Span = SourceSpan;

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub use diag::{ErrorMessage, Errors, InternalError, SourceLocation};
pub use expr::*;
pub use functions::{FunctionEntry, FunctionGroup, FunctionSet, FunctionSignature, Locus};
pub use ids::{FunctionId, ModuleId, StructId};
pub use lvalue::*;
pub use module::{FfiDefinitions, FunctionInfo, Module, RequiredStruct, StructInfo};
pub use scope::{CFunction, Scope, StructField, StructLayout, VariableBinding};
pub use stmt::*;
pub use tle::*;
pub use types::{FunctionType, Type};
