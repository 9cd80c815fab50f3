#![forbid(unsafe_code)]

//! Semantic analysis for Eyot: the three ordered passes over each
//! module's AST, the program-level aggregate that drives emission, the
//! module resolver and the FFI descriptor loader.

mod context;
mod env;
mod expr;
mod ffi;
mod program;
mod stmt;
mod tle;

pub use context::{tuple_field_name, Context, Pass, StringPool};
pub use env::Environment;
pub use expr::check_expr;
pub use ffi::{ffi_beside, FfiError};
pub use program::Program;
pub use stmt::{check_assignable, check_block, check_statement};
pub use tle::check_function;
