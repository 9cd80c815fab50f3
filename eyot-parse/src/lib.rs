#![forbid(unsafe_code)]

//! Recursive-descent parser with bounded backtracking. Builds the scope
//! tree in lockstep with nesting and resolves imports through a
//! [`ModuleProvider`] supplied by the caller.

mod parser;

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use eyot_ast::{Errors, Module, ModuleId};

pub use parser::Parser;

/// The boundary the parser uses to load imported modules. Implementations
/// recursively lex, parse and analyze the named module, using the
/// `disallowed` set to detect import cycles.
pub trait ModuleProvider {
    fn get_module(
        &mut self,
        id: &ModuleId,
        disallowed: &HashSet<String>,
        errors: &mut Errors,
    ) -> Option<Rc<RefCell<Module>>>;
}
