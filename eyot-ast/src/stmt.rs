#![forbid(unsafe_code)]

use crate::diag::SourceLocation;
use crate::expr::Expr;
use crate::lvalue::LValue;
use crate::scope::Scope;
use crate::types::Type;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignKind {
    /// `let x = e`
    Let,
    /// `const x = e`
    Const,
    /// `x = e`
    Normal,
}

#[derive(Clone, Debug)]
pub struct AssignStmt {
    pub lhs: LValue,
    /// Absent for bare declarations synthesized during mutation.
    pub rhs: Option<Expr>,
    pub kind: AssignKind,
    /// The declared type; for `let`/`const` it is filled from the rhs.
    pub new_type: Type,
    /// When true the emitter registers any pointer introduced here as a
    /// GC root for the lifetime of the enclosing block.
    pub pin_pointers: bool,
}

impl AssignStmt {
    /// A mutation-synthesized `let name = rhs` of a known type.
    pub fn synth_let(name: impl Into<String>, ty: Type, rhs: Option<Expr>, pin: bool) -> AssignStmt {
        AssignStmt {
            lhs: LValue::ident(name),
            rhs,
            kind: AssignKind::Let,
            new_type: ty,
            pin_pointers: pin,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExprStmt {
    pub expr: Expr,
}

#[derive(Clone, Debug)]
pub struct IfSegment {
    /// Absent for the trailing `else`.
    pub condition: Option<Expr>,
    pub block: StatementBlock,
}

#[derive(Clone, Debug)]
pub struct IfStmt {
    pub segments: Vec<IfSegment>,
}

#[derive(Clone, Debug)]
pub struct WhileStmt {
    pub condition: Expr,
    pub block: StatementBlock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForVariant {
    /// Iterating a vector.
    Each,
    /// Iterating a compiled-away `range(...)`.
    Range,
}

#[derive(Clone, Debug)]
pub struct ForeachStmt {
    pub variable: String,
    pub iterable: Expr,
    pub iterated_type: Type,
    pub body: StatementBlock,
    pub variant: ForVariant,
    /// Names of the hoisted bound temporaries in the range case.
    pub start_name: String,
    pub end_name: String,
    pub step_name: String,
}

#[derive(Clone, Debug)]
pub struct ReturnStmt {
    /// Absent for a void return.
    pub value: Option<Expr>,
}

#[derive(Clone, Debug)]
pub struct SendStmt {
    pub pipe: Expr,
    pub value: Expr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifyOp {
    Plus,
    Minus,
    Times,
    Divide,
}

#[derive(Clone, Debug)]
pub struct ModifyStmt {
    pub op: ModifyOp,
    pub target: LValue,
    pub value: Expr,
}

/// Materializes a `void *name[] = { &a, &b, ... }` argument-address array
/// for closure creation and closure calls. Empty entries emit `0`.
#[derive(Clone, Debug)]
pub struct ClosureArgDecl {
    pub name: String,
    pub args: Vec<String>,
    pub address_of: bool,
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Assign(AssignStmt),
    Expr(ExprStmt),
    If(IfStmt),
    While(WhileStmt),
    Foreach(ForeachStmt),
    Return(ReturnStmt),
    Break,
    /// Holds a source location that would otherwise be lost across tree
    /// rewrites; does nothing else.
    Dummy(SourceLocation),
    Send(SendStmt),
    Modify(ModifyStmt),
    ClosureArgDecl(ClosureArgDecl),
}

/// A statement together with the scope it executes in.
#[derive(Clone, Debug)]
pub struct StatementContainer {
    pub stmt: Stmt,
    pub scope: Scope,
}

#[derive(Clone, Debug)]
pub struct StatementBlock {
    pub statements: Vec<StatementContainer>,
    pub scope: Scope,
}

impl StatementBlock {
    pub fn new(scope: Scope) -> StatementBlock {
        StatementBlock {
            statements: Vec::new(),
            scope,
        }
    }
}
