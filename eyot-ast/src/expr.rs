#![forbid(unsafe_code)]

use crate::functions::Locus;
use crate::ids::{FunctionId, StructId};
use crate::types::{FunctionType, Type};

#[derive(Clone, Debug)]
pub struct BoolLit {
    pub value: bool,
}

#[derive(Clone, Debug)]
pub struct CharLit {
    pub code_point: i64,
}

#[derive(Clone, Debug)]
pub struct IntLit {
    pub value: i64,
}

/// A float literal split into its written parts so emission is faithful:
/// `0.007` keeps `zeros = 2`.
#[derive(Clone, Debug)]
pub struct FloatLit {
    pub int_part: i64,
    pub zeros: i64,
    pub frac_part: i64,
    pub width: u8,
}

#[derive(Clone, Debug)]
pub struct StrLit {
    pub value: String,
    /// Index into the program-wide string pool, resolved in the final
    /// analysis pass.
    pub id: usize,
}

#[derive(Clone, Debug, Default)]
pub struct SelfRef {
    pub cached: Type,
}

#[derive(Clone, Debug)]
pub struct Ident {
    pub name: String,
    /// True for names that must reach the C output verbatim.
    pub dont_namespace: bool,
    /// Filled in for identifiers that resolve to a function.
    pub fid: Option<FunctionId>,
    pub cached: Type,
    /// Set for identifiers fully resolved at parse time (imports).
    pub type_set_in_parse: bool,
}

impl Ident {
    pub fn plain(name: impl Into<String>) -> Ident {
        Ident {
            name: name.into(),
            dont_namespace: false,
            fid: None,
            cached: Type::Void,
            type_set_in_parse: false,
        }
    }

    /// A reference to a compiler-generated or runtime name.
    pub fn raw(name: impl Into<String>, cached: Type) -> Ident {
        Ident {
            name: name.into(),
            dont_namespace: true,
            fid: None,
            cached,
            type_set_in_parse: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GpuBuiltin {
    pub name: String,
}

impl GpuBuiltin {
    /// The known device intrinsics and their signatures.
    pub fn signature(&self) -> Option<Type> {
        match self.name.as_str() {
            "sqrt" => Some(Type::Function(FunctionType {
                params: vec![Type::float32()],
                ret: Box::new(Type::float32()),
                locus: Locus::Gpu,
                builtin: true,
                bound_struct: None,
            })),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StructLitPair {
    pub field_name: String,
    pub value: Expr,
}

#[derive(Clone, Debug)]
pub struct StructLit {
    pub id: StructId,
    pub pairs: Vec<StructLitPair>,
}

#[derive(Clone, Debug)]
pub struct TupleExpr {
    pub items: Vec<Expr>,
}

#[derive(Clone, Debug)]
pub struct AccessExpr {
    pub accessed: Box<Expr>,
    pub field: String,
    /// True for accesses of runtime struct members (`w->drain`): emitted
    /// verbatim with no resolution.
    pub allow_raw: bool,
    pub cached: Type,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equality,
    Inequality,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Mod,
}

#[derive(Clone, Debug)]
pub struct BinaryExpr {
    pub op: BinaryOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub cached: Type,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    AddressOf,
    Negate,
}

#[derive(Clone, Debug)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub rhs: Box<Expr>,
    pub cached: Type,
}

/// What an index expression indexes, decided during analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexedKind {
    Vector,
    Str,
}

#[derive(Clone, Debug)]
pub struct IndexExpr {
    pub indexed: Box<Expr>,
    pub index: Box<Expr>,
    pub cached: Type,
    pub kind: IndexedKind,
}

#[derive(Clone, Debug)]
pub struct CallExpr {
    pub callee: Box<Expr>,
    pub args: Vec<Expr>,
    /// Compiler-synthesized calls skip the type-check pass.
    pub ignore_type_checks: bool,
    /// When set, emission writes this variable instead of the call; the
    /// call itself has been hoisted into preceding statements. An empty
    /// name means the call produced nothing (void closure call).
    pub stacked_result: Option<String>,
    /// True for calls whose callee does not take the execution context.
    pub skip_execution_context: bool,
    pub cached: Type,
}

impl CallExpr {
    pub fn new(callee: Expr, args: Vec<Expr>) -> CallExpr {
        CallExpr {
            callee: Box::new(callee),
            args,
            ignore_type_checks: false,
            stacked_result: None,
            skip_execution_context: false,
            cached: Type::Void,
        }
    }

    /// Compiler-generated runtime call, exempt from user type checks.
    pub fn runtime(name: &str, args: Vec<Expr>, cached: Type) -> CallExpr {
        CallExpr {
            callee: Box::new(Expr::Ident(Ident::raw(name, Type::Void))),
            args,
            ignore_type_checks: true,
            stacked_result: None,
            skip_execution_context: false,
            cached,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewExpr {
    pub init: Box<Expr>,
}

#[derive(Clone, Debug)]
pub struct SizeofExpr {
    pub sized: Type,
}

#[derive(Clone, Debug)]
pub struct DerefExpr {
    pub pointer: Box<Expr>,
}

#[derive(Clone, Debug)]
pub struct VectorLit {
    pub element_type: Type,
    pub items: Vec<Expr>,
}

#[derive(Clone, Debug)]
pub struct RangeExpr {
    pub count: Box<Expr>,
    pub start: Box<Expr>,
    pub step: Box<Expr>,
}

/// A partial application. Placeholder positions are `None` in
/// `supplied`; the remaining positions become the closure's parameters.
#[derive(Clone, Debug)]
pub struct ClosureExpr {
    pub callee: Box<Expr>,
    pub called_fid: Option<FunctionId>,
    pub supplied: Vec<Option<Expr>>,
    /// Variable names holding the frozen supplied arguments.
    pub arg_variables: Vec<String>,
    /// Name of the argument-address array variable.
    pub arg_array_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerDestination {
    Cpu,
    Gpu,
}

#[derive(Clone, Debug)]
pub struct CreateWorkerExpr {
    pub worker: Box<Expr>,
    pub send_ty: Type,
    pub recv_ty: Type,
    pub destination: WorkerDestination,
    /// Set when the worker is built from a closure value: the name of the
    /// stack copy.
    pub closure_variable: Option<String>,
    pub wrapper_id: Option<FunctionId>,
    pub kernel_id: Option<FunctionId>,
}

#[derive(Clone, Debug)]
pub struct ReceiveWorkerExpr {
    pub worker: Box<Expr>,
    /// The expression the receive lowers to (a variable, or the drain
    /// call), filled during mutation.
    pub received: Option<Box<Expr>>,
    /// True for `drain`: close the worker and collect a vector.
    pub all: bool,
}

#[derive(Clone, Debug)]
pub struct CreatePipelineExpr {
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub send_ty: Type,
    pub recv_ty: Type,
    pub intermediate: Type,
}

#[derive(Clone, Debug)]
pub struct CastExpr {
    pub new_type: Type,
    pub casted: Box<Expr>,
    /// False for compiler-inserted coercions that bypass the castability
    /// check.
    pub check_castable: bool,
}

#[derive(Clone, Debug)]
pub enum Expr {
    Null,
    Bool(BoolLit),
    Character(CharLit),
    Int(IntLit),
    Float(FloatLit),
    Str(StrLit),
    SelfRef(SelfRef),
    Ident(Ident),
    GpuBuiltin(GpuBuiltin),
    StructLit(StructLit),
    Tuple(TupleExpr),
    Access(AccessExpr),
    Binary(BinaryExpr),
    Unary(UnaryExpr),
    Index(IndexExpr),
    Call(CallExpr),
    New(NewExpr),
    Sizeof(SizeofExpr),
    Deref(DerefExpr),
    VectorLit(VectorLit),
    Range(RangeExpr),
    Closure(ClosureExpr),
    CreateWorker(CreateWorkerExpr),
    ReceiveWorker(ReceiveWorkerExpr),
    CreatePipeline(CreatePipelineExpr),
    Cast(CastExpr),
}

impl Expr {
    /// The expression's type. Concrete for every node once the first
    /// analysis pass has run.
    pub fn ty(&self) -> Type {
        match self {
            Expr::Null => Type::Null,
            Expr::Bool(_) => Type::Boolean,
            Expr::Character(_) => Type::Character,
            Expr::Int(_) => Type::Integer,
            Expr::Float(f) => Type::Float { width: f.width },
            Expr::Str(_) => Type::Str,
            Expr::SelfRef(s) => s.cached.clone(),
            Expr::Ident(i) => i.cached.clone(),
            Expr::GpuBuiltin(g) => g.signature().unwrap_or(Type::Void),
            Expr::StructLit(s) => Type::Struct(s.id.clone()),
            Expr::Tuple(t) => Type::Tuple(t.items.iter().map(Expr::ty).collect()),
            Expr::Access(a) => a.cached.clone(),
            Expr::Binary(b) => b.cached.clone(),
            Expr::Unary(u) => u.cached.clone(),
            Expr::Index(i) => i.cached.clone(),
            Expr::Call(c) => c.cached.clone(),
            Expr::New(n) => Type::pointer(n.init.ty()),
            Expr::Sizeof(_) => Type::Integer,
            Expr::Deref(d) => match d.pointer.ty() {
                Type::Pointer(inner) => *inner,
                _ => Type::Void,
            },
            Expr::VectorLit(v) => Type::vector(v.element_type.clone()),
            Expr::Range(_) => Type::vector(Type::Integer),
            Expr::Closure(c) => {
                let callee_ty = c.callee.ty();
                let (params, ret) = match callee_ty {
                    Type::Function(ft) => (ft.params, ft.ret),
                    Type::Closure { params, ret } => (params, ret),
                    _ => (Vec::new(), Box::new(Type::Void)),
                };
                let unsupplied = params
                    .into_iter()
                    .zip(c.supplied.iter())
                    .filter(|(_, supplied)| supplied.is_none())
                    .map(|(ty, _)| ty)
                    .collect();
                Type::Closure {
                    params: unsupplied,
                    ret,
                }
            }
            Expr::CreateWorker(w) => Type::Worker {
                send: Box::new(w.send_ty.clone()),
                recv: Box::new(w.recv_ty.clone()),
            },
            Expr::ReceiveWorker(r) => {
                let recv = match r.worker.ty() {
                    Type::Worker { recv, .. } => *recv,
                    _ => Type::Void,
                };
                if recv == Type::Void {
                    // A void-returning worker function has nothing to
                    // receive.
                    Type::Void
                } else if r.all {
                    Type::vector(recv)
                } else {
                    recv
                }
            }
            Expr::CreatePipeline(p) => Type::Worker {
                send: Box::new(p.send_ty.clone()),
                recv: Box::new(p.recv_ty.clone()),
            },
            Expr::Cast(c) => c.new_type.clone(),
        }
    }
}
