#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;

use crate::diag::SourceLocation;
use crate::functions::{FunctionSignature, Locus};
use crate::ids::{FunctionId, ModuleId, StructId};
use crate::module::Module;
use crate::scope::{Scope, StructField, StructLayout};
use crate::stmt::{AssignStmt, StatementBlock, Stmt};
use crate::types::{FunctionType, Type};

#[derive(Clone, Debug)]
pub struct FunctionParameter {
    pub name: String,
    pub ty: Type,
}

#[derive(Clone, Debug)]
pub struct FunctionDefinition {
    pub id: FunctionId,
    pub ret: Type,
    pub locus: Locus,
    pub exported: bool,
    /// Synthesized definitions (worker wrappers) skip the final check
    /// pass; their bodies reference names outside any scope.
    pub skip_check_pass: bool,
    pub block: StatementBlock,
    pub parameters: Vec<FunctionParameter>,
}

impl FunctionDefinition {
    /// The registry signature. Struct-bound functions take the receiver
    /// as an implicit leading pointer parameter.
    pub fn signature(&self) -> FunctionSignature {
        let mut params = Vec::new();
        if !self.id.struct_id.is_blank() {
            params.push(Type::pointer(Type::Struct(self.id.struct_id.clone())));
        }
        params.extend(self.parameters.iter().map(|p| p.ty.clone()));

        FunctionSignature {
            locus: self.locus,
            ret: self.ret.clone(),
            params,
        }
    }

    /// The type of this function when referenced as a value.
    pub fn our_type(&self) -> Type {
        Type::Function(FunctionType {
            params: self.parameters.iter().map(|p| p.ty.clone()).collect(),
            ret: Box::new(self.ret.clone()),
            locus: self.locus,
            builtin: false,
            bound_struct: None,
        })
    }

    /// Parameters as emitted: the execution context first, then `ey_self`
    /// for struct-bound functions, then the declared parameters.
    pub fn effective_parameters(&self, execution_context: FunctionParameter) -> Vec<FunctionParameter> {
        let mut params = vec![execution_context];

        if !self.id.struct_id.is_blank() {
            params.push(FunctionParameter {
                name: "ey_self".to_string(),
                ty: Type::pointer(Type::Struct(self.id.struct_id.clone())),
            });
        }

        params.extend(self.parameters.iter().cloned());
        params
    }
}

/// Whether control leaving this block always passes through a `return`:
/// the last statement is a return, or an if-statement all of whose
/// branches end with one.
pub fn block_ends_with_return(block: &StatementBlock) -> bool {
    let Some(last) = block.statements.last() else {
        return false;
    };

    match &last.stmt {
        Stmt::Return(_) => true,
        Stmt::If(ifs) => ifs.segments.iter().all(|seg| block_ends_with_return(&seg.block)),
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct StructDefinitionStatement {
    pub exported: bool,
    pub id: StructId,
    pub fields: Vec<StructField>,
    pub functions: Vec<FunctionDefinition>,
    pub scope: Scope,
}

impl StructDefinitionStatement {
    /// The lookup snapshot stored in scopes.
    pub fn layout(&self) -> StructLayout {
        StructLayout {
            fields: self.fields.clone(),
            methods: self
                .functions
                .iter()
                .map(|f| {
                    let ty = Type::Function(FunctionType {
                        params: f.parameters.iter().map(|p| p.ty.clone()).collect(),
                        ret: Box::new(f.ret.clone()),
                        locus: f.locus,
                        builtin: false,
                        bound_struct: Some(self.id.name.clone()),
                    });
                    (f.id.name.clone(), ty)
                })
                .collect(),
        }
    }
}

/// Placed during mutation for each `gpu f` worker; the emitter expands it
/// into an OpenCL `__kernel` in the device translation unit.
#[derive(Clone, Debug)]
pub struct GpuKernelTle {
    pub kernel_id: FunctionId,
    /// True when the worker is a closure value rather than a named
    /// function.
    pub is_closure_worker: bool,
    pub worker_id: Option<FunctionId>,
    pub input: Type,
    pub output: Type,
}

#[derive(Clone, Debug)]
pub struct ImportElement {
    pub names: ModuleId,
    pub import_as: String,
    pub module: Rc<RefCell<Module>>,
}

#[derive(Clone, Debug)]
pub struct ConstTle {
    pub assign: AssignStmt,
}

#[derive(Clone, Debug)]
pub enum Tle {
    Function(FunctionDefinition),
    Struct(StructDefinitionStatement),
    Import(ImportElement),
    Const(ConstTle),
    GpuKernel(GpuKernelTle),
    /// Line-number carrier, like `Stmt::Dummy`.
    Dummy(SourceLocation),
}

/// A top-level element together with the scope it was declared in.
#[derive(Clone, Debug)]
pub struct TleContainer {
    pub element: Tle,
    pub scope: Scope,
}
