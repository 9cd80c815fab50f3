#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;

use eyot_ast::{
    block_ends_with_return, FunctionDefinition, Locus, Module, Scope, StructDefinitionStatement,
    Tle, TleContainer, Type,
};

use crate::context::{Context, Pass};
use crate::stmt::{check_assign, check_block};

/// Walk every top-level element of a module for the current pass,
/// splicing in elements the mutation pass synthesizes (worker wrappers,
/// GPU kernels).
pub fn check_module_elements(module: &Rc<RefCell<Module>>, ctx: &mut Context) {
    let (elements, module_scope) = {
        let mut m = module.borrow_mut();
        (std::mem::take(&mut m.elements), m.scope.clone())
    };

    let mut new_elements = Vec::with_capacity(elements.len());
    let mut iter = elements.into_iter();

    while let Some(mut tlec) = iter.next() {
        check_tle(&mut tlec.element, &tlec.scope, ctx);

        if !ctx.errors.clean() {
            new_elements.push(tlec);
            new_elements.extend(iter);
            module.borrow_mut().elements = new_elements;
            return;
        }

        for element in ctx.elements_for_insert() {
            new_elements.push(TleContainer {
                element,
                scope: module_scope.clone(),
            });
        }
        new_elements.push(tlec);
    }

    module.borrow_mut().elements = new_elements;
}

fn check_tle(tle: &mut Tle, scope: &Scope, ctx: &mut Context) {
    match tle {
        Tle::Function(fd) => check_function(fd, scope, ctx),

        Tle::Struct(sds) => check_struct_definition(sds, scope, ctx),

        Tle::Import(ie) => {
            scope.set_module(&ie.import_as, ie.names.clone());
        }

        Tle::Const(c) => check_assign(&mut c.assign, scope, ctx),

        Tle::GpuKernel(_) => {}

        Tle::Dummy(loc) => ctx.errors.set_location(loc.clone()),
    }
}

fn check_struct_definition(sds: &mut StructDefinitionStatement, scope: &Scope, ctx: &mut Context) {
    if ctx.pass == Pass::SetTypes {
        scope.set_struct(&sds.id, sds.layout());

        // Without this the struct type would never be emitted, while
        // references to it may be.
        let ty = Type::Struct(sds.id.clone());
        ctx.require_type(&ty, scope);
    }

    let struct_scope = sds.scope.clone();
    for fd in &mut sds.functions {
        check_function(fd, &struct_scope, ctx);
    }
}

pub fn check_function(fd: &mut FunctionDefinition, external_scope: &Scope, ctx: &mut Context) {
    match fd.locus {
        Locus::Gpu => ctx.enter_gpu(),
        Locus::Cpu => ctx.enter_cpu(),
        Locus::Anywhere => {}
    }

    check_function_inner(fd, external_scope, ctx);

    match fd.locus {
        Locus::Gpu => ctx.leave_gpu(),
        Locus::Cpu => ctx.leave_cpu(),
        Locus::Anywhere => {}
    }
}

fn check_function_inner(fd: &mut FunctionDefinition, external_scope: &Scope, ctx: &mut Context) {
    match ctx.pass {
        Pass::SetTypes => {
            if fd.ret != Type::Void && !block_ends_with_return(&fd.block) {
                ctx.errors
                    .report("A non-void function must end with a return");
                return;
            }

            for param in &fd.parameters {
                ctx.require_type(&param.ty, external_scope);
            }

            // Struct functions are reached through their struct, not the
            // local namespace.
            if fd.id.struct_id.is_blank() {
                external_scope.set_variable(&fd.id.name, fd.our_type(), false);
            }

            ctx.require_type(&fd.ret, external_scope);
            if !ctx.errors.clean() {
                return;
            }

            ctx.functions.add(fd.id.clone(), fd.signature(), fd.locus);
        }

        Pass::CheckTypes if fd.skip_check_pass => return,

        _ => {}
    }

    ctx.push_return_type(fd.ret.clone());
    check_block(&mut fd.block, ctx);
    ctx.pop_return_type();
}
