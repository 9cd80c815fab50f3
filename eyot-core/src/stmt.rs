#![forbid(unsafe_code)]

use eyot_ast::{
    AssignKind, AssignStmt, CastExpr, Expr, ForVariant, ForeachStmt, LValue, ReturnStmt, Scope,
    SendStmt, StatementBlock, StatementContainer, Stmt, Type,
};

use crate::context::{Context, Pass};
use crate::expr::check_expr;

/// Walk a statement block. Statements queued through the context's
/// insertion buffer while a statement is being checked are spliced in
/// front of it; a statement may also ask to be removed.
pub fn check_block(block: &mut StatementBlock, ctx: &mut Context) {
    let old = std::mem::take(&mut block.statements);
    let mut new_statements = Vec::with_capacity(old.len());

    let mut iter = old.into_iter();
    while let Some(mut sc) = iter.next() {
        ctx.start_statement_collection();
        check_statement(&mut sc.stmt, &sc.scope, ctx);

        if !ctx.errors.clean() {
            ctx.stop_statement_collection();
            new_statements.push(sc);
            new_statements.extend(iter);
            block.statements = new_statements;
            return;
        }

        let scope = sc.scope.clone();
        for stmt in ctx.stop_statement_collection() {
            new_statements.push(StatementContainer {
                stmt,
                scope: scope.clone(),
            });
        }

        if !ctx.should_remove_statement() {
            new_statements.push(sc);
        }
    }

    block.statements = new_statements;
}

pub fn check_statement(stmt: &mut Stmt, scope: &Scope, ctx: &mut Context) {
    match stmt {
        Stmt::Assign(a) => check_assign(a, scope, ctx),

        Stmt::Expr(es) => check_expr(&mut es.expr, scope, ctx),

        Stmt::If(ifs) => {
            for seg in &mut ifs.segments {
                if let Some(cond) = &mut seg.condition {
                    check_expr(cond, scope, ctx);
                    if !ctx.errors.clean() {
                        return;
                    }

                    if ctx.pass == Pass::SetTypes && cond.ty() != Type::Boolean {
                        ctx.errors.report("If condition not of boolean type");
                        return;
                    }
                }

                check_block(&mut seg.block, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            }
        }

        Stmt::While(ws) => {
            check_expr(&mut ws.condition, scope, ctx);
            check_block(&mut ws.block, ctx);
        }

        Stmt::Foreach(fs) => check_foreach(fs, scope, ctx),

        Stmt::Return(rs) => check_return(rs, scope, ctx),

        Stmt::Break => {}

        Stmt::Dummy(loc) => ctx.errors.set_location(loc.clone()),

        Stmt::Send(ss) => check_send(ss, scope, ctx),

        Stmt::Modify(ms) => {
            let assignable = check_assignable(&mut ms.target, scope, ctx);
            if ctx.pass == Pass::CheckTypes && !assignable {
                ctx.errors
                    .report(format!("Unable to reassign {}", ms.target));
            }
            check_expr(&mut ms.value, scope, ctx);
        }

        Stmt::ClosureArgDecl(_) => {}
    }
}

pub fn check_assign(a: &mut AssignStmt, scope: &Scope, ctx: &mut Context) {
    if let Some(rhs) = &mut a.rhs {
        check_expr(rhs, scope, ctx);
    }

    if a.kind == AssignKind::Normal {
        let assignable = check_assignable(&mut a.lhs, scope, ctx);
        if ctx.pass == Pass::CheckTypes && !assignable {
            ctx.errors.report(format!("Unable to reassign {}", a.lhs));
            return;
        }
    }
    if !ctx.errors.clean() {
        return;
    }

    match ctx.pass {
        Pass::SetTypes => {
            if let Some(rhs) = &a.rhs {
                let rhs_ty = rhs.ty();
                ctx.require_type(&rhs_ty, scope);
                a.new_type = rhs_ty;
            }

            if matches!(a.kind, AssignKind::Let | AssignKind::Const) {
                if let Err(message) =
                    update_scope(&mut a.lhs, scope, &a.new_type, a.kind == AssignKind::Let)
                {
                    ctx.errors
                        .report(format!("Unable to update scope: {message}"));
                }
            }
        }

        Pass::CheckTypes => {
            if a.new_type == Type::Void {
                ctx.errors.report("Cannot assign to void");
                return;
            }

            if matches!(a.new_type, Type::Function(_)) {
                ctx.errors
                    .report("Function values cannot be stored; use 'partial' to build a closure");
                return;
            }

            // The let statement set the type; a plain assign must match
            // the existing binding.
            if a.kind == AssignKind::Normal {
                let lt = a.lhs.ty();
                if !lt.can_assign_to(&a.new_type) {
                    ctx.errors.report(format!(
                        "Cannot assign a variable of type '{lt}' to type '{}'",
                        a.new_type
                    ));
                }
            }
        }

        Pass::Mutate => {}
    }
}

fn check_return(rs: &mut ReturnStmt, scope: &Scope, ctx: &mut Context) {
    if let Some(value) = &mut rs.value {
        check_expr(value, scope, ctx);
    }

    let Some(expected) = ctx.current_return_type() else {
        ctx.errors.report("Trying to return when not in a function");
        return;
    };

    match &mut rs.value {
        None => {
            if expected != Type::Void {
                ctx.errors.report(format!(
                    "Mismatched return types cannot return void in a function returning '{expected}'"
                ));
            }
        }

        Some(value) => {
            let returned = value.ty();

            match ctx.pass {
                Pass::SetTypes => {
                    if !returned.can_assign_to(&expected) {
                        ctx.errors.report(format!(
                            "Mismatched return types '{returned}' != '{expected}'"
                        ));
                    }
                }

                Pass::Mutate => {
                    // A returned tuple whose elements are merely
                    // assignable gets each element coerced to the
                    // declared element type.
                    if let Type::Tuple(expected_items) = &expected {
                        if returned != expected {
                            let Expr::Tuple(tuple) = value else {
                                ctx.errors.report(
                                    "Only direct tuple expressions can be re-shaped in a return",
                                );
                                return;
                            };

                            for (item, target) in
                                tuple.items.iter_mut().zip(expected_items.iter())
                            {
                                let inner = std::mem::replace(item, Expr::Null);
                                *item = Expr::Cast(CastExpr {
                                    new_type: target.clone(),
                                    casted: Box::new(inner),
                                    check_castable: false,
                                });
                            }
                        }
                    }
                }

                Pass::CheckTypes => {}
            }
        }
    }
}

fn check_send(ss: &mut SendStmt, scope: &Scope, ctx: &mut Context) {
    ctx.note_cpu_required("send pipe");

    check_expr(&mut ss.pipe, scope, ctx);
    check_expr(&mut ss.value, scope, ctx);
    if !ctx.errors.clean() {
        return;
    }

    let Type::Worker { send, .. } = ss.pipe.ty() else {
        ctx.errors.report(format!(
            "Trying to send to non-worker type: {}",
            ss.pipe.ty()
        ));
        return;
    };

    if ctx.pass == Pass::SetTypes {
        // Sent values arrive as a vector of elements; unwrap down to the
        // element type.
        let sent = ss.value.ty();
        let element = match sent {
            Type::Pointer(inner) => match *inner {
                Type::Vector(element) => *element,
                other => {
                    ctx.errors
                        .report(format!("Sent value type {other} was not a vector"));
                    return;
                }
            },
            other => {
                ctx.errors
                    .report(format!("Sent value type {other} was not a pointer"));
                return;
            }
        };

        if !element.can_assign_to(&send) {
            ctx.errors.report(format!(
                "Sent value type {element} does not match the send type of the pipe: {send}"
            ));
        }
    }
}

fn check_foreach(fs: &mut ForeachStmt, scope: &Scope, ctx: &mut Context) {
    if fs.variant == ForVariant::Each {
        match ctx.pass {
            Pass::SetTypes => {
                check_expr(&mut fs.iterable, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }

                let iterable_ty = fs.iterable.ty().unwrapped().clone();
                match iterable_ty {
                    Type::Vector(element) => fs.iterated_type = *element,
                    other => {
                        ctx.errors.report(format!(
                            "Attempting to iterate over something that is not a vector: {other}"
                        ));
                        return;
                    }
                }

                fs.body
                    .scope
                    .set_variable(&fs.variable, fs.iterated_type.clone(), true);
            }

            Pass::Mutate => {
                check_expr(&mut fs.iterable, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }

                // Range loops drop the vector entirely: the bounds are
                // hoisted into pinned temporaries and the loop becomes a
                // counting one.
                if let Expr::Range(range) = &mut fs.iterable {
                    let count = std::mem::replace(&mut *range.count, Expr::Null);
                    let start = std::mem::replace(&mut *range.start, Expr::Null);
                    let step = std::mem::replace(&mut *range.step, Expr::Null);

                    fs.end_name = ctx.temp_name();
                    let count_ty = count.ty();
                    ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                        &fs.end_name,
                        count_ty,
                        Some(count),
                        true,
                    )));

                    fs.start_name = ctx.temp_name();
                    let start_ty = start.ty();
                    ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                        &fs.start_name,
                        start_ty,
                        Some(start),
                        true,
                    )));

                    fs.step_name = ctx.temp_name();
                    let step_ty = step.ty();
                    ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                        &fs.step_name,
                        step_ty,
                        Some(step),
                        true,
                    )));

                    fs.variant = ForVariant::Range;
                }
            }

            Pass::CheckTypes => {}
        }
    }

    check_block(&mut fs.body, ctx);
}

/// Resolve an lvalue's type against the scope, returning whether it can
/// be written through.
pub fn check_assignable(lv: &mut LValue, scope: &Scope, ctx: &mut Context) -> bool {
    match lv {
        LValue::Ident(ilv) => match scope.lookup_variable(&ilv.name) {
            Some((ty, assignable)) => {
                ilv.cached = ty;
                assignable
            }
            None => {
                ctx.errors
                    .report(format!("Could not find a type for '{}'", ilv.name));
                false
            }
        },

        LValue::SelfLv(slv) => match scope.lookup_variable("__self__") {
            Some((ty, _)) => {
                slv.cached = ty;
                false
            }
            None => {
                ctx.errors.report("Could not find a type for self");
                false
            }
        },

        LValue::Deref(inner) => {
            let assignable = check_assignable(inner, scope, ctx);
            if !matches!(inner.ty(), Type::Pointer(_)) {
                ctx.errors.report("Dereferencing lvalue is not a pointer");
            }
            assignable
        }

        LValue::Access(alv) => {
            let mut assignable = check_assignable(&mut alv.inner, scope, ctx);
            if !ctx.errors.clean() {
                return false;
            }

            // Fields of self are writable even though self itself is not.
            if matches!(&*alv.inner, LValue::SelfLv(_)) {
                assignable = true;
            }

            let inner_ty = alv.inner.ty().unwrapped().clone();
            let Type::Struct(sid) = inner_ty else {
                ctx.errors.report(format!(
                    "Cannot assign to a field of a non-struct type: {inner_ty}"
                ));
                return false;
            };

            let Some(layout) = scope.lookup_struct(&sid) else {
                ctx.errors
                    .report(format!("Could not find struct of type {sid}"));
                return false;
            };

            let Some(field) = layout.field(&alv.field_name) else {
                ctx.errors
                    .report(format!("Could not find field named {}", alv.field_name));
                return false;
            };

            alv.cached = field.ty;
            assignable
        }

        LValue::Index(ilv) => {
            check_expr(&mut ilv.index, scope, ctx);
            let assignable = check_assignable(&mut ilv.indexed, scope, ctx);
            if !ctx.errors.clean() {
                return false;
            }

            let indexed_ty = ilv.indexed.ty().unwrapped().clone();
            match indexed_ty {
                Type::Vector(element) => ilv.cached = *element,
                Type::Str => ilv.cached = Type::Character,
                other => {
                    ctx.errors
                        .report(format!("Can only index vector or string lvalues ({other})"));
                }
            }

            assignable
        }

        LValue::Multiple(lvs) => {
            let mut assignable = true;
            for lv in lvs {
                if !check_assignable(lv, scope, ctx) {
                    assignable = false;
                }
            }
            assignable
        }
    }
}

/// Introduce the binding(s) a `let`/`const` declares.
pub fn update_scope(
    lv: &mut LValue,
    scope: &Scope,
    ty: &Type,
    assignable: bool,
) -> Result<(), String> {
    match lv {
        LValue::Ident(ilv) => {
            if scope.defined_at_this_level(&ilv.name) {
                return Err(format!(
                    "'{}' has already been defined in this scope and cannot be redefined",
                    ilv.name
                ));
            }
            scope.set_variable(&ilv.name, ty.clone(), assignable);
            ilv.cached = ty.clone();
            Ok(())
        }

        LValue::SelfLv(_) => {
            scope.set_variable("__self__", Type::pointer(ty.clone()), assignable);
            Ok(())
        }

        LValue::Deref(_) | LValue::Access(_) | LValue::Index(_) => {
            Err("this lvalue cannot introduce a binding".to_string())
        }

        LValue::Multiple(lvs) => {
            let Type::Tuple(items) = ty else {
                return Err("type assigned to multiple lvalues must be a tuple".to_string());
            };

            if lvs.len() != items.len() {
                return Err("Wrong number of lvalues on LHS of multiple assign".to_string());
            }

            for (lv, item) in lvs.iter_mut().zip(items.iter()) {
                update_scope(lv, scope, item, assignable)?;
            }
            Ok(())
        }
    }
}
