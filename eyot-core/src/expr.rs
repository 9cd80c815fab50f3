#![forbid(unsafe_code)]

use eyot_ast::{
    AccessExpr, AssignKind, AssignStmt, BinaryOp, CallExpr, ClosureArgDecl, ClosureExpr,
    CreatePipelineExpr, CreateWorkerExpr, DerefExpr, Expr, ExprStmt, FunctionDefinition,
    FunctionId, FunctionParameter, FunctionType, GpuKernelTle, Ident, IndexedKind, IntLit, LValue,
    Locus, ReceiveWorkerExpr, Scope, SizeofExpr, StatementBlock, StatementContainer, Stmt,
    StructLitPair, Tle, Type, UnaryExpr, UnaryOp, WorkerDestination,
};

use crate::context::{Context, Pass};

/// Walk one expression for the current pass. During mutation some nodes
/// rewrite themselves in place and queue supporting statements through
/// the context's insertion buffers.
pub fn check_expr(e: &mut Expr, scope: &Scope, ctx: &mut Context) {
    match e {
        Expr::Null => {}

        Expr::Bool(_) => ctx.require_type(&Type::Boolean, scope),
        Expr::Character(_) => ctx.require_type(&Type::Character, scope),
        Expr::Int(_) => ctx.require_type(&Type::Integer, scope),
        Expr::Float(f) => {
            let ty = Type::Float { width: f.width };
            ctx.require_type(&ty, scope);
        }

        Expr::Str(s) => {
            if ctx.pass == Pass::CheckTypes {
                s.id = ctx.string_id(&s.value);
            }
            ctx.require_type(&Type::Str, scope);
        }

        Expr::Sizeof(_) => {}

        Expr::SelfRef(s) => {
            if ctx.pass == Pass::SetTypes {
                match scope.lookup_variable("__self__") {
                    Some((ty, _)) => {
                        s.cached = ty.clone();
                        ctx.require_type(&ty, scope);
                    }
                    None => ctx.errors.report("Could not find a type for self"),
                }
            }
        }

        Expr::Ident(it) => check_ident(it, scope, ctx),

        Expr::GpuBuiltin(g) => {
            if g.signature().is_none() {
                ctx.errors.report(format!("No such gpu builtin {}", g.name));
            }
            ctx.note_gpu_required("gpu builtin");
        }

        Expr::StructLit(lit) => {
            for pair in &mut lit.pairs {
                check_expr(&mut pair.value, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            }

            if ctx.pass == Pass::Mutate {
                if let Some(layout) = scope.lookup_struct(&lit.id) {
                    for field in &layout.fields {
                        if lit.pairs.iter().any(|p| p.field_name == field.name) {
                            continue;
                        }

                        let Some(value) = field.ty.default_value_expression(scope) else {
                            ctx.errors.report(format!(
                                "No default value for '{}' on type {}",
                                field.name,
                                Type::Struct(lit.id.clone())
                            ));
                            return;
                        };

                        lit.pairs.push(StructLitPair {
                            field_name: field.name.clone(),
                            value,
                        });
                    }
                }
            }

            let ty = Type::Struct(lit.id.clone());
            ctx.require_type(&ty, scope);
        }

        Expr::Tuple(t) => {
            for item in &mut t.items {
                check_expr(item, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            }

            let ty = Type::Tuple(t.items.iter().map(Expr::ty).collect());
            ctx.require_type(&ty, scope);
        }

        Expr::Access(ae) => check_access(ae, scope, ctx),

        Expr::Binary(be) => {
            check_expr(&mut be.lhs, scope, ctx);
            check_expr(&mut be.rhs, scope, ctx);
            if !ctx.errors.clean() {
                return;
            }

            if ctx.pass == Pass::SetTypes {
                let lt = be.lhs.ty();
                let rt = be.rhs.ty();
                let mismatch = format!("Mismatched types in binary operator '{lt}' vs '{rt}'");

                match be.op {
                    BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide => {
                        if !lt.numerically_compatible(&rt) {
                            ctx.errors.report(mismatch);
                            return;
                        }
                        be.cached = arithmetic_type_combine(lt, rt);
                    }

                    BinaryOp::Mod => {
                        if lt != Type::Integer {
                            ctx.errors.report("Left hand side of '%' must be integer");
                            return;
                        }
                        if rt != Type::Integer {
                            ctx.errors.report("Right hand side of '%' must be integer");
                            return;
                        }
                        be.cached = lt;
                    }

                    BinaryOp::Equality | BinaryOp::Inequality => {
                        let null_pointer = matches!(
                            (&lt, &rt),
                            (Type::Pointer(_), Type::Null) | (Type::Null, Type::Pointer(_))
                        );
                        if !null_pointer && lt != rt {
                            ctx.errors.report(mismatch);
                            return;
                        }
                        be.cached = Type::Boolean;
                    }

                    BinaryOp::Lt
                    | BinaryOp::Lte
                    | BinaryOp::Gt
                    | BinaryOp::Gte
                    | BinaryOp::And
                    | BinaryOp::Or => {
                        if lt != rt {
                            ctx.errors.report(mismatch);
                            return;
                        }
                        be.cached = Type::Boolean;
                    }
                }

                let cached = be.cached.clone();
                ctx.require_type(&cached, scope);
            }
        }

        Expr::Unary(ue) => {
            check_expr(&mut ue.rhs, scope, ctx);
            if !ctx.errors.clean() {
                return;
            }

            if ctx.pass == Pass::SetTypes {
                let ty = ue.rhs.ty();
                match ue.op {
                    UnaryOp::Not => {
                        if ty != Type::Boolean {
                            ctx.errors
                                .report("Not operator cannot be applied to non-boolean type");
                            return;
                        }
                        ue.cached = Type::Boolean;
                    }
                    UnaryOp::AddressOf => {
                        ue.cached = Type::pointer(ty);
                    }
                    UnaryOp::Negate => {
                        if !ty.is_numeric() {
                            ctx.errors
                                .report("Negation operator cannot be applied to non-numeric type");
                            return;
                        }
                        ue.cached = ty;
                    }
                }

                let cached = ue.cached.clone();
                ctx.require_type(&cached, scope);
            }
        }

        Expr::Index(ie) => {
            check_expr(&mut ie.indexed, scope, ctx);
            if !ctx.errors.clean() {
                return;
            }
            check_expr(&mut ie.index, scope, ctx);
            if !ctx.errors.clean() {
                return;
            }

            if ctx.pass == Pass::SetTypes {
                let at = ie.indexed.ty().unwrapped().clone();
                match at {
                    Type::Vector(element) => {
                        ie.cached = *element;
                        ie.kind = IndexedKind::Vector;
                    }
                    Type::Str => {
                        ie.cached = Type::Character;
                        ie.kind = IndexedKind::Str;
                    }
                    other => {
                        ctx.errors
                            .report(format!("Attempting to index a non-vector type {other}"));
                        return;
                    }
                }

                let it = ie.index.ty();
                if it != Type::Integer {
                    ctx.errors
                        .report(format!("Attempting to index a vector using non-integer {it}"));
                    return;
                }

                let cached = ie.cached.clone();
                ctx.require_type(&cached, scope);
            }
        }

        Expr::Call(c) => check_call(c, scope, ctx),

        Expr::New(n) => {
            ctx.note_cpu_required("new expression");

            match ctx.pass {
                Pass::SetTypes => {
                    check_expr(&mut n.init, scope, ctx);
                    if !ctx.errors.clean() {
                        return;
                    }
                    let ty = n.init.ty();
                    ctx.require_type(&ty, scope);
                }

                Pass::Mutate => {
                    // Let the initializer rewrite itself first.
                    check_expr(&mut n.init, scope, ctx);
                    if !ctx.errors.clean() {
                        return;
                    }

                    let temp = ctx.temp_name();
                    let ty = n.init.ty();
                    let pointer_ty = Type::pointer(ty.clone());
                    let init = std::mem::replace(&mut *n.init, Expr::Null);

                    // let t = ey_runtime_gc_alloc(ey_runtime_gc(ctx), sizeof(T), 0)
                    let gc = Expr::Call(CallExpr::runtime("ey_runtime_gc", Vec::new(), Type::Void));
                    let mut alloc = CallExpr::runtime(
                        "ey_runtime_gc_alloc",
                        vec![
                            gc,
                            Expr::Sizeof(SizeofExpr { sized: ty.clone() }),
                            Expr::Int(IntLit { value: 0 }),
                        ],
                        pointer_ty.clone(),
                    );
                    alloc.skip_execution_context = true;

                    // The temporary is not pinned: the allocation is kept
                    // alive by GC inspection of the roots.
                    ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                        &temp,
                        pointer_ty.clone(),
                        Some(Expr::Call(alloc)),
                        false,
                    )));
                    scope.set_variable(&temp, pointer_ty.clone(), true);

                    // *t = initializer
                    ctx.insert_statement_before(Stmt::Assign(AssignStmt {
                        lhs: LValue::Deref(Box::new(LValue::ident(&temp))),
                        rhs: Some(init),
                        kind: AssignKind::Normal,
                        new_type: ty,
                        pin_pointers: false,
                    }));

                    *e = Expr::Ident(Ident::raw(temp, pointer_ty));
                }

                Pass::CheckTypes => {}
            }
        }

        Expr::Deref(de) => {
            check_expr(&mut de.pointer, scope, ctx);
            if !ctx.errors.clean() {
                return;
            }

            if !matches!(de.pointer.ty(), Type::Pointer(_)) {
                ctx.errors
                    .report("Attempting to dereference something that is not a pointer");
            }
        }

        Expr::VectorLit(vl) => {
            ctx.note_cpu_required("vector literal");

            for item in &mut vl.items {
                check_expr(item, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }

                let ty = item.ty();
                if !ty.can_assign_to(&vl.element_type) {
                    ctx.errors.report(format!(
                        "Bad type in vector literal. Have {ty}, expecting {}",
                        vl.element_type
                    ));
                    return;
                }
            }

            if ctx.pass == Pass::Mutate {
                let vector_name = ctx.temp_name();
                let element_type = vl.element_type.clone();
                let vector_ty = Type::vector(element_type.clone());
                let items = std::mem::take(&mut vl.items);

                // let v = ey_vector_create(sizeof(T))
                let create = CallExpr::runtime(
                    "ey_vector_create",
                    vec![Expr::Sizeof(SizeofExpr {
                        sized: element_type.clone(),
                    })],
                    vector_ty.clone(),
                );
                ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                    &vector_name,
                    vector_ty.clone(),
                    Some(Expr::Call(create)),
                    false,
                )));

                for item in items {
                    let temp = ctx.temp_name();

                    // let t = item  (the C compiler coerces the element type)
                    ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                        &temp,
                        element_type.clone(),
                        Some(item),
                        false,
                    )));

                    // ey_vector_append(v, &t)
                    let append = CallExpr::runtime(
                        "ey_vector_append",
                        vec![
                            Expr::Ident(Ident::raw(&vector_name, vector_ty.clone())),
                            Expr::Unary(UnaryExpr {
                                op: UnaryOp::AddressOf,
                                rhs: Box::new(Expr::Ident(Ident::raw(&temp, element_type.clone()))),
                                cached: Type::pointer(element_type.clone()),
                            }),
                        ],
                        Type::Void,
                    );
                    ctx.insert_statement_before(Stmt::Expr(ExprStmt {
                        expr: Expr::Call(append),
                    }));
                }

                *e = Expr::Ident(Ident::raw(vector_name, vector_ty));
            }
        }

        Expr::Range(re) => {
            check_expr(&mut re.count, scope, ctx);
            check_expr(&mut re.start, scope, ctx);
            check_expr(&mut re.step, scope, ctx);

            match ctx.pass {
                Pass::SetTypes => {
                    // Checked before the loop rewrite optimizes it away.
                    let count = re.count.ty();
                    ctx.assert_integer(&count);
                    let start = re.start.ty();
                    ctx.assert_integer(&start);
                    let step = re.step.ty();
                    ctx.assert_integer(&step);
                }
                Pass::CheckTypes => {
                    ctx.note_cpu_required("create range expression");
                }
                Pass::Mutate => {}
            }
        }

        Expr::Closure(ce) => check_closure(ce, scope, ctx),

        Expr::CreateWorker(we) => check_create_worker(we, scope, ctx),

        Expr::ReceiveWorker(re) => check_receive_worker(re, scope, ctx),

        Expr::CreatePipeline(pe) => check_create_pipeline(pe, scope, ctx),

        Expr::Cast(ce) => {
            check_expr(&mut ce.casted, scope, ctx);
            if !ctx.errors.clean() {
                return;
            }

            match ctx.pass {
                Pass::SetTypes => {
                    let ty = ce.new_type.clone();
                    ctx.require_type(&ty, scope);
                }
                Pass::CheckTypes => {
                    if ce.check_castable && !ce.casted.ty().can_assign_to(&ce.new_type) {
                        ctx.errors.report(format!(
                            "cannot cast {} to {}",
                            ce.casted.ty(),
                            ce.new_type
                        ));
                    }
                }
                Pass::Mutate => {}
            }
        }
    }
}

fn arithmetic_type_combine(lhs: Type, rhs: Type) -> Type {
    match (&lhs, &rhs) {
        (Type::Float { width: lw }, Type::Float { width: rw }) => {
            if lw > rw {
                lhs
            } else {
                rhs
            }
        }
        _ => lhs,
    }
}

fn check_ident(it: &mut Ident, scope: &Scope, ctx: &mut Context) {
    if it.type_set_in_parse {
        return;
    }

    match ctx.pass {
        Pass::SetTypes => match scope.lookup_variable(&it.name) {
            Some((ty, _)) => {
                it.cached = ty.clone();
                ctx.require_type(&ty, scope);
            }
            None => {
                ctx.errors
                    .report(format!("Failed to find variable type {}", it.name));
            }
        },

        Pass::Mutate => {
            if let Type::Function(ft) = &it.cached {
                if ft.builtin {
                    it.dont_namespace = true;
                } else if it.fid.is_none() {
                    // Resolution happens here rather than in the first
                    // pass so functions defined below the use resolve.
                    match ctx.lookup_module_function(&it.name) {
                        Some(fid) => it.fid = Some(fid),
                        None => ctx.errors.report(format!(
                            "Failed to find function {} in current module",
                            it.name
                        )),
                    }
                }
            }
        }

        Pass::CheckTypes => {}
    }
}

fn check_access(ae: &mut AccessExpr, scope: &Scope, ctx: &mut Context) {
    check_expr(&mut ae.accessed, scope, ctx);
    if !ctx.errors.clean() {
        return;
    }

    if ctx.pass != Pass::SetTypes {
        return;
    }

    let ty = ae.accessed.ty().unwrapped().clone();
    match ty {
        Type::Struct(sid) => {
            let Some(layout) = scope.lookup_struct(&sid) else {
                ctx.errors
                    .report(format!("Could not find struct named {sid}"));
                return;
            };

            let Some(field) = layout.field(&ae.field) else {
                ctx.errors.report(format!(
                    "Do not recognise field '{}' on type {}",
                    ae.field,
                    ae.accessed.ty()
                ));
                return;
            };

            ae.cached = field.ty.clone();
            ctx.require_type(&field.ty, scope);
        }

        Type::Str => match ae.field.as_str() {
            "resize" => {
                ae.cached = Type::function(Vec::new(), Type::Void, Locus::Cpu);
            }
            "length" => {
                ae.cached = Type::function(Vec::new(), Type::Integer, Locus::Anywhere);
            }
            _ => {
                ctx.errors.report(format!(
                    "Do not recognise field '{}' on type {}",
                    ae.field,
                    ae.accessed.ty()
                ));
            }
        },

        Type::Vector(_) => match ae.field.as_str() {
            "append" | "resize" | "erase" => {
                ae.cached = Type::function(Vec::new(), Type::Void, Locus::Cpu);
            }
            "length" => {
                ae.cached = Type::function(Vec::new(), Type::Integer, Locus::Cpu);
            }
            _ => {
                ctx.errors.report(format!(
                    "Do not recognise field '{}' on type {}",
                    ae.field,
                    ae.accessed.ty()
                ));
            }
        },

        Type::Worker { .. } if ae.allow_raw => {}

        other => {
            ctx.errors.report(format!(
                "Tried to take a field value of a non-struct type in access expression: {other}"
            ));
        }
    }
}

/// `print` / `print_ln` callee detection: `Some(true)` for the
/// newline-appending form.
fn call_print_kind(c: &CallExpr) -> Option<bool> {
    if let Expr::Ident(it) = &*c.callee {
        match it.name.as_str() {
            "print_ln" => return Some(true),
            "print" => return Some(false),
            _ => {}
        }
    }
    None
}

fn check_call(c: &mut CallExpr, scope: &Scope, ctx: &mut Context) {
    match ctx.pass {
        Pass::SetTypes => {
            if call_print_kind(c).is_some() {
                c.ignore_type_checks = true;

                if let Expr::Ident(it) = &mut *c.callee {
                    it.cached = Type::Function(FunctionType {
                        params: Vec::new(),
                        ret: Box::new(Type::Void),
                        locus: Locus::Anywhere,
                        builtin: false,
                        bound_struct: None,
                    });
                    let ty = it.cached.clone();
                    ctx.require_type(&ty, scope);
                }
            } else {
                check_expr(&mut c.callee, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }

                if let Expr::Access(ae) = &*c.callee {
                    if let Type::Vector(element) = ae.accessed.ty().unwrapped() {
                        let element = (**element).clone();
                        ctx.require_vector(&element, scope);
                    }
                }
            }

            for arg in &mut c.args {
                check_expr(arg, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            }

            let ty = c.callee.ty();
            match ty {
                Type::Function(ft) => {
                    if ft.locus == Locus::Cpu {
                        ctx.note_cpu_required("function call");
                    }
                    c.cached = *ft.ret;
                }
                Type::Closure { ret, .. } => {
                    // Closure dispatch goes through the host runtime.
                    ctx.note_cpu_required("function call");
                    c.cached = *ret;
                }
                other => {
                    ctx.errors
                        .report(format!("Expression not callable: is of type '{other}'"));
                }
            }
        }

        Pass::Mutate => {
            if matches!(&*c.callee, Expr::GpuBuiltin(_)) {
                c.skip_execution_context = true;
            } else if matches!(&*c.callee, Expr::Access(_)) {
                mutate_method_call(c, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            } else if let Some(with_nl) = call_print_kind(c) {
                mutate_print(c, with_nl, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            } else {
                check_expr(&mut c.callee, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            }

            for arg in &mut c.args {
                check_expr(arg, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            }

            if matches!(c.callee.ty(), Type::Closure { .. }) {
                mutate_closure_call(c, scope, ctx);
            }
        }

        Pass::CheckTypes => {
            if !c.ignore_type_checks {
                let ty = c.callee.ty();
                if !ty.is_callable() {
                    ctx.errors
                        .report(format!("Expression of type '{ty}' not callable"));
                    return;
                }

                let params = match &ty {
                    Type::Function(ft) => ft.params.clone(),
                    Type::Closure { params, .. } => params.clone(),
                    _ => Vec::new(),
                };

                if params.len() != c.args.len() {
                    ctx.errors.report(format!(
                        "Wrong number of arguments in call expression, have {}, expecting {}",
                        c.args.len(),
                        params.len()
                    ));
                    return;
                }

                for (param, arg) in params.iter().zip(c.args.iter()) {
                    let arg_ty = arg.ty();
                    if !param.can_assign_to(&arg_ty) {
                        ctx.errors.report(format!(
                            "Wrong argument type in call expression, have {arg_ty}, expecting {param}"
                        ));
                    }
                }
            }

            if !ctx.errors.clean() {
                return;
            }

            for arg in &mut c.args {
                check_expr(arg, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }
            }
        }
    }
}

/// Desugar `receiver.method(args)` and the built-in string/vector
/// methods. Runs during mutation with the callee known to be an access
/// expression.
fn mutate_method_call(c: &mut CallExpr, scope: &Scope, ctx: &mut Context) {
    check_expr(&mut c.callee, scope, ctx);
    if !ctx.errors.clean() {
        return;
    }

    enum Rewrite {
        Method {
            receiver: Expr,
            fid: FunctionId,
            ret: Type,
        },
        Runtime {
            name: &'static str,
            receiver: Expr,
            ret: Type,
        },
        TypedAppend {
            receiver: Expr,
            element: Type,
        },
        Keep,
    }

    let rewrite = {
        let Expr::Access(ae) = &mut *c.callee else {
            return;
        };

        let accessed_ty = ae.accessed.ty();
        match accessed_ty.unwrapped().clone() {
            Type::Struct(sid) => {
                // A method call on an accessed value, e.g.
                // a_rectangle.area(): convert to a fully qualified call
                // with the receiver as a leading pointer argument.
                let already_pointer = matches!(accessed_ty, Type::Pointer(_));

                let fid = FunctionId::method(sid.module.clone(), sid.clone(), ae.field.clone());
                let ret = match &ae.cached {
                    Type::Function(ft) => (*ft.ret).clone(),
                    _ => Type::Void,
                };

                let mut receiver = std::mem::replace(&mut *ae.accessed, Expr::Null);
                if !already_pointer {
                    let pointee = receiver.ty();
                    receiver = Expr::Unary(UnaryExpr {
                        op: UnaryOp::AddressOf,
                        rhs: Box::new(receiver),
                        cached: Type::pointer(pointee),
                    });
                }

                Rewrite::Method { receiver, fid, ret }
            }

            Type::Str => match ae.field.as_str() {
                "length" => Rewrite::Runtime {
                    name: "ey_runtime_string_character_length",
                    receiver: std::mem::replace(&mut *ae.accessed, Expr::Null),
                    ret: Type::Integer,
                },
                "resize" => {
                    if c.args.len() != 1 {
                        ctx.errors
                            .report("String resize takes a single argument");
                        return;
                    }
                    if c.args[0].ty() != Type::Integer {
                        ctx.errors
                            .report("String.resize() takes a single integer argument");
                        return;
                    }
                    Rewrite::Runtime {
                        name: "ey_runtime_string_resize",
                        receiver: std::mem::replace(&mut *ae.accessed, Expr::Null),
                        ret: Type::Void,
                    }
                }
                _ => Rewrite::Keep,
            },

            Type::Vector(element) => match ae.field.as_str() {
                "erase" => {
                    if c.args.is_empty() || c.args.len() > 2 {
                        ctx.errors.report("Vector erase takes one or two arguments");
                        return;
                    }
                    if c.args[0].ty() != Type::Integer {
                        ctx.errors
                            .report("Vector.erase's first argument should be an integer");
                        return;
                    }
                    if c.args.len() > 1 && c.args[1].ty() != Type::Integer {
                        ctx.errors
                            .report("Vector.erase's second argument should be an integer");
                        return;
                    }
                    if c.args.len() == 1 {
                        c.args.push(Expr::Int(IntLit { value: 1 }));
                    }
                    Rewrite::Runtime {
                        name: "ey_vector_erase",
                        receiver: std::mem::replace(&mut *ae.accessed, Expr::Null),
                        ret: Type::Void,
                    }
                }
                "append" => Rewrite::TypedAppend {
                    receiver: std::mem::replace(&mut *ae.accessed, Expr::Null),
                    element: (*element).clone(),
                },
                "resize" => {
                    if c.args.len() != 1 {
                        ctx.errors
                            .report("Vector resize takes a single argument");
                        return;
                    }
                    if c.args[0].ty() != Type::Integer {
                        ctx.errors
                            .report("Vector.resize() takes a single integer argument");
                        return;
                    }
                    Rewrite::Runtime {
                        name: "ey_vector_resize",
                        receiver: std::mem::replace(&mut *ae.accessed, Expr::Null),
                        ret: Type::Void,
                    }
                }
                "length" => Rewrite::Runtime {
                    name: "ey_vector_length",
                    receiver: std::mem::replace(&mut *ae.accessed, Expr::Null),
                    ret: Type::Integer,
                },
                _ => Rewrite::Keep,
            },

            _ => Rewrite::Keep,
        }
    };

    match rewrite {
        Rewrite::Keep => {}

        Rewrite::Method { receiver, fid, ret } => {
            c.args.insert(0, receiver);

            let called_type = Type::Function(FunctionType {
                params: c.args.iter().map(Expr::ty).collect(),
                ret: Box::new(ret),
                locus: Locus::Cpu,
                builtin: false,
                bound_struct: None,
            });

            c.callee = Box::new(Expr::Ident(Ident {
                name: fid.name.clone(),
                dont_namespace: false,
                fid: Some(fid),
                cached: called_type,
                type_set_in_parse: false,
            }));
        }

        Rewrite::Runtime {
            name,
            receiver,
            ret,
        } => {
            c.ignore_type_checks = true;
            c.args.insert(0, receiver);
            c.callee = Box::new(Expr::Ident(Ident::raw(
                name,
                Type::builtin_function(Vec::new(), ret),
            )));
        }

        Rewrite::TypedAppend { receiver, element } => {
            let receiver_ty = receiver.ty();
            c.args.insert(0, receiver);
            c.callee = Box::new(Expr::Ident(Ident::raw(
                element.vector_append_name(),
                Type::builtin_function(vec![receiver_ty, element], Type::Void),
            )));
        }
    }
}

/// Rewrite `print`/`print_ln`: evaluate every argument into a pinned
/// temporary (side effects happen in order), emit one typed print call
/// per argument, and gut the original call to the newline helper or a
/// no-op.
fn mutate_print(c: &mut CallExpr, with_nl: bool, scope: &Scope, ctx: &mut Context) {
    let args = std::mem::take(&mut c.args);
    let mut values = Vec::new();

    for mut arg in args {
        check_expr(&mut arg, scope, ctx);
        if !ctx.errors.clean() {
            return;
        }

        let ty = arg.ty();
        let helper = match &ty {
            Type::Integer => "ey_print_int",
            Type::Float { width: 32 } => "ey_print_float32",
            Type::Float { .. } => "ey_print_float64",
            Type::Str => "ey_print_string",
            Type::Boolean => "ey_print_boolean",
            Type::Character => "ey_print_character",
            other => {
                ctx.errors
                    .report(format!("print_ln can't handle type '{other}' (yet)"));
                return;
            }
        };

        let name = ctx.temp_name();
        ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
            &name,
            ty.clone(),
            Some(arg),
            true,
        )));
        values.push((name, ty, helper));
    }

    for (name, ty, helper) in values {
        let call = CallExpr::runtime(helper, vec![Expr::Ident(Ident::raw(name, ty))], Type::Void);
        ctx.insert_statement_before(Stmt::Expr(ExprStmt {
            expr: Expr::Call(call),
        }));
    }

    // All that remains is the newline, so gut this call and keep that.
    c.ignore_type_checks = true;
    c.args = Vec::new();
    c.callee = Box::new(Expr::Ident(Ident::raw(
        if with_nl { "ey_print_nl" } else { "ey_noop" },
        Type::builtin_function(Vec::new(), Type::Void),
    )));
}

/// Rewrite a call through a closure value into an out-of-place
/// `ey_closure_call`. The argument pack is materialized as an address
/// array; a non-void result comes back through a pinned temporary.
fn mutate_closure_call(c: &mut CallExpr, _scope: &Scope, ctx: &mut Context) {
    let (params, ret) = match c.callee.ty() {
        Type::Closure { params, ret } => (params, *ret),
        _ => return,
    };

    // The node is gutted below, so arity and argument types are settled
    // here rather than in the final pass.
    if params.len() != c.args.len() {
        ctx.errors.report(format!(
            "Wrong number of arguments in call expression, have {}, expecting {}",
            c.args.len(),
            params.len()
        ));
        return;
    }
    for (param, arg) in params.iter().zip(c.args.iter()) {
        let arg_ty = arg.ty();
        if !param.can_assign_to(&arg_ty) {
            ctx.errors.report(format!(
                "Wrong argument type in call expression, have {arg_ty}, expecting {param}"
            ));
            return;
        }
    }

    let args_name = ctx.temp_name();
    let mut arg_names = Vec::new();

    for arg in std::mem::take(&mut c.args) {
        let name = ctx.temp_name();
        let ty = arg.ty();
        ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
            &name,
            ty,
            Some(arg),
            true,
        )));
        arg_names.push(name);
    }

    ctx.insert_statement_before(Stmt::ClosureArgDecl(ClosureArgDecl {
        name: args_name.clone(),
        args: arg_names,
        address_of: true,
    }));

    let closure_value = (*c.callee).clone();

    if ret == Type::Void {
        let call = CallExpr::runtime(
            "ey_closure_call",
            vec![
                closure_value,
                Expr::Int(IntLit { value: 0 }),
                Expr::Ident(Ident::raw(&args_name, Type::Void)),
            ],
            Type::Void,
        );
        ctx.insert_statement_before(Stmt::Expr(ExprStmt {
            expr: Expr::Call(call),
        }));

        c.callee = Box::new(Expr::Ident(Ident::raw(
            "ey_noop",
            Type::builtin_function(Vec::new(), Type::Void),
        )));
        c.ignore_type_checks = true;
        c.cached = Type::Void;
        return;
    }

    let result_name = ctx.temp_name();
    ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
        &result_name,
        ret.clone(),
        None,
        true,
    )));

    let call = CallExpr::runtime(
        "ey_closure_call",
        vec![
            closure_value,
            Expr::Unary(UnaryExpr {
                op: UnaryOp::AddressOf,
                rhs: Box::new(Expr::Ident(Ident::raw(&result_name, ret.clone()))),
                cached: Type::pointer(ret.clone()),
            }),
            Expr::Ident(Ident::raw(&args_name, Type::Void)),
        ],
        Type::Void,
    );
    ctx.insert_statement_before(Stmt::Expr(ExprStmt {
        expr: Expr::Call(call),
    }));

    c.stacked_result = Some(result_name);
    c.ignore_type_checks = true;
    c.cached = ret;
}

fn check_closure(ce: &mut ClosureExpr, scope: &Scope, ctx: &mut Context) {
    check_expr(&mut ce.callee, scope, ctx);
    if !ctx.errors.clean() {
        return;
    }

    let callee_ty = ce.callee.ty();

    match ctx.pass {
        Pass::SetTypes => {
            // Settle the argument count early; a mismatch would corrupt
            // everything downstream.
            let param_count = match &callee_ty {
                Type::Function(ft) => Some(ft.params.len()),
                Type::Closure { params, .. } => Some(params.len()),
                _ => None,
            };

            if let Some(count) = param_count {
                if count != ce.supplied.len() {
                    ctx.errors.report(format!(
                        "Cannot partially apply {} arguments to a function of {} arguments",
                        ce.supplied.len(),
                        count
                    ));
                    return;
                }
            }

            ce.arg_array_name = ctx.temp_name();
        }

        Pass::Mutate => {
            // Freeze the supplied arguments into variables; placeholder
            // positions stay empty in the address array.
            ce.arg_variables = vec![String::new(); ce.supplied.len()];

            for (i, slot) in ce.supplied.iter_mut().enumerate() {
                let Some(arg) = slot else { continue };

                check_expr(arg, scope, ctx);
                if !ctx.errors.clean() {
                    return;
                }

                let name = ctx.temp_name();
                ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                    &name,
                    arg.ty(),
                    Some(arg.clone()),
                    false,
                )));
                ce.arg_variables[i] = name;
            }

            ctx.insert_statement_before(Stmt::ClosureArgDecl(ClosureArgDecl {
                name: ce.arg_array_name.clone(),
                args: ce.arg_variables.clone(),
                address_of: true,
            }));
        }

        Pass::CheckTypes => {
            let params = match &callee_ty {
                Type::Function(ft) => &ft.params,
                Type::Closure { params, .. } => params,
                _ => {
                    ctx.errors
                        .report("Called expression in partial is not callable");
                    return;
                }
            };

            let mut size_estimate = 8usize;
            for ty in params {
                size_estimate += ty.estimate_c_size(scope);
                size_estimate += 8;
            }
            ctx.require_closure_size(size_estimate);

            match &callee_ty {
                Type::Function(ft) if ft.builtin => {
                    ctx.errors
                        .report("Cannot partially apply a builtin function");
                }
                Type::Function(_) => match &*ce.callee {
                    Expr::Ident(it) => match &it.fid {
                        Some(fid) => ce.called_fid = Some(fid.clone()),
                        None => ctx
                            .errors
                            .report("Called expression in partial did not resolve to a function"),
                    },
                    _ => {
                        ctx.errors
                            .report("Called expression in partial is not an identifier");
                    }
                },
                _ => {
                    ctx.errors
                        .report("Cannot create a closure from another closure yet");
                }
            }
        }
    }
}

fn check_create_worker(we: &mut CreateWorkerExpr, scope: &Scope, ctx: &mut Context) {
    ctx.note_cpu_required("create worker");

    match ctx.pass {
        Pass::SetTypes => {
            check_expr(&mut we.worker, scope, ctx);
            if !ctx.errors.clean() {
                return;
            }

            if we.destination == WorkerDestination::Gpu {
                ctx.set_gpu_required();
            }

            let worker_ty = we.worker.ty();
            let (params, ret) = match &worker_ty {
                Type::Function(ft) => (&ft.params, &ft.ret),
                Type::Closure { params, ret } => {
                    we.closure_variable = Some(ctx.temp_name());
                    (params, ret)
                }
                _ => {
                    ctx.errors
                        .report("A create worker expression must be passed something callable");
                    return;
                }
            };

            if params.len() != 1 {
                ctx.errors.report(
                    "A create worker expression must be passed a function with a single parameter",
                );
                return;
            }

            we.send_ty = params[0].clone();
            we.recv_ty = (**ret).clone();
        }

        Pass::Mutate => {
            check_expr(&mut we.worker, scope, ctx);
            if !ctx.errors.clean() {
                return;
            }

            we.wrapper_id = Some(FunctionId::free(
                ctx.module_id().clone(),
                format!("generated_wrapper_{}", ctx.unique_id()),
            ));

            if we.destination == WorkerDestination::Gpu {
                for ty in [&we.send_ty, &we.recv_ty] {
                    if let Err(offending) = scope.can_pass_to_gpu(ty) {
                        if *ty == offending {
                            ctx.errors.report(format!(
                                "Worker creation uses type that cannot be passed to GPU '{ty}'"
                            ));
                        } else {
                            ctx.errors.report(format!(
                                "Worker creation uses type that cannot be passed to GPU '{offending}' embedded in '{ty}'"
                            ));
                        }
                    }
                }
                if !ctx.errors.clean() {
                    return;
                }
            }

            if let Some(closure_variable) = &we.closure_variable {
                // Put a copy of the closure on the stack for the runtime
                // to pack from.
                let ct = we.worker.ty();
                ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                    closure_variable,
                    ct,
                    Some((*we.worker).clone()),
                    true,
                )));
            }

            match we.destination {
                WorkerDestination::Gpu => mutate_gpu_worker(we, ctx),
                WorkerDestination::Cpu => mutate_cpu_worker(we, scope, ctx),
            }
        }

        Pass::CheckTypes => {
            check_expr(&mut we.worker, scope, ctx);
        }
    }
}

fn mutate_gpu_worker(we: &mut CreateWorkerExpr, ctx: &mut Context) {
    let kernel_id = FunctionId::free(
        ctx.module_id().clone(),
        format!("ey_generated_kernel_{}", ctx.unique_id()),
    );

    let kernel = if matches!(we.worker.ty(), Type::Closure { .. }) {
        GpuKernelTle {
            kernel_id: kernel_id.clone(),
            is_closure_worker: true,
            worker_id: None,
            input: we.send_ty.clone(),
            output: we.recv_ty.clone(),
        }
    } else {
        let Expr::Ident(it) = &*we.worker else {
            // The kernel call is resolved at C generation time, so the
            // target has to be a plain function name.
            ctx.errors
                .report("A create worker expression must be passed a function name (for now)");
            return;
        };

        let Some(fid) = it.fid.clone() else {
            ctx.errors
                .report("Worker function did not resolve to a known function");
            return;
        };

        GpuKernelTle {
            kernel_id: kernel_id.clone(),
            is_closure_worker: false,
            worker_id: Some(fid),
            input: we.send_ty.clone(),
            output: we.recv_ty.clone(),
        }
    };

    we.kernel_id = Some(kernel_id);
    ctx.insert_element_before(Tle::GpuKernel(kernel));
}

/// Synthesize the CPU worker wrapper: a void(void*, void*, void*)
/// function that casts the opaque input/output to typed pointers, calls
/// the worker (directly or through `ey_closure_call`), and writes the
/// result out.
fn mutate_cpu_worker(we: &mut CreateWorkerExpr, scope: &Scope, ctx: &mut Context) {
    let input_ptr_ty = Type::pointer(we.send_ty.clone());
    let output_ptr_ty = Type::pointer(we.recv_ty.clone());

    let mut statements = Vec::new();

    // T_in *typed_input = input;
    statements.push(StatementContainer {
        stmt: Stmt::Assign(AssignStmt::synth_let(
            "typed_input",
            input_ptr_ty.clone(),
            Some(Expr::Ident(Ident::raw("input", input_ptr_ty.clone()))),
            true,
        )),
        scope: scope.clone(),
    });

    // T_out *typed_output = output;
    statements.push(StatementContainer {
        stmt: Stmt::Assign(AssignStmt::synth_let(
            "typed_output",
            output_ptr_ty.clone(),
            Some(Expr::Ident(Ident::raw("output", output_ptr_ty.clone()))),
            true,
        )),
        scope: scope.clone(),
    });

    let call_stmt = if we.closure_variable.is_none() {
        let call = CallExpr::new(
            (*we.worker).clone(),
            vec![Expr::Deref(DerefExpr {
                pointer: Box::new(Expr::Ident(Ident::raw("typed_input", input_ptr_ty))),
            })],
        );
        let mut call = call;
        call.ignore_type_checks = true;
        call.cached = we.recv_ty.clone();

        if we.recv_ty == Type::Void {
            Stmt::Expr(ExprStmt {
                expr: Expr::Call(call),
            })
        } else {
            Stmt::Assign(AssignStmt {
                lhs: LValue::Deref(Box::new(LValue::ident("typed_output"))),
                rhs: Some(Expr::Call(call)),
                kind: AssignKind::Normal,
                new_type: we.recv_ty.clone(),
                pin_pointers: false,
            })
        }
    } else {
        // void *args[] = { input };
        statements.push(StatementContainer {
            stmt: Stmt::ClosureArgDecl(ClosureArgDecl {
                name: "args".to_string(),
                args: vec!["input".to_string()],
                address_of: false,
            }),
            scope: scope.clone(),
        });

        // ey_closure_call(closure, output, args);
        let call = CallExpr::runtime(
            "ey_closure_call",
            vec![
                Expr::Ident(Ident::raw("ctx", Type::Void)),
                Expr::Ident(Ident::raw("output", Type::Void)),
                Expr::Ident(Ident::raw("args", Type::Void)),
            ],
            Type::Void,
        );
        Stmt::Expr(ExprStmt {
            expr: Expr::Call(call),
        })
    };

    statements.push(StatementContainer {
        stmt: call_stmt,
        scope: scope.clone(),
    });

    let wrapper = FunctionDefinition {
        id: we
            .wrapper_id
            .clone()
            .unwrap_or_else(|| FunctionId::free(ctx.module_id().clone(), "generated_wrapper")),
        ret: Type::Void,
        locus: Locus::Cpu,
        exported: false,
        skip_check_pass: true,
        block: StatementBlock {
            statements,
            scope: scope.clone(),
        },
        parameters: vec![
            FunctionParameter {
                name: "input".to_string(),
                ty: Type::pointer(Type::Void),
            },
            FunctionParameter {
                name: "output".to_string(),
                ty: Type::pointer(Type::Void),
            },
            FunctionParameter {
                name: "ctx".to_string(),
                ty: Type::pointer(Type::Void),
            },
        ],
    };

    // The registry add would normally happen in the first pass; this
    // definition arrives late.
    ctx.functions
        .add(wrapper.id.clone(), wrapper.signature(), wrapper.locus);
    ctx.insert_element_before(Tle::Function(wrapper));
}

fn check_receive_worker(re: &mut ReceiveWorkerExpr, scope: &Scope, ctx: &mut Context) {
    ctx.note_cpu_required("receive from worker");

    check_expr(&mut re.worker, scope, ctx);
    if !ctx.errors.clean() {
        return;
    }

    match ctx.pass {
        Pass::SetTypes => {
            if !matches!(re.worker.ty(), Type::Worker { .. }) {
                ctx.errors.report("Expected a worker after 'receive'");
            }
        }

        Pass::Mutate => {
            let recv_ty = match re.worker.ty() {
                Type::Worker { recv, .. } => *recv,
                _ => return,
            };

            if re.all {
                // Draining always returns a vector, so no temporary is
                // needed: EyVector *v = w->drain(w);
                let mut call = CallExpr::new(
                    Expr::Access(AccessExpr {
                        accessed: re.worker.clone(),
                        field: "drain".to_string(),
                        allow_raw: true,
                        cached: Type::Void,
                    }),
                    vec![(*re.worker).clone()],
                );
                call.ignore_type_checks = true;
                call.skip_execution_context = true;
                call.cached = Type::vector(recv_ty);

                re.received = Some(Box::new(Expr::Call(call)));
            } else {
                let name = ctx.temp_name();

                // Declare the receiving variable, then receive into it:
                // w->receive(w, &var);
                ctx.insert_statement_before(Stmt::Assign(AssignStmt::synth_let(
                    &name,
                    recv_ty.clone(),
                    None,
                    false,
                )));

                let mut call = CallExpr::new(
                    Expr::Access(AccessExpr {
                        accessed: re.worker.clone(),
                        field: "receive".to_string(),
                        allow_raw: true,
                        cached: Type::Void,
                    }),
                    vec![
                        (*re.worker).clone(),
                        Expr::Unary(UnaryExpr {
                            op: UnaryOp::AddressOf,
                            rhs: Box::new(Expr::Ident(Ident::raw(&name, recv_ty.clone()))),
                            cached: Type::pointer(recv_ty.clone()),
                        }),
                    ],
                );
                call.ignore_type_checks = true;
                call.skip_execution_context = true;
                call.cached = Type::Void;

                ctx.insert_statement_before(Stmt::Expr(ExprStmt {
                    expr: Expr::Call(call),
                }));

                re.received = Some(Box::new(Expr::Ident(Ident::raw(name, recv_ty))));
            }
        }

        Pass::CheckTypes => {}
    }
}

fn check_create_pipeline(pe: &mut CreatePipelineExpr, scope: &Scope, ctx: &mut Context) {
    ctx.note_cpu_required("create pipeline");

    check_expr(&mut pe.lhs, scope, ctx);
    check_expr(&mut pe.rhs, scope, ctx);
    if !ctx.errors.clean() {
        return;
    }

    if ctx.pass == Pass::SetTypes {
        let Type::Worker { send, recv } = pe.lhs.ty() else {
            ctx.errors
                .report("First argument to pipeline keyword must be a worker expression");
            return;
        };

        let Type::Worker {
            send: rhs_send,
            recv: rhs_recv,
        } = pe.rhs.ty()
        else {
            ctx.errors
                .report("Second argument to pipeline keyword must be a worker expression");
            return;
        };

        pe.send_ty = *send;
        pe.intermediate = *recv;
        pe.recv_ty = *rhs_recv;

        if *rhs_send != pe.intermediate {
            ctx.errors.report(
                "Output from first argument to pipeline must be the same as the input to the second",
            );
        }
    }
}
