#![forbid(unsafe_code)]

//! Writes the host C99 translation unit and, when the program needs the
//! GPU, the OpenCL C device unit embedded into it as a string constant.
//!
//! Both units come out of the same pass with a target flag gating the
//! locus filters; this keeps the function-id enumeration aligned between
//! host and device, which the closure representation depends on.

use eyot_ast::{
    AssignKind, AssignStmt, BinaryOp, CallExpr, Expr, FunctionDefinition, FunctionId,
    FunctionParameter, FunctionSignature, GpuKernelTle, LValue, Locus, Module, ModuleId,
    StatementBlock, Stmt, StructId, Tle, Type, UnaryOp,
};
use eyot_core::Program;

use crate::names;
use crate::writer::Writer;

/// Emit the complete output for an analyzed program. `common_header` is
/// the text of the shared runtime header, inlined into the device unit;
/// it may be empty when the program does not require the GPU.
pub fn write_program(program: &Program, common_header: &str) -> String {
    let mut emitter = CEmitter::new();
    emitter.write_program(program, common_header);
    emitter.finish()
}

struct CEmitter {
    writers: Vec<Writer>,
    temp_count: usize,
    writing_gpu: bool,

    /// Per-block lists of pinned pointer lvalues, unpinned on scope exit.
    scopes: Vec<Vec<LValue>>,
}

fn binary_operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Subtract => "-",
        BinaryOp::Multiply => "*",
        BinaryOp::Divide => "/",
        BinaryOp::Equality => "==",
        BinaryOp::Inequality => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Lte => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Gte => ">=",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Mod => "%",
    }
}

fn unary_operator(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Not => "!",
        UnaryOp::AddressOf => "&",
        UnaryOp::Negate => "-",
    }
}

/// Wrap device source into a C string constant, one quoted line per
/// source line.
fn escape_string(src: &str) -> String {
    let mut out = String::new();
    for line in src.split('\n') {
        out.push_str("  \"");
        for c in line.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                '\r' => {}
                other => out.push(other),
            }
        }
        out.push_str("\\n\"\n");
    }
    out
}

impl CEmitter {
    fn new() -> CEmitter {
        CEmitter {
            writers: vec![Writer::new()],
            temp_count: 0,
            writing_gpu: false,
            scopes: Vec::new(),
        }
    }

    fn finish(mut self) -> String {
        let writer = self.writers.pop().unwrap_or_default();
        writer.finish()
    }

    fn w(&mut self) -> &mut Writer {
        self.writers.last_mut().expect("emitter writer stack empty")
    }

    fn temp_name(&mut self) -> String {
        self.temp_count += 1;
        format!("ey_tempb_{}", self.temp_count)
    }

    /// Whether a declaration of this locus belongs in the current unit.
    fn can_write(&self, locus: Locus) -> bool {
        if self.writing_gpu && locus == Locus::Cpu {
            return false;
        }
        if !self.writing_gpu && locus == Locus::Gpu {
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // GC pinning

    fn start_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn end_scope(&mut self) {
        self.scopes.pop();
    }

    fn write_forgets(&mut self, saved: &[LValue]) {
        if self.writing_gpu {
            return;
        }

        for lv in saved {
            self.w().add_all(&[
                "ey_runtime_gc_forget_root_pointer",
                "(",
                "ey_runtime_gc",
                "(",
                names::execution_context(),
                ")",
                ",",
                "&",
            ]);
            self.write_lvalue(lv);
            self.w().add_all(&[")", ";"]);
            self.w().end_line();
        }
    }

    /// Leaving just this block.
    fn about_to_exit_this_scope(&mut self) {
        let saved = self.scopes.last().cloned().unwrap_or_default();
        self.write_forgets(&saved);
    }

    /// Returning out of every enclosing block, innermost first.
    fn about_to_exit_all_scopes(&mut self) {
        let all: Vec<Vec<LValue>> = self.scopes.iter().rev().cloned().collect();
        for saved in all {
            self.write_forgets(&saved);
        }
    }

    /// Pin a freshly declared pointer variable as a GC root for the
    /// lifetime of the enclosing block.
    fn remember_lvalue(&mut self, ty: &Type, lv: &LValue) {
        if self.writing_gpu {
            return;
        }

        if matches!(ty, Type::Pointer(_)) {
            self.w().add_all(&[
                "ey_runtime_gc_remember_root_pointer",
                "(",
                "ey_runtime_gc",
                "(",
                names::execution_context(),
                ")",
                ",",
                "&",
            ]);
            self.write_lvalue(lv);
            self.w().add_all(&[")", ";"]);
            self.w().end_line();

            if let Some(scope) = self.scopes.last_mut() {
                scope.push(lv.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Types

    fn write_type(&mut self, ty: &Type) {
        match ty {
            Type::Null => unreachable!("null has no C type"),
            Type::Integer => self.w().add("EyInteger"),
            Type::Float { width } => self.w().add(format!("EyFloat{width}")),
            Type::Str => self.w().add("EyString"),
            Type::Character => self.w().add("EyCharacter"),
            Type::Boolean => self.w().add("EyBoolean"),
            Type::Void => self.w().add("void"),
            Type::Tuple(_) => self.w().add(ty.tuple_identifier()),
            Type::Struct(sid) => self.w().add(names::struct_name(sid)),
            Type::Pointer(inner) => {
                self.write_type(inner);
                self.w().add_no_space("*");
            }
            Type::Vector(_) => self.w().add("EyVector"),
            Type::Worker { .. } => {
                self.w().add("EyWorker");
                self.w().add_no_space("*");
            }
            Type::Function(_) => unreachable!("function values have no C representation"),
            Type::Closure { .. } => self.w().add("EyClosure"),
        }
    }

    fn execution_context_type(&self) -> Type {
        Type::pointer(Type::Struct(StructId::new(
            ModuleId::builtin(),
            "EyExecutionContext",
        )))
    }

    // ------------------------------------------------------------------
    // Expressions

    /// The override point for rhs positions: string values are routed
    /// through the runtime so literals get copied off the static pool.
    fn write_assigned_expression(&mut self, e: &Expr) {
        if e.ty() == Type::Str {
            self.w().add_all(&[
                names::use_string_literal(),
                "(",
                names::execution_context(),
                ",",
            ]);
            self.write_expression(e);
            self.w().add_all(&[")"]);
        } else {
            self.write_expression(e);
        }
    }

    fn write_expression(&mut self, e: &Expr) {
        match e {
            Expr::Null => self.w().add("0"),

            Expr::Cast(ce) => {
                self.w().add("(");
                self.write_type(&ce.new_type);
                self.w().add(")");
                self.write_expression(&ce.casted);
            }

            Expr::SelfRef(_) => self.w().add("ey_self"),

            Expr::Deref(de) => {
                self.w().add("*");
                self.w().suppress_next_space();
                self.write_expression(&de.pointer);
            }

            Expr::Sizeof(se) => {
                self.w().add("sizeof");
                self.w().add_no_space("(");
                self.w().suppress_next_space();
                self.write_type(&se.sized);
                self.w().add_no_space(")");
            }

            Expr::Int(it) => self.w().add(format!("{}", it.value)),

            Expr::Character(ct) => self.w().add(format!("{}", ct.code_point)),

            Expr::Str(st) => {
                self.w().add_all(&[
                    names::string_pool_get(),
                    "(",
                    names::execution_context(),
                    ",",
                ]);
                self.w().add(format!("{}", st.id));
                self.w().add(")");
            }

            Expr::Float(ft) => {
                let zeros = "0".repeat(ft.zeros as usize);
                self.w()
                    .add(format!("{}.{}{}", ft.int_part, zeros, ft.frac_part));
            }

            Expr::Tuple(te) => {
                let ty = e.ty();
                self.w().add("(");
                self.w().add_no_space(ty.tuple_identifier());
                self.w().add_no_space(")");
                self.w().add("{");
                for (i, item) in te.items.iter().enumerate() {
                    if i > 0 {
                        self.w().add_no_space(",");
                    }
                    self.w().add(format!(".f{i}"));
                    self.w().add("=");
                    self.write_assigned_expression(item);
                }
                self.w().add("}");
            }

            Expr::Ident(it) => {
                if let Some(fid) = &it.fid {
                    self.w().add(names::function_id(fid));
                } else {
                    self.w().add(it.name.clone());
                }
            }

            Expr::GpuBuiltin(g) => self.w().add(g.name.clone()),

            Expr::Bool(bt) => {
                self.w().add(if bt.value { "k_true" } else { "k_false" });
            }

            Expr::Range(re) => {
                self.w()
                    .add_all(&["ey_runtime_range", "(", names::execution_context(), ","]);
                self.write_expression(&re.start);
                self.w().add_no_space(",");
                self.write_expression(&re.count);
                self.w().add_no_space(",");
                self.write_expression(&re.step);
                self.w().add_no_space(")");
            }

            Expr::Binary(be) => {
                // Excess parens are not pretty, but they are precise.
                self.w().add("(");
                if be.lhs.ty() == Type::Str {
                    match be.op {
                        BinaryOp::Add => self.w().add("ey_runtime_string_join"),
                        BinaryOp::Equality => self.w().add("ey_runtime_string_equality"),
                        BinaryOp::Inequality => {
                            self.w().add_all(&["!", "ey_runtime_string_equality"])
                        }
                        other => unreachable!("string operator {other:?} not lowered"),
                    }

                    self.w().add_all(&["(", names::execution_context(), ","]);
                    self.write_expression(&be.lhs);
                    self.w().add(",");
                    self.write_expression(&be.rhs);
                    self.w().add(")");
                } else {
                    self.write_expression(&be.lhs);
                    self.w().add_all(&[")", binary_operator(be.op), "("]);
                    self.write_expression(&be.rhs);
                }
                self.w().add(")");
            }

            Expr::Access(ae) => {
                self.write_expression(&ae.accessed);

                let ty = ae.accessed.ty();
                if matches!(ty, Type::Pointer(_) | Type::Worker { .. }) {
                    self.w().add_no_space("->");
                } else {
                    self.w().add_no_space(".");
                }

                self.w().add_no_space(ae.field.clone());
            }

            Expr::New(ne) => {
                // Replaced during mutation; anything left is a bug
                // upstream, but emit the initializer so the output stays
                // parseable.
                self.write_expression(&ne.init);
            }

            Expr::Closure(ce) => {
                let enum_id = ce
                    .called_fid
                    .as_ref()
                    .map(|fid| names::function_enum_id(fid))
                    .unwrap_or_default();
                self.w().add_all(&[
                    "ey_closure_create",
                    "(",
                    &enum_id,
                    ",",
                    &ce.arg_array_name,
                    ")",
                ]);
            }

            Expr::Call(ce) => self.write_call(ce),

            Expr::StructLit(sle) => {
                self.w()
                    .add_all(&["(", &names::struct_name(&sle.id), ")", "{"]);
                for (i, pair) in sle.pairs.iter().enumerate() {
                    if i > 0 {
                        self.w().add(",");
                    }
                    self.w().add(format!(".{}", pair.field_name));
                    self.w().add("=");
                    self.write_expression(&pair.value);
                }
                self.w().add("}");
            }

            Expr::Unary(ue) => {
                self.w().add(unary_operator(ue.op));
                self.w().suppress_next_space();
                self.write_expression(&ue.rhs);
            }

            Expr::VectorLit(_) => {
                unreachable!("vector literals are replaced during mutation")
            }

            Expr::Index(ie) => match ie.kind {
                eyot_ast::IndexedKind::Vector => {
                    // *(T*)ey_vector_access(ctx, vec, i)
                    self.w().add("*");
                    self.w().add_no_space("(");
                    self.w().suppress_next_space();
                    self.write_type(&ie.cached);
                    self.w().add_no_space("*");
                    self.w().add_no_space(")");
                    self.w().suppress_next_space();
                    self.w()
                        .add_all(&["ey_vector_access", "(", names::execution_context(), ","]);
                    self.write_expression(&ie.indexed);
                    self.w().add_no_space(",");
                    self.write_expression(&ie.index);
                    self.w().add_no_space(")");
                }
                eyot_ast::IndexedKind::Str => {
                    self.w().add_all(&[
                        "ey_runtime_string_get_character",
                        "(",
                        names::execution_context(),
                        ",",
                    ]);
                    self.write_expression(&ie.indexed);
                    self.w().add_no_space(",");
                    self.write_expression(&ie.index);
                    self.w().add(")");
                }
            },

            Expr::CreatePipeline(pe) => {
                self.w().add_all(&["ey_worker_create_pipeline", "("]);
                self.write_expression(&pe.lhs);
                self.w().add(",");
                self.write_expression(&pe.rhs);
                self.w().add(")");
            }

            Expr::CreateWorker(we) => self.write_create_worker(we),

            Expr::ReceiveWorker(re) => {
                if let Some(received) = &re.received {
                    self.write_expression(received);
                }
            }
        }
    }

    fn write_call(&mut self, ce: &CallExpr) {
        if let Some(result) = &ce.stacked_result {
            // The call itself was hoisted into earlier statements.
            self.w().add(result.clone());
            return;
        }

        self.write_expression(&ce.callee);
        self.w().add_no_space("(");
        self.w().suppress_next_space();

        let mut wrote_any = false;
        if !ce.skip_execution_context {
            self.w().add(names::execution_context());
            wrote_any = true;
        }

        for arg in &ce.args {
            if wrote_any {
                self.w().add_no_space(",");
            }
            self.write_expression(arg);
            wrote_any = true;
        }

        self.w().add_no_space(")");
    }

    fn write_create_worker(&mut self, we: &eyot_ast::CreateWorkerExpr) {
        match we.destination {
            eyot_ast::WorkerDestination::Gpu => {
                let kernel_name = we
                    .kernel_id
                    .as_ref()
                    .map(names::function_id)
                    .unwrap_or_default();
                self.w().add_all(&[
                    "ey_worker_create_opencl",
                    "(",
                    &format!("\"{kernel_name}\""),
                    ",",
                    "sizeof(",
                ]);
                self.write_type(&we.send_ty);
                self.w().add_all(&[")", ",", "sizeof("]);
                self.write_type(&we.recv_ty);
                self.w().add_all(&[")", ","]);

                match &we.closure_variable {
                    Some(closure) => {
                        self.w().add_all(&[
                            closure,
                            ",",
                            "ey_closure_size(",
                            closure,
                            ")",
                        ]);
                    }
                    None => self.w().add_all(&["0", ",", "0"]),
                }

                self.w().add_no_space(")");
            }

            eyot_ast::WorkerDestination::Cpu => {
                let wrapper_name = we
                    .wrapper_id
                    .as_ref()
                    .map(names::function_id)
                    .unwrap_or_default();

                // Casting the wrapper lets the execution-context-first
                // signature through the runtime's void* slot.
                self.w().add_all(&[
                    "ey_worker_create_cpu",
                    "(",
                    "(",
                    names::worker_function_type(),
                    ")",
                    &wrapper_name,
                    ",",
                    "sizeof",
                    "(",
                ]);

                self.write_type(&we.send_ty);
                self.w().add_no_space(")");
                self.w().add_no_space(",");

                if we.recv_ty == Type::Void {
                    self.w().add("0");
                } else {
                    self.w().add("sizeof");
                    self.w().add_no_space("(");
                    self.write_type(&we.recv_ty);
                    self.w().add_no_space(")");
                }

                match &we.closure_variable {
                    Some(closure) => self
                        .w()
                        .add_no_space(format!(", {closure}, ey_closure_size({closure}))")),
                    None => self.w().add_no_space(", 0, 0)"),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // LValues

    fn write_lvalue(&mut self, lv: &LValue) {
        match lv {
            LValue::Access(alv) => {
                self.write_lvalue(&alv.inner);

                if matches!(alv.inner.ty(), Type::Pointer(_)) {
                    self.w().add_no_space("->");
                } else {
                    self.w().add_no_space(".");
                }

                self.w().add_no_space(alv.field_name.clone());
            }

            LValue::Index(ilv) => {
                let indexed_ty = ilv.indexed.ty().unwrapped().clone();
                match indexed_ty {
                    Type::Vector(_) => {
                        self.w().add("*");
                        self.w().add_no_space("(");
                        self.w().suppress_next_space();
                        self.write_type(&ilv.cached);
                        self.w().add_no_space("*");
                        self.w().add_no_space(")");
                        self.w().suppress_next_space();
                        self.w().add_all(&[
                            "ey_vector_access",
                            "(",
                            names::execution_context(),
                            ",",
                        ]);
                        self.w().suppress_next_space();
                        self.write_lvalue(&ilv.indexed);
                        self.w().add_no_space(",");
                        self.write_expression(&ilv.index);
                        self.w().add_no_space(")");
                    }
                    Type::Str => {
                        self.w().add_all(&["(", "(", "EyCharacter", "*", ")"]);
                        self.write_lvalue(&ilv.indexed);
                        self.w().add_all(&["->", "ptr", ")", "["]);
                        self.write_expression(&ilv.index);
                        self.w().add("]");
                    }
                    _ => {}
                }
            }

            LValue::Ident(ilv) => self.w().add(ilv.name.clone()),

            LValue::Deref(inner) => {
                self.w().add("*");
                self.w().suppress_next_space();
                self.write_lvalue(inner);
            }

            LValue::SelfLv(_) => self.w().add("ey_self"),

            LValue::Multiple(_) => {
                unreachable!("multiple lvalues are unpacked before emission")
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements

    fn write_assign(&mut self, st: &AssignStmt) {
        if let LValue::Multiple(lvs) = &st.lhs {
            // Unpack the tuple into a temporary, then assign piecewise.
            let temp = self.temp_name();
            self.w().add("const");
            self.write_type(&st.new_type);
            self.w().add(temp.clone());
            self.w().add("=");
            if let Some(rhs) = &st.rhs {
                self.write_assigned_expression(rhs);
            }
            self.w().add_no_space(";");
            self.w().end_line();

            let element_types: Vec<Type> = match &st.new_type {
                Type::Tuple(items) => items.clone(),
                _ => vec![Type::Void; lvs.len()],
            };

            for (i, lv) in lvs.iter().enumerate() {
                let element_ty = element_types.get(i).cloned().unwrap_or(Type::Void);

                let declared = matches!(st.kind, AssignKind::Let | AssignKind::Const);
                if declared {
                    self.write_type(&element_ty);
                }

                self.write_lvalue(lv);
                self.w().add("=");
                self.w().add(format!("{temp}.f{i}"));
                self.w().add_no_space(";");
                self.w().end_line();

                if declared && st.pin_pointers {
                    self.remember_lvalue(&element_ty, lv);
                }
            }
            return;
        }

        let declared = matches!(st.kind, AssignKind::Let | AssignKind::Const);
        if declared {
            self.write_type(&st.new_type);
        }

        self.write_lvalue(&st.lhs);
        if let Some(rhs) = &st.rhs {
            self.w().add("=");
            self.write_assigned_expression(rhs);
        }
        self.w().add_no_space(";");
        self.w().end_line();

        if declared && st.pin_pointers {
            let ty = st.new_type.clone();
            let lv = st.lhs.clone();
            self.remember_lvalue(&ty, &lv);
        }
    }

    fn write_statement(&mut self, st: &Stmt) {
        match st {
            Stmt::Modify(ms) => {
                self.write_lvalue(&ms.target);
                self.w().add(match ms.op {
                    eyot_ast::ModifyOp::Plus => "+=",
                    eyot_ast::ModifyOp::Minus => "-=",
                    eyot_ast::ModifyOp::Times => "*=",
                    eyot_ast::ModifyOp::Divide => "/=",
                });
                self.write_expression(&ms.value);
                self.w().add_no_space(";");
            }

            Stmt::Assign(a) => self.write_assign(a),

            Stmt::Break => {
                self.w().add_all(&["break", ";"]);
                self.w().end_line();
            }

            Stmt::Dummy(_) => {}

            Stmt::While(ws) => {
                self.w().add("while");
                self.w().add("(");
                self.w().suppress_next_space();
                self.write_expression(&ws.condition);
                self.w().add_no_space(")");
                self.write_statement_block(&ws.block);
            }

            Stmt::Foreach(fs) => self.write_foreach(fs),

            Stmt::ClosureArgDecl(decl) => {
                self.w()
                    .add_all(&["void", "*", &decl.name, "[", "]", "=", "{"]);

                for (i, arg) in decl.args.iter().enumerate() {
                    if i > 0 {
                        self.w().add(",");
                    }

                    if arg.is_empty() {
                        self.w().add("0");
                    } else if decl.address_of {
                        self.w().add_all(&["&", arg]);
                    } else {
                        self.w().add(arg.clone());
                    }
                }

                self.w().add_all(&["}", ";"]);
            }

            Stmt::Return(rs) => {
                self.about_to_exit_all_scopes();
                self.w().add("return");
                if let Some(value) = &rs.value {
                    self.write_expression(value);
                }
                self.w().add_no_space(";");
            }

            Stmt::Expr(es) => {
                self.write_expression(&es.expr);
                self.w().add_no_space(";");
            }

            Stmt::Send(ss) => {
                self.write_expression(&ss.pipe);
                self.w().add_no_space("->");
                self.w().add_no_space("send");
                self.w().add_no_space("(");
                self.w().suppress_next_space();
                self.write_expression(&ss.pipe);
                self.w().add_no_space(",");
                self.write_expression(&ss.value);
                self.w().suppress_next_space();
                self.w().add_no_space(")");
                self.w().add_no_space(";");
            }

            Stmt::If(ifs) => {
                for (i, seg) in ifs.segments.iter().enumerate() {
                    match &seg.condition {
                        None => {
                            self.w().add("else");
                            self.write_statement_block(&seg.block);
                        }
                        Some(cond) => {
                            if i > 0 {
                                self.w().add("else");
                            }
                            self.w().add("if");
                            self.w().add("(");
                            self.write_expression(cond);
                            self.w().add_no_space(")");
                            self.write_statement_block(&seg.block);
                        }
                    }
                }
            }
        }
    }

    fn write_foreach(&mut self, fs: &eyot_ast::ForeachStmt) {
        match fs.variant {
            eyot_ast::ForVariant::Each => {
                // EyVector *v = iterable;
                let vect = self.temp_name();
                self.w().add("EyVector");
                self.w().add("*");
                self.w().add_no_space(vect.clone());
                self.w().add("=");
                self.write_expression(&fs.iterable);
                self.w().add_no_space(";");
                self.w().end_line();

                // int i = 0;
                let index = self.temp_name();
                self.w().add_all(&["int", &index, "=", "0", ";"]);
                self.w().end_line();

                self.w().add_all(&[
                    "while",
                    "(",
                    &index,
                    "<",
                    "ey_vector_length",
                    "(",
                    names::execution_context(),
                    ",",
                    &vect,
                    ")",
                    ")",
                    "{",
                ]);
                self.w().end_line();
                self.w().indent();

                // T x = *(T*)ey_vector_access(ctx, v, i);
                self.write_type(&fs.iterated_type);
                self.w().add(fs.variable.clone());
                self.w().add("=");
                self.w().add("*");
                self.w().add_no_space("(");
                self.write_type(&fs.iterated_type);
                self.w().add("*");
                self.w().add_no_space(")");
                self.w().add_all(&[
                    "ey_vector_access",
                    "(",
                    names::execution_context(),
                    ",",
                    &vect,
                    ",",
                    &index,
                    ")",
                ]);
                self.w().add_no_space(";");
                self.w().end_line();

                self.write_statement_block(&fs.body);

                self.w().add_all(&[&index, "++", ";"]);
                self.w().end_line();

                self.w().unindent();
                self.w().add("}");
                self.w().end_line();
            }

            eyot_ast::ForVariant::Range => {
                self.w().add("for");
                self.w().add("(");

                self.w().add("EyInteger");
                self.w().add(fs.variable.clone());
                self.w().add("=");
                self.w().add(fs.start_name.clone());
                self.w().add(";");

                self.w().add("ey_runtime_continue_iterating(");
                self.w().add(fs.step_name.clone());
                self.w().add(",");
                self.w().add(fs.variable.clone());
                self.w().add(",");
                self.w().add(fs.end_name.clone());
                self.w().add(");");

                self.w().add(fs.variable.clone());
                self.w().add("+=");
                self.w().add(fs.step_name.clone());
                self.w().add(")");
                self.w().add("{");
                self.w().end_line();

                self.write_statement_block(&fs.body);

                self.w().add("}");
                self.w().end_line();
            }
        }
    }

    fn write_statement_block(&mut self, block: &StatementBlock) {
        self.w().add("{");
        self.w().end_line();
        self.w().indent();

        self.start_scope();

        for sc in &block.statements {
            self.write_statement(&sc.stmt);
            self.w().end_line();
        }

        self.about_to_exit_this_scope();
        self.end_scope();

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();
    }

    // ------------------------------------------------------------------
    // Functions

    fn write_function_prototype_raw_name(&mut self, sig: &FunctionSignature, raw_name: &str) {
        self.write_type(&sig.ret);
        self.w().force_space();
        self.w().add(raw_name.to_string());
        self.w().add_no_space("(");
        self.w().suppress_next_space();

        let ec = self.execution_context_type();
        self.write_type(&ec);
        for ty in &sig.params {
            self.w().add_no_space(",");
            self.write_type(ty);
        }

        self.w().add_no_space(")");
    }

    fn write_function_prototype(&mut self, sig: &FunctionSignature, fid: &FunctionId) {
        let name = names::function_id(fid);
        self.write_function_prototype_raw_name(sig, &name);
    }

    fn write_function(&mut self, fd: &FunctionDefinition) {
        if !self.can_write(fd.locus) {
            return;
        }

        self.write_type(&fd.ret);
        self.w().force_space();
        self.w().add(names::function_id(&fd.id));

        self.w().add_no_space("(");
        self.w().suppress_next_space();

        let ec_parameter = FunctionParameter {
            name: names::execution_context().to_string(),
            ty: self.execution_context_type(),
        };

        for (i, param) in fd.effective_parameters(ec_parameter).iter().enumerate() {
            if i > 0 {
                self.w().add_no_space(",");
            }
            self.write_type(&param.ty);
            self.w().add(param.name.clone());
        }

        self.w().add_no_space(")");
        self.write_statement_block(&fd.block);

        // The fixed-signature caller shim: unpack the argument array and
        // invoke. The dispatcher reaches user functions through these.
        let sig = fd.signature();

        self.w()
            .add_all(&["void", &names::function_caller_id(&fd.id), "("]);
        self.w()
            .add_all(&["EyExecutionContext", "*", names::execution_context(), ","]);
        self.w()
            .add_all(&["void", "*", "result", ",", "void", "*", "*", "args", ")", "{"]);
        self.w().end_line();
        self.w().indent();

        if sig.ret != Type::Void {
            self.w().add_all(&["*", "("]);
            self.write_type(&fd.ret);
            self.w().add_all(&["*", ")", "result", "="]);
        }

        self.w().add_all(&[&names::function_id(&fd.id), "("]);
        self.w().add(names::execution_context());

        for (i, ty) in sig.params.iter().enumerate() {
            self.w().add_all(&[",", "*", "(", "("]);
            self.write_type(ty);
            self.w()
                .add_all(&["*", ")", "args", "[", &format!("{i}"), "]", ")"]);
        }
        self.w().add_all(&[")", ";"]);
        self.w().end_line();

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();
    }

    // ------------------------------------------------------------------
    // Kernels

    fn write_gpu_kernel(&mut self, tle: &GpuKernelTle, pool: &[String]) {
        if !self.writing_gpu {
            return;
        }

        self.w().add_all(&[
            "__kernel",
            "void",
            &names::function_id(&tle.kernel_id),
            "(",
            "__global",
        ]);
        self.write_type(&tle.input);
        self.w().add_all(&["*", "global_input", ",", "__global"]);
        self.write_type(&tle.output);
        self.w().add_all(&[
            "*",
            "global_output",
            ",",
            "const unsigned int count",
            ",",
            "__global",
            "EyWorkerShared",
            "*",
            "shared",
        ]);

        if tle.is_closure_worker {
            self.w()
                .add_all(&[",", "__global", "void", "*", "raw_closure"]);
        }

        self.w().add_all(&[")", "{"]);
        self.w().end_line();
        self.w().indent();

        self.write_string_pool(pool);
        self.w().end_line();

        // One work item per element.
        self.w()
            .add_all(&["int", "i", "=", "get_global_id", "(", "0", ")", ";"]);
        self.w().end_line();

        self.w().add_all(&[
            "EyExecutionContext",
            names::execution_context(),
            "=",
            "{",
        ]);
        self.w().end_line();
        self.w().indent();
        self.w().add_all(&[
            ".shared",
            "=",
            "shared",
            "+",
            "get_local_id",
            "(",
            "0",
            ")",
            ",",
        ]);
        self.w().end_line();
        self.w()
            .add_all(&[".strings", "=", names::string_pool(), ","]);
        self.w().end_line();
        self.w().unindent();
        self.w().add_all(&["}", ";"]);
        self.w().end_line();

        self.w().add("if (i < count) {");
        self.w().end_line();
        self.w().indent();

        if !tle.is_closure_worker {
            if tle.output != Type::Void {
                self.w().add_all(&["global_output[i]", "="]);
            }

            let worker_name = tle
                .worker_id
                .as_ref()
                .map(names::function_id)
                .unwrap_or_default();
            self.w().add_all(&[
                &worker_name,
                "(",
                "&",
                names::execution_context(),
                ",",
                "global_input[i]",
                ")",
                ";",
            ]);
            self.w().end_line();
        } else {
            self.w().add_all(&[
                "unsigned",
                "char",
                "closure_buffer",
                "[",
                "EYOT_RUNTIME_MAX_CLOSURE_SIZE",
                "]",
                ";",
            ]);
            self.w().end_line();

            self.w().add_all(&[
                "ey_closure_copy",
                "(",
                "closure_buffer",
                ",",
                "raw_closure",
                ")",
                ";",
            ]);
            self.w().end_line();

            self.write_type(&tle.input);
            self.w()
                .add_all(&["input", "=", "global_input", "[", "i", "]", ";"]);
            self.w().end_line();

            if tle.output != Type::Void {
                self.write_type(&tle.output);
                self.w().add_all(&["output", ";"]);
                self.w().end_line();
            }

            self.w().add_all(&[
                "void", "*", "args", "[", "]", "=", "{", "&", "input", "}", ";",
            ]);
            self.w().end_line();

            self.w().add_all(&[
                "ey_closure_call",
                "(",
                "&",
                names::execution_context(),
                ",",
                "(",
                "EyClosure",
                ")",
                "closure_buffer",
                ",",
            ]);
            if tle.output == Type::Void {
                self.w().add_all(&["0", ","]);
            } else {
                self.w().add_all(&["&", "output", ","]);
            }
            self.w().add_all(&["args", ")", ";"]);
            self.w().end_line();

            if tle.output != Type::Void {
                self.w()
                    .add_all(&["global_output", "[", "i", "]", "=", "output", ";"]);
                self.w().end_line();
            }
        }

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();
    }

    // ------------------------------------------------------------------
    // Program-level tables

    fn write_string_pool(&mut self, pool: &[String]) {
        self.w().add("// String pool");
        self.w().end_line();

        if pool.is_empty() {
            // OpenCL is not happy with empty arrays; a null pointer is
            // safe because using it would already be out of bounds.
            self.w()
                .add_all(&["EyStringS", "*", names::string_pool(), "=", "0", ";"]);
            self.w().end_line();
            return;
        }

        let mut counts = Vec::new();
        for (i, s) in pool.iter().enumerate() {
            self.w().add_all(&[
                "EyCharacter",
                &names::string_pool_utf32(i),
                "[",
                "]",
                "=",
                "{",
            ]);

            let mut count = 0usize;
            for c in s.chars() {
                self.w().add(format!("{}", c as u32));
                self.w().add(",");
                count += 1;
            }
            counts.push(count);

            self.w().add_all(&["0", "}", ";"]);
            self.w().end_line();
        }

        let temp_name = format!("{}_temp", names::string_pool());

        self.w()
            .add_all(&["EyStringS", &temp_name, "[", "]", "=", "{"]);
        self.w().end_line();

        self.w().indent();
        for (i, count) in counts.iter().enumerate() {
            self.w().add_all(&[
                "{",
                // Data length: four bytes per code point.
                ".length",
                "=",
                &format!("{}", 4 * count),
                ",",
                ".ptr",
                "=",
                &names::string_pool_utf32(i),
                ",",
                ".static_lifetime",
                "=",
                "k_true",
                "}",
                ",",
            ]);
            self.w().end_line();
        }
        self.w().unindent();

        self.w().add_all(&["}", ";"]);
        self.w().end_line();

        self.w()
            .add_all(&["EyStringS", "*", names::string_pool(), "=", &temp_name, ";"]);
        self.w().end_line();
    }

    fn write_function_enum(&mut self, program: &Program) {
        self.w().add_all(&["typedef", "enum", "{"]);
        self.w().end_line();
        self.w().indent();

        for entry in program.functions.entries() {
            if self.can_write(entry.locus) {
                self.w().add_all(&[
                    &names::function_enum_id(&entry.fid),
                    "=",
                    &format!("{}", entry.id),
                    ",",
                ]);
                self.w().end_line();
            }
        }

        self.w().unindent();
        self.w()
            .add_all(&["}", names::function_enum_type(), ";"]);
        self.w().end_line();
        self.w().end_line();
    }

    fn write_arg_count_function(&mut self, program: &Program) {
        self.w().add_all(&[
            "int",
            "ey_generated_arg_count",
            "(",
            "int",
            "fid",
            ")",
            "{",
        ]);
        self.w().end_line();
        self.w().indent();

        self.w().add_all(&[
            "switch",
            "(",
            "(",
            names::function_enum_type(),
            ")",
            "fid",
            ")",
            "{",
        ]);
        self.w().end_line();

        for set in program.functions.sets() {
            for locus in Locus::all() {
                if !self.can_write(locus) {
                    continue;
                }
                for fid in set.ids_at(locus) {
                    self.w()
                        .add_all(&["case", &names::function_enum_id(fid), ":"]);
                    self.w().end_line();
                    self.w().indent();

                    self.w().add_all(&[
                        "return",
                        &format!("{}", set.signature.params.len()),
                        ";",
                    ]);
                    self.w().end_line();
                    self.w().unindent();
                }
            }
        }

        self.w().add_all(&["default", ":"]);
        self.w().end_line();
        self.w().indent();
        self.w().add_all(&["return", "0", ";"]);
        self.w().end_line();
        self.w().unindent();

        self.w().add("}");
        self.w().end_line();

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();
    }

    /// `ey_generated_closure_arg_size(fid, argi)`: the byte size of each
    /// argument slot, or zero when the function is absent on this target.
    fn write_arg_size_function(&mut self, program: &Program) {
        self.w().add_all(&[
            "int",
            names::closure_arg_size(),
            "(",
            "int",
            "fid",
            ",",
            "int",
            "arg",
            ")",
            "{",
        ]);
        self.w().end_line();
        self.w().indent();

        self.w().add_all(&[
            "switch",
            "(",
            "(",
            names::function_enum_type(),
            ")",
            "fid",
            ")",
            "{",
        ]);
        self.w().end_line();
        self.w().indent();

        for set in program.functions.sets() {
            if set.signature.params.is_empty() {
                continue;
            }

            for locus in Locus::all() {
                if !self.can_write(locus) {
                    continue;
                }
                for fid in set.ids_at(locus) {
                    self.w()
                        .add_all(&["case", &names::function_enum_id(fid), ":"]);
                    self.w().end_line();
                    self.w().indent();

                    if self.can_write(set.signature.locus) {
                        self.w().add_all(&["switch", "(", "arg", ")", "{"]);
                        self.w().end_line();
                        self.w().indent();

                        for (i, ty) in set.signature.params.iter().enumerate() {
                            self.w().add_all(&["case", &format!("{i}"), ":"]);
                            self.w().end_line();
                            self.w().indent();

                            self.w().add_all(&["return", "sizeof", "("]);
                            self.write_type(ty);
                            self.w().add_all(&[")", ";"]);
                            self.w().end_line();
                            self.w().unindent();
                        }

                        self.w().unindent();
                        self.w().add("}");
                        self.w().end_line();
                        self.w().add_all(&["return", "0", ";"]);
                    } else {
                        self.w()
                            .add_all(&["return", "0", ";", "// not available on this target"]);
                    }
                    self.w().end_line();
                    self.w().unindent();
                }
            }
        }

        self.w().add_all(&["default", ":"]);
        self.w().end_line();
        self.w().indent();
        self.w().add_all(&["return", "0", ";"]);
        self.w().end_line();
        self.w().unindent();

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();
    }

    /// The central dispatcher: switch over the function-id enum and call
    /// the per-function shim. `ey_closure_call` reaches back into user
    /// functions through this.
    fn write_function_caller(&mut self, program: &Program) {
        self.w()
            .add_all(&["void", names::central_function_caller(), "("]);
        self.w()
            .add_all(&["EyExecutionContext", "*", names::execution_context(), ","]);
        self.w().add_all(&[
            "int", "fid", ",", "void", "*", "result", ",", "void", "*", "*", "args", ")", "{",
        ]);
        self.w().end_line();
        self.w().indent();

        self.w().add_all(&[
            "switch",
            "(",
            "(",
            names::function_enum_type(),
            ")",
            "fid",
            ")",
            "{",
        ]);
        self.w().end_line();
        self.w().indent();

        for set in program.functions.sets() {
            for locus in Locus::all() {
                if !self.can_write(locus) {
                    continue;
                }
                for fid in set.ids_at(locus) {
                    self.w()
                        .add_all(&["case", &names::function_enum_id(fid), ":"]);
                    self.w().end_line();
                    self.w().indent();

                    if self.can_write(set.signature.locus) {
                        self.w().add_all(&[
                            &names::function_caller_id(fid),
                            "(",
                            names::execution_context(),
                            ",",
                            "result",
                            ",",
                            "args",
                            ")",
                            ";",
                        ]);
                    } else {
                        // Keeps the device compiler quiet.
                        self.w().add("// function not available on this target");
                    }
                    self.w().end_line();

                    self.w().add_all(&["break", ";"]);
                    self.w().end_line();
                    self.w().unindent();
                }
            }
        }

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();
    }

    /// Typed append helpers for every vector element type the program
    /// uses; host only, since vector operations are CPU-bound.
    fn write_vector_helpers(&mut self, program: &Program) {
        if program.vectors.is_empty() {
            return;
        }

        self.w().add("// Vector append helpers");
        self.w().end_line();

        for element in program.vectors.values() {
            self.w().add_all(&[
                "void",
                &element.vector_append_name(),
                "(",
                "EyExecutionContext",
                "*",
                names::execution_context(),
                ",",
                "EyVector",
                "*",
                "vec",
                ",",
            ]);
            self.write_type(element);
            self.w().add_all(&["value", ")", "{"]);
            self.w().end_line();
            self.w().indent();

            self.w().add_all(&[
                "ey_vector_append",
                "(",
                names::execution_context(),
                ",",
                "vec",
                ",",
                "&",
                "value",
                ")",
                ";",
            ]);
            self.w().end_line();

            self.w().unindent();
            self.w().add("}");
            self.w().end_line();
        }

        self.w().end_line();
    }

    fn write_main(&mut self, program: &Program) {
        self.w().add_all(&[
            "void",
            "ey_generated_main",
            "(",
            "EyExecutionContext",
            "*",
            "ctx",
            ")",
            "{",
        ]);
        self.w().end_line();
        self.w().indent();

        let main_fid = FunctionId::free(program.root_module_id.clone(), "main");
        self.w()
            .add_all(&[&names::function_id(&main_fid), "(", "ctx", ")", ";"]);
        self.w().end_line();

        self.w().unindent();
        self.w().add("}");
        self.w().end_line();
    }

    // ------------------------------------------------------------------
    // Units

    fn write_file(&mut self, module: &Module, consts: bool, pool: &[String]) {
        for tlec in &module.elements {
            let is_const = matches!(tlec.element, Tle::Const(_));
            if is_const != consts {
                continue;
            }

            self.write_tle(&tlec.element, pool);
            self.w().end_line();
        }
    }

    fn write_tle(&mut self, tle: &Tle, pool: &[String]) {
        match tle {
            // Emitted in the typedef section.
            Tle::Struct(_) => {}
            // Internal markers.
            Tle::Dummy(_) | Tle::Import(_) => {}
            Tle::Function(fd) => self.write_function(fd),
            Tle::Const(c) => self.write_assign(&c.assign),
            Tle::GpuKernel(k) => self.write_gpu_kernel(k, pool),
        }
    }

    fn write_program(&mut self, program: &Program, common_header: &str) {
        // The device unit rides along as a string constant; null when the
        // program never touches the GPU.
        self.w()
            .add_all(&["const", "char", "*", "ey_runtime_cl_src", "="]);

        if program.gpu_required {
            self.writers.push(Writer::new());
            self.writing_gpu = true;
            self.write_unit(program, common_header);
            self.writing_gpu = false;
            let device_unit = self.writers.pop().unwrap_or_default().finish();

            self.w().end_line();
            let escaped = escape_string(&device_unit);
            self.w().raw(&escaped);
        } else {
            self.w().add("0");
        }

        self.w().add(";");
        self.w().end_line();

        self.write_unit(program, common_header);
    }

    fn write_unit(&mut self, program: &Program, common_header: &str) {
        if self.writing_gpu {
            self.w().add_all(&[
                "#define",
                "EYOT_RUNTIME_MAX_ARGS",
                &format!("{}", program.functions.max_arg_count()),
            ]);
            self.w().end_line();

            self.w().add_all(&[
                "#define",
                "EYOT_RUNTIME_MAX_CLOSURE_SIZE",
                &format!("{}", program.max_closure_size),
            ]);
            self.w().end_line();

            self.w().add_all(&["#define", "EYOT_RUNTIME_GPU"]);
            self.w().end_line();

            // The device has no include path; inline the common header.
            self.w().raw(common_header);
        } else {
            self.w().raw("#include \"eyot-runtime-cpu.h\"");
        }
        self.w().end_line();
        self.w().end_line();

        let pool: Vec<String> = program.strings.entries().to_vec();

        if !self.writing_gpu {
            self.write_string_pool(&pool);
            self.w().end_line();
        }

        self.write_function_enum(program);
        self.write_arg_count_function(program);
        self.w().end_line();

        // Tuple instantiations are structural: the same shape may have
        // been required by several modules but is defined once.
        let mut seen = std::collections::HashSet::new();

        self.w().add("// Forward struct definitions");
        self.w().end_line();
        for module in program.modules() {
            let m = module.borrow();
            for required in &m.structs {
                if !seen.insert(required.type_id.clone()) {
                    continue;
                }

                let name = if required.generated_for_tuple {
                    required.id.name.clone()
                } else {
                    names::struct_name(&required.id)
                };
                self.w()
                    .add_all(&["typedef", "struct", &name, &name, ";"]);
                self.w().end_line();
            }
        }

        seen.clear();

        self.w().add("// Struct definitions");
        self.w().end_line();
        for module in program.modules() {
            let m = module.borrow();
            for required in &m.structs {
                if !seen.insert(required.type_id.clone()) {
                    continue;
                }

                let name = if required.generated_for_tuple {
                    required.id.name.clone()
                } else {
                    names::struct_name(&required.id)
                };

                self.w().add_all(&["typedef", "struct", &name, "{"]);
                self.w().end_line();

                self.w().indent();
                for field in &required.layout.fields {
                    self.write_type(&field.ty);
                    self.w().add_all(&[&field.name, ";"]);
                    self.w().end_line();
                }
                self.w().unindent();

                self.w().add_all(&["}", &name, ";"]);
                self.w().end_line();
            }
        }
        self.w().end_line();

        if !self.writing_gpu {
            self.write_vector_helpers(program);
        }

        self.w().add("// Forward declarations for all functions");
        self.w().end_line();
        for set in program.functions.sets() {
            for locus in Locus::all() {
                if !self.can_write(locus) {
                    continue;
                }
                for fid in set.ids_at(locus) {
                    self.write_function_prototype(&set.signature, fid);
                    self.w().add_no_space(";");
                    self.w().end_line();
                }
            }
        }
        self.w().end_line();

        if !self.writing_gpu {
            self.w().add("// Forward declarations for ffi");
            self.w().end_line();
            for module in program.modules() {
                let m = module.borrow();
                let Some(ffi) = &m.ffi else { continue };

                for cfn in &ffi.functions {
                    let sig = FunctionSignature {
                        locus: Locus::Cpu,
                        ret: cfn.return_type.clone(),
                        params: cfn.argument_types.clone(),
                    };

                    self.write_function_prototype_raw_name(&sig, &cfn.name);
                    self.w().add(";");
                    self.w().end_line();
                }
            }
        }

        self.w().add("// Consts");
        self.w().end_line();
        for module in program.modules() {
            let m = module.borrow();
            self.write_file(&m, true, &pool);
        }

        self.w().add("// Struct functions");
        self.w().end_line();
        for module in program.modules() {
            let m = module.borrow();
            for tlec in &m.elements {
                if let Tle::Struct(sds) = &tlec.element {
                    for fd in &sds.functions {
                        self.write_function(fd);
                        self.w().end_line();
                    }
                }
            }
        }
        self.w().end_line();

        self.w().add("// Non-struct code");
        self.w().end_line();
        for module in program.modules() {
            let m = module.borrow();
            self.write_file(&m, false, &pool);
        }

        self.w().add("// Function shims");
        self.w().end_line();
        self.write_arg_size_function(program);
        self.write_function_caller(program);

        if !self.writing_gpu {
            self.w().add("// Main function");
            self.w().end_line();
            self.write_main(program);
        }
    }
}
