#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use eyot_ast::{
    AccessExpr, AccessLValue, AssignKind, AssignStmt, BinaryExpr, BinaryOp, BoolLit, CallExpr,
    CastExpr, CharLit, ClosureExpr, ConstTle, CreatePipelineExpr, CreateWorkerExpr, DerefExpr,
    Errors, Expr, ExprStmt, FfiDefinitions, FloatLit, ForVariant, ForeachStmt, FunctionDefinition,
    FunctionId, FunctionParameter, GpuBuiltin, Ident, IdentLValue, IfSegment, IfStmt, ImportElement,
    IndexExpr, IndexLValue, IndexedKind, IntLit, LValue, Locus, Module, ModuleId, ModifyOp,
    ModifyStmt, NewExpr, RangeExpr, ReceiveWorkerExpr, ReturnStmt, Scope, SelfLValue, SelfRef,
    SendStmt, SourceLocation, StatementBlock, StatementContainer, Stmt, StrLit, StructDefinitionStatement,
    StructField, StructId, StructLit, StructLitPair, Tle, TleContainer, TupleExpr, Type, UnaryExpr,
    UnaryOp, VectorLit, WhileStmt, WorkerDestination,
};
use eyot_lex::{Token, TokenKind};

use crate::ModuleProvider;

pub struct Parser<'a> {
    tokens: &'a [Token],

    // Save/accept/reject position frames for bounded lookahead.
    frames: Vec<usize>,

    scope: Scope,

    /// When negative, `identifier { ... }` must not parse as a struct
    /// literal (set while parsing the head of if/while/for, where a brace
    /// starts the block instead).
    struct_literal_ok: i32,

    /// Positive inside loops; gates `break`.
    break_ok: i32,

    file_name: String,
    id: ModuleId,
    errors: &'a mut Errors,
    provider: Option<&'a mut dyn ModuleProvider>,
    disallowed: HashSet<String>,
    imports: Vec<ImportElement>,
    ffi: Option<FfiDefinitions>,
}

impl<'a> Parser<'a> {
    pub fn new(
        provider: Option<&'a mut dyn ModuleProvider>,
        id: ModuleId,
        tokens: &'a [Token],
        errors: &'a mut Errors,
        disallowed: HashSet<String>,
        ffi: Option<FfiDefinitions>,
    ) -> Parser<'a> {
        let root_scope = Scope::new(None);
        if let Some(ffi) = &ffi {
            root_scope.add_c_functions(&ffi.functions);
        }

        Parser {
            tokens,
            frames: vec![0],
            scope: root_scope,
            struct_literal_ok: 0,
            break_ok: 0,
            file_name: id.key(),
            id,
            errors,
            provider,
            disallowed,
            imports: Vec::new(),
            ffi,
        }
    }

    // ------------------------------------------------------------------
    // Frames and token access

    fn pos(&self) -> usize {
        *self.frames.last().unwrap_or(&0)
    }

    fn save(&mut self) {
        self.frames.push(self.pos());
    }

    fn accept(&mut self) {
        if let Some(top) = self.frames.pop() {
            if let Some(prev) = self.frames.last_mut() {
                *prev = top;
            }
        }
    }

    fn reject(&mut self) {
        self.frames.pop();
    }

    fn eof(&self) -> bool {
        self.pos() >= self.tokens.len()
    }

    fn get_token(&mut self) -> Option<Token> {
        if self.eof() {
            return None;
        }
        let pos = self.pos();
        let token = self.tokens[pos].clone();
        if let Some(top) = self.frames.last_mut() {
            *top = pos + 1;
        }
        Some(token)
    }

    /// Consume the next token if it has the wanted kind.
    fn token(&mut self, kind: TokenKind) -> Option<Token> {
        self.save();
        match self.get_token() {
            Some(tok) if tok.kind == kind => {
                self.accept();
                Some(tok)
            }
            _ => {
                self.reject();
                None
            }
        }
    }

    fn debug_peek(&mut self) -> String {
        self.save();
        let t = self.get_token();
        self.reject();
        match t {
            Some(tok) => tok.to_string(),
            None => "<eof>".to_string(),
        }
    }

    pub fn current_location(&self) -> SourceLocation {
        let pos = self.pos();
        if pos >= self.tokens.len() {
            SourceLocation::eof(&self.file_name)
        } else {
            SourceLocation::new(&self.file_name, self.tokens[pos].line as i64)
        }
    }

    fn log_error(&mut self, message: impl Into<String>) {
        let loc = self.current_location();
        self.errors.set_location(loc);
        self.errors.report(message);
    }

    fn log_expecting(&mut self, expecting: &str, context: &str) {
        let have = self.debug_peek();
        self.log_error(format!("Expecting '{expecting}' in {context}, have {have}"));
    }

    fn start_scope(&mut self) {
        self.scope = Scope::new(Some(&self.scope));
    }

    fn end_scope(&mut self) {
        if let Some(parent) = self.scope.parent() {
            self.scope = parent;
        }
    }

    fn current_module_id(&self) -> ModuleId {
        self.id.clone()
    }

    fn find_import(&self, alias: &str) -> Option<&ImportElement> {
        self.imports.iter().find(|ie| ie.import_as == alias)
    }

    // ------------------------------------------------------------------
    // Types

    /// A non-pointer type.
    fn whole_type(&mut self) -> Option<Type> {
        if self.token(TokenKind::OpenSquare).is_some() {
            let Some(inner) = self.parse_type() else {
                self.log_error("No type found after '['");
                return None;
            };
            if self.token(TokenKind::CloseSquare).is_none() {
                self.log_error("No close found for vector type");
                return None;
            }
            // Vectors are always inherently pointers.
            return Some(Type::vector(inner));
        }

        if self.token(TokenKind::Worker).is_some() {
            if self.token(TokenKind::OpenCurved).is_none() {
                self.log_error("Expecting '(' after worker");
                return None;
            }

            let send = self.parse_type().unwrap_or(Type::Void);

            if self.token(TokenKind::CloseCurved).is_none() {
                self.log_error("Expecting ')' after type");
                return None;
            }

            let recv = self.parse_type().unwrap_or(Type::Void);

            return Some(Type::Worker {
                send: Box::new(send),
                recv: Box::new(recv),
            });
        }

        if self.token(TokenKind::IntegerKeyword).is_some() {
            return Some(Type::Integer);
        }
        if self.token(TokenKind::Float32Keyword).is_some() {
            return Some(Type::float32());
        }
        if self.token(TokenKind::Float64Keyword).is_some() {
            return Some(Type::float64());
        }
        if self.token(TokenKind::CharKeyword).is_some() {
            return Some(Type::Character);
        }
        if self.token(TokenKind::BoolKeyword).is_some() {
            return Some(Type::Boolean);
        }
        if self.token(TokenKind::StringKeyword).is_some() {
            return Some(Type::Str);
        }

        if self.token(TokenKind::OpenCurved).is_some() {
            let mut items = Vec::new();
            loop {
                if !items.is_empty() && self.token(TokenKind::Comma).is_none() {
                    break;
                }

                let Some(ty) = self.parse_type() else {
                    self.log_error("Did not find type in tuple");
                    return None;
                };
                items.push(ty);
            }

            if self.token(TokenKind::CloseCurved).is_none() {
                self.log_error("Expecting close paren at the end of a tuple");
                return None;
            }

            return Some(Type::Tuple(items));
        }

        if let Some(tok) = self.token(TokenKind::Identifier) {
            return Some(Type::Struct(StructId::new(
                self.current_module_id(),
                tok.text,
            )));
        }

        None
    }

    /// A type, including pointer types.
    fn parse_type(&mut self) -> Option<Type> {
        self.save();
        let is_pointer = self.token(TokenKind::Multiply).is_some();

        let Some(ty) = self.whole_type() else {
            self.reject();
            return None;
        };
        self.accept();

        Some(if is_pointer { Type::pointer(ty) } else { ty })
    }

    // ------------------------------------------------------------------
    // Expressions

    /// `module::name`, resolved against the import table.
    fn resolved_id(&mut self) -> Option<(Rc<RefCell<Module>>, String)> {
        self.save();
        let Some(alias) = self.token(TokenKind::Identifier) else {
            self.reject();
            return None;
        };

        if self.token(TokenKind::ScopeResolution).is_none() {
            self.reject();
            return None;
        }

        let Some(symbol) = self.token(TokenKind::Identifier) else {
            self.log_error("No identifier found after scope resolution operator");
            self.reject();
            return None;
        };

        let Some(ie) = self.find_import(&alias.text) else {
            let name = alias.text.clone();
            self.log_error(format!("Parser failed to find module {name}"));
            self.reject();
            return None;
        };

        let module = ie.module.clone();
        self.accept();
        Some((module, symbol.text))
    }

    fn struct_literal_body(&mut self, module: ModuleId, name: &str) -> Option<StructLit> {
        self.token(TokenKind::OpenCurly)?;

        let mut pairs = Vec::new();
        let mut first_pass = true;

        loop {
            self.eat_semicolons();
            if self.token(TokenKind::CloseCurly).is_some() {
                return Some(StructLit {
                    id: StructId::new(module, name),
                    pairs,
                });
            }

            if !pairs.is_empty() {
                self.eat_semicolons();
                if self.token(TokenKind::Comma).is_none() {
                    self.log_expecting("comma", "struct literal");
                    return None;
                }
            } else if !first_pass {
                self.log_expecting("value or closing '}'", "struct literal");
                return None;
            }

            self.eat_semicolons();
            if let Some(pair) = self.literal_pair() {
                pairs.push(pair);
            }

            first_pass = false;
        }
    }

    /// `ident: expr` inside a struct literal.
    fn literal_pair(&mut self) -> Option<StructLitPair> {
        let ident = self.token(TokenKind::Identifier)?;

        if self.token(TokenKind::Colon).is_none() {
            let name = ident.text.clone();
            self.log_error(format!("Expecting colon after identifier in struct ({name})"));
            return None;
        }

        let Some(value) = self.expression() else {
            self.log_error("Expecting expression after colon in struct");
            return None;
        };

        Some(StructLitPair {
            field_name: ident.text,
            value,
        })
    }

    fn literal_value_expression(&mut self) -> Option<Expr> {
        if let Some(tok) = self.token(TokenKind::Integer) {
            return Some(Expr::Int(IntLit { value: tok.ival }));
        }

        if self.token(TokenKind::Null).is_some() {
            return Some(Expr::Null);
        }

        if self.token(TokenKind::SelfKeyword).is_some() {
            return Some(Expr::SelfRef(SelfRef::default()));
        }

        if let Some(tok) = self.token(TokenKind::Float32) {
            return Some(Expr::Float(FloatLit {
                int_part: tok.ival,
                zeros: tok.fval_zeros,
                frac_part: tok.fval,
                width: 32,
            }));
        }

        if let Some(tok) = self.token(TokenKind::Float64) {
            return Some(Expr::Float(FloatLit {
                int_part: tok.ival,
                zeros: tok.fval_zeros,
                frac_part: tok.fval,
                width: 64,
            }));
        }

        if let Some(tok) = self.token(TokenKind::Str) {
            return Some(Expr::Str(StrLit {
                value: tok.text,
                id: 0,
            }));
        }

        if let Some(tok) = self.token(TokenKind::Character) {
            return Some(Expr::Character(CharLit {
                code_point: tok.ival,
            }));
        }

        if self.token(TokenKind::True).is_some() {
            return Some(Expr::Bool(BoolLit { value: true }));
        }

        if self.token(TokenKind::False).is_some() {
            return Some(Expr::Bool(BoolLit { value: false }));
        }

        if self.token(TokenKind::GpuBuiltin).is_some() {
            if self.token(TokenKind::ScopeResolution).is_none() {
                self.log_expecting("::", "gpu builtin");
                return None;
            }

            let Some(ident) = self.token(TokenKind::Identifier) else {
                self.log_expecting("identifier", "gpu builtin");
                return None;
            };

            return Some(Expr::GpuBuiltin(GpuBuiltin { name: ident.text }));
        }

        if let Some((module, name)) = self.resolved_id() {
            let (finfo, sinfo, module_id, module_name) = {
                let m = module.borrow();
                (
                    m.function_info(&name),
                    m.struct_info(&name),
                    m.id.clone(),
                    m.id.display_name(),
                )
            };

            if let Some(f) = finfo {
                if !f.exported {
                    self.log_error(format!(
                        "Function {name} in module {module_name} is not exported"
                    ));
                    return None;
                }

                return Some(Expr::Ident(Ident {
                    name,
                    dont_namespace: false,
                    fid: Some(f.id),
                    cached: f.ty,
                    type_set_in_parse: true,
                }));
            } else if self.struct_literal_ok < 0 {
                self.log_error(
                    "Cannot parse a struct literal in this context (not a function, so interpreted that way)",
                );
                return None;
            } else if let Some(lit) = self.struct_literal_body(module_id, &name) {
                match sinfo {
                    Some(s) if s.exported => return Some(Expr::StructLit(lit)),
                    Some(_) => {
                        self.log_error(format!(
                            "struct {name} in module {module_name} is not exported"
                        ));
                        return None;
                    }
                    None => {
                        self.log_error("Do not recognise the scoped identifier in this context");
                        return None;
                    }
                }
            } else {
                self.log_error("Do not recognise the scoped identifier in this context");
                return None;
            }
        }

        if let Some(tok) = self.token(TokenKind::Identifier) {
            if self.struct_literal_ok < 0 {
                return Some(Expr::Ident(Ident::plain(tok.text)));
            }

            return match self.struct_literal_body(self.current_module_id(), &tok.text) {
                Some(lit) => Some(Expr::StructLit(lit)),
                None => Some(Expr::Ident(Ident::plain(tok.text))),
            };
        }

        // Vector literal: [T]{e, e, ...}
        if self.token(TokenKind::OpenSquare).is_some() {
            let Some(element_type) = self.parse_type() else {
                self.log_error("No type found after '['");
                return None;
            };

            if self.token(TokenKind::CloseSquare).is_none() {
                self.log_error("No close square found for vector literal");
            }
            if self.token(TokenKind::OpenCurly).is_none() {
                self.log_error("No open curly found for vector literal");
            }

            let Some(items) = self.expression_list(true) else {
                self.log_error("Expecting expression list in vector literal");
                return None;
            };

            if self.token(TokenKind::CloseCurly).is_none() {
                self.log_error("Expecting closed curly after vector literal");
            }

            return Some(Expr::VectorLit(VectorLit {
                element_type,
                items,
            }));
        }

        None
    }

    fn primary_expression(&mut self) -> Option<Expr> {
        if self.token(TokenKind::OpenCurved).is_some() {
            let Some(inner) = self.expression() else {
                self.log_error("Expecting an expression after the open paren");
                return None;
            };

            if self.token(TokenKind::CloseCurved).is_none() {
                self.log_error("Missing closing paren");
                return None;
            }

            return Some(inner);
        }

        self.literal_value_expression()
    }

    /// A comma-separated expression list; empty lists are valid.
    fn expression_list(&mut self, allow_trailing_comma: bool) -> Option<Vec<Expr>> {
        let mut items = Vec::new();

        match self.expression() {
            Some(e) => items.push(e),
            None => return Some(items),
        }

        while self.token(TokenKind::Comma).is_some() {
            match self.expression() {
                Some(e) => items.push(e),
                None => {
                    if allow_trailing_comma {
                        break;
                    }
                    self.log_error("Expecting expression after comma in expression list");
                    return None;
                }
            }
        }

        Some(items)
    }

    /// Expression list where `_` marks a placeholder position.
    fn placeholder_expression_list(&mut self) -> Option<Vec<Option<Expr>>> {
        let mut items = Vec::new();

        if self.token(TokenKind::Placeholder).is_some() {
            items.push(None);
        } else {
            match self.expression() {
                Some(e) => items.push(Some(e)),
                None => return Some(items),
            }
        }

        while self.token(TokenKind::Comma).is_some() {
            if self.token(TokenKind::Placeholder).is_some() {
                items.push(None);
                continue;
            }

            match self.expression() {
                Some(e) => items.push(Some(e)),
                None => {
                    self.log_error("Expecting expression after comma in expression list");
                    return None;
                }
            }
        }

        Some(items)
    }

    fn postfix_expression(&mut self) -> Option<Expr> {
        let mut pe = self.primary_expression()?;

        loop {
            if self.token(TokenKind::As).is_some() {
                let Some(ty) = self.parse_type() else {
                    self.log_expecting("type", "cast expression");
                    return None;
                };

                pe = Expr::Cast(CastExpr {
                    new_type: ty,
                    casted: Box::new(pe),
                    check_castable: true,
                });
                continue;
            }

            if self.token(TokenKind::OpenCurved).is_some() {
                let args = self.expression_list(false)?;

                if self.token(TokenKind::CloseCurved).is_none() {
                    self.log_expecting(")", "call expression");
                    return None;
                }

                pe = Expr::Call(CallExpr::new(pe, args));
                continue;
            }

            if self.token(TokenKind::OpenSquare).is_some() {
                let index = self.expression()?;

                if self.token(TokenKind::CloseSquare).is_none() {
                    let have = self.debug_peek();
                    self.log_error(format!("Expecting ']' in index expression, have {have}"));
                    return None;
                }

                pe = Expr::Index(IndexExpr {
                    indexed: Box::new(pe),
                    index: Box::new(index),
                    cached: Type::Void,
                    kind: IndexedKind::Vector,
                });
                continue;
            }

            if self.token(TokenKind::Dot).is_some() {
                let Some(ident) = self.token(TokenKind::Identifier) else {
                    self.log_error("Expected an identifier after '.'");
                    return None;
                };

                pe = Expr::Access(AccessExpr {
                    accessed: Box::new(pe),
                    field: ident.text,
                    allow_raw: false,
                    cached: Type::Void,
                });
                continue;
            }

            break;
        }

        Some(pe)
    }

    fn unary_expression(&mut self) -> Option<Expr> {
        for (kind, op) in [
            (TokenKind::Not, UnaryOp::Not),
            (TokenKind::Minus, UnaryOp::Negate),
        ] {
            if self.token(kind).is_none() {
                continue;
            }

            let Some(rhs) = self.postfix_expression() else {
                self.log_error(format!("Expecting expression after {kind:?}"));
                return None;
            };

            return Some(Expr::Unary(UnaryExpr {
                op,
                rhs: Box::new(rhs),
                cached: Type::Void,
            }));
        }

        self.postfix_expression()
    }

    fn binary_level(
        &mut self,
        table: &[(TokenKind, BinaryOp)],
        next: fn(&mut Self) -> Option<Expr>,
    ) -> Option<Expr> {
        let mut lhs = next(self)?;

        'outer: loop {
            for (kind, op) in table {
                if self.token(*kind).is_none() {
                    continue;
                }

                let Some(rhs) = next(self) else {
                    self.log_error("Expecting RHS expression");
                    return None;
                };

                lhs = Expr::Binary(BinaryExpr {
                    op: *op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    cached: Type::Void,
                });
                continue 'outer;
            }
            break;
        }

        Some(lhs)
    }

    fn multiplicative_expression(&mut self) -> Option<Expr> {
        self.binary_level(
            &[
                (TokenKind::Multiply, BinaryOp::Multiply),
                (TokenKind::Divide, BinaryOp::Divide),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
            Self::unary_expression,
        )
    }

    fn additive_expression(&mut self) -> Option<Expr> {
        self.binary_level(
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Subtract),
            ],
            Self::multiplicative_expression,
        )
    }

    fn relational_expression(&mut self) -> Option<Expr> {
        self.binary_level(
            &[
                (TokenKind::GreaterThan, BinaryOp::Gt),
                (TokenKind::GreaterThanOrEqual, BinaryOp::Gte),
                (TokenKind::LessThan, BinaryOp::Lt),
                (TokenKind::LessThanOrEqual, BinaryOp::Lte),
            ],
            Self::additive_expression,
        )
    }

    fn equality_expression(&mut self) -> Option<Expr> {
        self.binary_level(
            &[
                (TokenKind::Equality, BinaryOp::Equality),
                (TokenKind::Inequality, BinaryOp::Inequality),
            ],
            Self::relational_expression,
        )
    }

    fn logical_and_expression(&mut self) -> Option<Expr> {
        self.binary_level(&[(TokenKind::And, BinaryOp::And)], Self::equality_expression)
    }

    fn logical_or_expression(&mut self) -> Option<Expr> {
        self.binary_level(&[(TokenKind::Or, BinaryOp::Or)], Self::logical_and_expression)
    }

    fn allocation_expression(&mut self) -> Option<Expr> {
        self.save();

        let is_allocated = self.token(TokenKind::New).is_some();
        let Some(inner) = self.logical_or_expression() else {
            self.reject();
            return None;
        };
        self.accept();

        if is_allocated {
            Some(Expr::New(NewExpr {
                init: Box::new(inner),
            }))
        } else {
            Some(inner)
        }
    }

    fn range_expression_tail(&mut self) -> Option<Expr> {
        if self.token(TokenKind::OpenCurved).is_none() {
            self.log_error("Expecting '(' after 'range'");
            return None;
        }

        let Some(first) = self.expression() else {
            self.log_error("Expecting expression after 'range('");
            return None;
        };
        let mut vals = vec![first];

        for _ in 0..2 {
            if self.token(TokenKind::Comma).is_some() {
                let Some(e) = self.expression() else {
                    self.log_error("Expecting expression after ','");
                    return None;
                };
                vals.push(e);
            }
        }

        if self.token(TokenKind::CloseCurved).is_none() {
            self.log_error("Expecting ')' after 'range'");
            return None;
        }

        let one = || Box::new(Expr::Int(IntLit { value: 1 }));
        let zero = || Box::new(Expr::Int(IntLit { value: 0 }));

        let mut drained = vals.into_iter();
        let range = match drained.len() {
            1 => RangeExpr {
                count: Box::new(drained.next()?),
                start: zero(),
                step: one(),
            },
            2 => RangeExpr {
                start: Box::new(drained.next()?),
                count: Box::new(drained.next()?),
                step: one(),
            },
            _ => RangeExpr {
                start: Box::new(drained.next()?),
                count: Box::new(drained.next()?),
                step: Box::new(drained.next()?),
            },
        };

        Some(Expr::Range(range))
    }

    fn prefixed_expression(&mut self) -> Option<Expr> {
        self.save();

        if self.token(TokenKind::Range).is_some() {
            self.accept();
            return self.range_expression_tail();
        }

        if self.token(TokenKind::Multiply).is_some() {
            let Some(inner) = self.allocation_expression() else {
                self.reject();
                return None;
            };
            self.accept();

            return Some(Expr::Deref(DerefExpr {
                pointer: Box::new(inner),
            }));
        }

        if self.token(TokenKind::Drain).is_some() {
            if self.token(TokenKind::OpenCurved).is_none() {
                self.log_error("Expecting '(' after 'drain'");
                self.reject();
                return None;
            }

            let Some(pipe) = self.allocation_expression() else {
                self.reject();
                return None;
            };
            self.accept();

            if self.token(TokenKind::CloseCurved).is_none() {
                self.log_error("Expecting ')' after expression in 'drain'");
                return None;
            }

            return Some(Expr::ReceiveWorker(ReceiveWorkerExpr {
                worker: Box::new(pipe),
                received: None,
                all: true,
            }));
        }

        if self.token(TokenKind::Partial).is_some() {
            let Some(pe) = self.primary_expression() else {
                self.log_expecting("primary expression", "partial expression");
                self.reject();
                return None;
            };

            if self.token(TokenKind::OpenCurved).is_none() {
                self.log_expecting("(", "partial expression");
                self.reject();
                return None;
            }

            let Some(supplied) = self.placeholder_expression_list() else {
                self.reject();
                return None;
            };

            if self.token(TokenKind::CloseCurved).is_none() {
                self.log_expecting(")", "partial expression");
                self.reject();
                return None;
            }

            if supplied.is_empty() {
                self.log_error("There is no reason to partially apply a function of 0 arguments");
                self.reject();
                return None;
            }

            self.accept();
            return Some(Expr::Closure(ClosureExpr {
                callee: Box::new(pe),
                called_fid: None,
                supplied,
                arg_variables: Vec::new(),
                arg_array_name: String::new(),
            }));
        }

        if self.token(TokenKind::Pipeline).is_some() {
            let Some(lhs) = self.expression() else {
                self.log_expecting("expression", "pipeline (1)");
                self.reject();
                return None;
            };

            let Some(rhs) = self.expression() else {
                self.log_expecting("expression", "pipeline (2)");
                self.reject();
                return None;
            };

            self.accept();
            return Some(Expr::CreatePipeline(CreatePipelineExpr {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                send_ty: Type::Void,
                recv_ty: Type::Void,
                intermediate: Type::Void,
            }));
        }

        if self.token(TokenKind::Receive).is_some() {
            if self.token(TokenKind::OpenCurved).is_none() {
                self.log_error("Expecting '(' after 'receive'");
                self.reject();
                return None;
            }

            let Some(pipe) = self.allocation_expression() else {
                self.reject();
                return None;
            };

            if self.token(TokenKind::CloseCurved).is_none() {
                self.log_error("Expecting ')' after expression in 'receive'");
                self.reject();
                return None;
            }

            self.accept();
            return Some(Expr::ReceiveWorker(ReceiveWorkerExpr {
                worker: Box::new(pipe),
                received: None,
                all: false,
            }));
        }

        let is_cpu = self.token(TokenKind::Cpu).is_some();
        let is_gpu = !is_cpu && self.token(TokenKind::Gpu).is_some();
        if is_cpu || is_gpu {
            let Some(worker) = self.expression() else {
                self.reject();
                return None;
            };
            self.accept();

            return Some(Expr::CreateWorker(CreateWorkerExpr {
                worker: Box::new(worker),
                send_ty: Type::Void,
                recv_ty: Type::Void,
                destination: if is_gpu {
                    WorkerDestination::Gpu
                } else {
                    WorkerDestination::Cpu
                },
                closure_variable: None,
                wrapper_id: None,
                kernel_id: None,
            }));
        }

        self.reject();
        self.allocation_expression()
    }

    /// An expression; tuple expressions are not admitted here (they only
    /// appear on the rhs of assignments and returns).
    pub fn expression(&mut self) -> Option<Expr> {
        self.struct_literal_ok += 1;
        let e = self.prefixed_expression();
        self.struct_literal_ok -= 1;
        e
    }

    /// An expression, or a comma-joined tuple of them. A "tuple" of one
    /// element is just that element.
    fn tuple_expression(&mut self) -> Option<Expr> {
        let leading = self.expression()?;
        let mut items = vec![leading];

        loop {
            if self.token(TokenKind::Comma).is_none() {
                return Some(if items.len() == 1 {
                    items.pop()?
                } else {
                    Expr::Tuple(TupleExpr { items })
                });
            }

            let Some(next) = self.expression() else {
                self.log_error("Expecting expression after comma in expression list");
                return None;
            };
            items.push(next);
        }
    }

    // ------------------------------------------------------------------
    // LValues

    fn simple_lvalue(&mut self) -> Option<LValue> {
        if self.token(TokenKind::SelfKeyword).is_some() {
            return Some(LValue::SelfLv(SelfLValue::default()));
        }

        let ident = self.token(TokenKind::Identifier)?;
        Some(LValue::Ident(IdentLValue {
            name: ident.text,
            cached: Type::Void,
        }))
    }

    fn access_lvalue(&mut self) -> Option<LValue> {
        let lv = self.simple_lvalue()?;

        if self.token(TokenKind::Dot).is_some() {
            let Some(ident) = self.token(TokenKind::Identifier) else {
                self.log_error("No identifier found after dot in lvalue");
                return None;
            };

            return Some(LValue::Access(AccessLValue {
                inner: Box::new(lv),
                field_name: ident.text,
                cached: Type::Void,
            }));
        }

        Some(lv)
    }

    fn indexing_lvalue(&mut self) -> Option<LValue> {
        let mut lv = self.access_lvalue()?;

        while self.token(TokenKind::OpenSquare).is_some() {
            let Some(index) = self.expression() else {
                self.log_error("Expected an expression after '[' in lvalue");
                return None;
            };

            if self.token(TokenKind::CloseSquare).is_none() {
                self.log_error("Expected an ']' in lvalue");
                return None;
            }

            lv = LValue::Index(IndexLValue {
                indexed: Box::new(lv),
                index,
                cached: Type::Void,
            });
        }

        Some(lv)
    }

    fn dereference_lvalue(&mut self) -> Option<LValue> {
        self.save();
        let is_deref = self.token(TokenKind::Multiply).is_some();

        let Some(lv) = self.indexing_lvalue() else {
            self.reject();
            return None;
        };
        self.accept();

        Some(if is_deref {
            LValue::Deref(Box::new(lv))
        } else {
            lv
        })
    }

    fn lvalue(&mut self) -> Option<LValue> {
        let first = self.dereference_lvalue()?;
        let mut lvalues = vec![first];

        loop {
            if self.token(TokenKind::Comma).is_none() {
                return Some(if lvalues.len() == 1 {
                    lvalues.pop()?
                } else {
                    LValue::Multiple(lvalues)
                });
            }

            let Some(next) = self.dereference_lvalue() else {
                self.log_error("Expecting l-values after comma");
                return None;
            };
            lvalues.push(next);
        }
    }

    // ------------------------------------------------------------------
    // Statements

    fn send_statement(&mut self) -> Option<Stmt> {
        self.token(TokenKind::Send)?;

        if self.token(TokenKind::OpenCurved).is_none() {
            self.log_error("Expecting '(' after 'send'");
            return None;
        }

        let Some(pipe) = self.expression() else {
            self.log_error("Expecting expression after 'send'");
            return None;
        };

        if self.token(TokenKind::Comma).is_none() {
            self.log_error("Expecting comma after 'send' first expression");
            return None;
        }

        let Some(value) = self.expression() else {
            self.log_error("Expecting second value after 'send'");
            return None;
        };

        if self.token(TokenKind::CloseCurved).is_none() {
            self.log_error("Expecting ')' after 'send' expressions");
            return None;
        }

        Some(Stmt::Send(SendStmt { pipe, value }))
    }

    fn foreach_statement(&mut self) -> Option<Stmt> {
        self.token(TokenKind::Foreach)?;

        let Some(ident) = self.token(TokenKind::Identifier) else {
            self.log_error("Expecting identifier after 'for'");
            return None;
        };

        if self.token(TokenKind::Colon).is_none() {
            self.log_error("Expecting ':' after identifier in 'for'");
            return None;
        }

        self.struct_literal_ok -= 2;
        let iterable = self.expression();
        self.struct_literal_ok += 2;
        let Some(iterable) = iterable else {
            self.log_error("Expecting expression after ':' in 'for'");
            return None;
        };

        self.break_ok += 1;
        let block = self.statement_block();
        self.break_ok -= 1;
        let Some(body) = block else {
            self.log_error("Statement block expected after for statement");
            return None;
        };

        Some(Stmt::Foreach(ForeachStmt {
            variable: ident.text,
            iterable,
            iterated_type: Type::Void,
            body,
            variant: ForVariant::Each,
            start_name: String::new(),
            end_name: String::new(),
            step_name: String::new(),
        }))
    }

    fn let_like_statement(&mut self, kind: TokenKind, assign: AssignKind) -> Option<AssignStmt> {
        self.token(kind)?;

        let Some(lhs) = self.lvalue() else {
            self.log_error("No lvalue found after let or const");
            return None;
        };

        if self.token(TokenKind::Equals).is_none() {
            self.log_error("No equals found in let statement");
            return None;
        }

        let Some(rhs) = self.expression() else {
            self.log_error("No expression found in let statement");
            return None;
        };

        Some(AssignStmt {
            kind: assign,
            lhs,
            rhs: Some(rhs),
            new_type: Type::Void,
            pin_pointers: true,
        })
    }

    fn let_statement(&mut self) -> Option<Stmt> {
        self.let_like_statement(TokenKind::Let, AssignKind::Let)
            .map(Stmt::Assign)
    }

    fn const_statement(&mut self) -> Option<Stmt> {
        self.let_like_statement(TokenKind::Const, AssignKind::Const)
            .map(Stmt::Assign)
    }

    fn modify_operator(&mut self) -> Option<ModifyOp> {
        for (kind, op) in [
            (TokenKind::PlusEquals, ModifyOp::Plus),
            (TokenKind::MinusEquals, ModifyOp::Minus),
            (TokenKind::TimesEquals, ModifyOp::Times),
            (TokenKind::DivideEquals, ModifyOp::Divide),
        ] {
            if self.token(kind).is_some() {
                return Some(op);
            }
        }
        None
    }

    fn modify_in_place_statement(&mut self) -> Option<Stmt> {
        self.save();
        let Some(target) = self.lvalue() else {
            self.reject();
            return None;
        };

        let Some(op) = self.modify_operator() else {
            self.reject();
            return None;
        };

        self.accept();

        let Some(value) = self.expression() else {
            self.log_error("Expression expected after modify in place operator");
            return None;
        };

        Some(Stmt::Modify(ModifyStmt { op, target, value }))
    }

    fn assign_statement(&mut self) -> Option<Stmt> {
        self.save();
        let Some(lhs) = self.lvalue() else {
            self.reject();
            return None;
        };

        if self.token(TokenKind::Equals).is_none() {
            self.reject();
            return None;
        }

        let Some(rhs) = self.tuple_expression() else {
            self.reject();
            self.log_error("Expression expected after assignment");
            return None;
        };

        self.accept();

        Some(Stmt::Assign(AssignStmt {
            kind: AssignKind::Normal,
            lhs,
            rhs: Some(rhs),
            new_type: Type::Void,
            pin_pointers: true,
        }))
    }

    fn break_statement(&mut self) -> Option<Stmt> {
        self.token(TokenKind::Break)?;

        if self.break_ok == 0 {
            self.log_error("Cannot break outside of a breakable block (e.g. for or while)");
            return None;
        }

        Some(Stmt::Break)
    }

    fn while_statement(&mut self) -> Option<Stmt> {
        self.token(TokenKind::While)?;

        self.struct_literal_ok -= 2;
        let condition = self.expression();
        self.struct_literal_ok += 2;
        let Some(condition) = condition else {
            self.log_error("Expression expected after while statement");
            return None;
        };

        self.break_ok += 1;
        let block = self.statement_block();
        self.break_ok -= 1;
        let Some(block) = block else {
            self.log_error("Statement block expected after while statement");
            return None;
        };

        Some(Stmt::While(WhileStmt { condition, block }))
    }

    fn if_statement(&mut self) -> Option<Stmt> {
        self.token(TokenKind::If)?;

        self.struct_literal_ok -= 2;
        let condition = self.expression();
        self.struct_literal_ok += 2;
        let Some(condition) = condition else {
            self.log_error("Expression expected after if statement");
            return None;
        };

        let Some(block) = self.statement_block() else {
            self.log_error("Statement block expected after if statement");
            return None;
        };

        let mut segments = vec![IfSegment {
            condition: Some(condition),
            block,
        }];

        while self.token(TokenKind::ElseIf).is_some() {
            self.struct_literal_ok -= 2;
            let condition = self.expression();
            self.struct_literal_ok += 2;
            let Some(condition) = condition else {
                self.log_error("Expression expected after elseif statement");
                return None;
            };

            let Some(block) = self.statement_block() else {
                self.log_error("Statement block expected after elseif statement");
                return None;
            };

            segments.push(IfSegment {
                condition: Some(condition),
                block,
            });
        }

        if self.token(TokenKind::Else).is_some() {
            let Some(block) = self.statement_block() else {
                self.log_error("Statement block expected after else statement");
                return None;
            };

            segments.push(IfSegment {
                condition: None,
                block,
            });
        }

        Some(Stmt::If(IfStmt { segments }))
    }

    fn return_statement(&mut self) -> Option<Stmt> {
        self.token(TokenKind::Return)?;

        self.save();
        match self.tuple_expression() {
            Some(value) => {
                self.accept();
                Some(Stmt::Return(ReturnStmt { value: Some(value) }))
            }
            None => {
                self.reject();
                Some(Stmt::Return(ReturnStmt { value: None }))
            }
        }
    }

    fn expression_statement(&mut self) -> Option<Stmt> {
        let expr = self.expression()?;
        Some(Stmt::Expr(ExprStmt { expr }))
    }

    fn eat_semicolons(&mut self) {
        while self.token(TokenKind::Semicolon).is_some() {}
    }

    pub fn statement(&mut self) -> Option<Stmt> {
        self.eat_semicolons();

        let parsers: [fn(&mut Self) -> Option<Stmt>; 11] = [
            Self::foreach_statement,
            Self::let_statement,
            Self::const_statement,
            Self::send_statement,
            Self::return_statement,
            Self::if_statement,
            Self::while_statement,
            Self::break_statement,
            Self::modify_in_place_statement,
            Self::assign_statement,
            Self::expression_statement,
        ];

        for parse in parsers {
            if let Some(s) = parse(self) {
                self.eat_semicolons();
                return Some(s);
            }
        }

        None
    }

    pub fn statement_block(&mut self) -> Option<StatementBlock> {
        self.token(TokenKind::OpenCurly)?;

        self.start_scope();
        let result = self.statement_block_body();
        self.end_scope();
        result
    }

    fn statement_block_body(&mut self) -> Option<StatementBlock> {
        let mut statements = Vec::new();

        loop {
            let loc = self.current_location();

            let Some(stmt) = self.statement() else {
                break;
            };

            statements.push(StatementContainer {
                stmt: Stmt::Dummy(loc),
                scope: self.scope.clone(),
            });
            statements.push(StatementContainer {
                stmt,
                scope: self.scope.clone(),
            });
        }

        if self.token(TokenKind::CloseCurly).is_none() {
            self.log_error("No close curly found at the end of a statement block");
            return None;
        }

        Some(StatementBlock {
            statements,
            scope: self.scope.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Top-level elements

    /// A batch of parameters sharing one type: `a, b, c i64`.
    fn parameter_list_segment(&mut self) -> Option<Vec<FunctionParameter>> {
        let mut names = Vec::new();

        let Some(leading) = self.token(TokenKind::Identifier) else {
            return Some(Vec::new());
        };
        names.push(leading.text);

        while self.token(TokenKind::Comma).is_some() {
            let Some(next) = self.token(TokenKind::Identifier) else {
                self.log_error("Expecting identifier after comma in parameter list");
                return None;
            };
            names.push(next.text);
        }

        let Some(ty) = self.parse_type() else {
            self.log_error("Expecting type after parameters in parameter list");
            return None;
        };

        Some(
            names
                .into_iter()
                .map(|name| FunctionParameter {
                    name,
                    ty: ty.clone(),
                })
                .collect(),
        )
    }

    /// A full parameter list: `a, b i64, c string`.
    fn parameter_list(&mut self) -> Option<Vec<FunctionParameter>> {
        let mut params = Vec::new();

        let leading = self.parameter_list_segment()?;
        if leading.is_empty() {
            return Some(params);
        }
        params.extend(leading);

        while self.token(TokenKind::Comma).is_some() {
            let Some(next) = self.parameter_list_segment() else {
                self.log_error("Expecting parameters after comma in parameter list");
                return None;
            };
            params.extend(next);
        }

        Some(params)
    }

    pub fn function_definition(&mut self) -> Option<FunctionDefinition> {
        self.save();

        let exported = self.token(TokenKind::Export).is_some();

        let mut locus = Locus::Anywhere;
        if self.token(TokenKind::Cpu).is_some() {
            locus = Locus::Cpu;
        } else if self.token(TokenKind::Gpu).is_some() {
            locus = Locus::Gpu;
        }

        if self.token(TokenKind::Function).is_none() {
            self.reject();
            return None;
        }
        // From here it is a function or a failure.
        self.accept();

        self.start_scope();
        let result = self.function_definition_body(exported, locus);
        self.end_scope();
        result
    }

    fn function_definition_body(
        &mut self,
        exported: bool,
        locus: Locus,
    ) -> Option<FunctionDefinition> {
        let Some(ident) = self.token(TokenKind::Identifier) else {
            self.log_error("No identifier found after 'fn'");
            return None;
        };

        if self.token(TokenKind::OpenCurved).is_none() {
            self.log_error("No open paren found in function definition");
            return None;
        }

        let parameters = self.parameter_list()?;

        for param in &parameters {
            self.scope.set_variable(&param.name, param.ty.clone(), true);
        }

        if self.token(TokenKind::CloseCurved).is_none() {
            self.log_error("No close paren found in function definition");
            return None;
        }

        let ret = self.parse_type().unwrap_or(Type::Void);

        let Some(block) = self.statement_block() else {
            self.log_error("No statement block found following function definition");
            return None;
        };

        Some(FunctionDefinition {
            id: FunctionId::free(self.id.clone(), ident.text),
            ret,
            locus,
            exported,
            skip_check_pass: false,
            block,
            parameters,
        })
    }

    fn struct_definition(&mut self) -> Option<Tle> {
        self.save();
        let exported = self.token(TokenKind::Export).is_some();

        if self.token(TokenKind::Struct).is_none() {
            self.reject();
            return None;
        }
        self.accept();

        let Some(name_tok) = self.token(TokenKind::Identifier) else {
            self.log_error("Expecting identifier after struct keyword");
            return None;
        };
        let struct_id = StructId::new(self.current_module_id(), name_tok.text);

        self.start_scope();
        let result = self.struct_definition_body(exported, struct_id);
        self.end_scope();
        result
    }

    fn struct_definition_body(&mut self, exported: bool, struct_id: StructId) -> Option<Tle> {
        let our_scope = self.scope.clone();
        our_scope.set_variable(
            "__self__",
            Type::pointer(Type::Struct(struct_id.clone())),
            false,
        );

        if self.token(TokenKind::OpenCurly).is_none() {
            self.log_error("Expecting '{' after struct name");
            return None;
        }

        let mut fields: Vec<StructField> = Vec::new();
        let mut functions: Vec<FunctionDefinition> = Vec::new();

        loop {
            self.eat_semicolons();

            if let Some(mut fd) = self.function_definition() {
                fd.id.struct_id = struct_id.clone();
                functions.push(fd);
                continue;
            }

            match self.parameter_list_segment() {
                Some(segment) if !segment.is_empty() => {
                    for p in segment {
                        fields.push(StructField {
                            name: p.name,
                            ty: p.ty,
                        });
                    }
                }
                _ => break,
            }
        }

        self.eat_semicolons();
        if self.token(TokenKind::CloseCurly).is_none() {
            self.log_error("Expecting '}' after struct");
            return None;
        }

        Some(Tle::Struct(StructDefinitionStatement {
            exported,
            id: struct_id,
            fields,
            functions,
            scope: our_scope,
        }))
    }

    fn import_line(&mut self) -> Option<Tle> {
        self.token(TokenKind::Import)?;

        let Some(first) = self.token(TokenKind::Identifier) else {
            self.log_error("Expecting identifier after import");
            return None;
        };

        let mut names = vec![first.text.clone()];
        let mut import_as = first.text;

        while self.token(TokenKind::ScopeResolution).is_some() {
            let Some(next) = self.token(TokenKind::Identifier) else {
                self.log_error("Expecting identifier after '::' in import");
                return None;
            };
            import_as = next.text.clone();
            names.push(next.text);
        }

        let imported_id = ModuleId::new(names);

        if self.disallowed.contains(&imported_id.key()) {
            let from = self.id.key();
            self.log_error(format!(
                "Import cycle found when importing '{}' from '{}'",
                imported_id.key(),
                from
            ));
            return None;
        }

        if self.token(TokenKind::As).is_some() {
            let Some(alias) = self.token(TokenKind::Identifier) else {
                self.log_expecting("identifier", "import statement");
                return None;
            };
            import_as = alias.text;
        }

        let module = match self.provider.as_deref_mut() {
            Some(provider) => provider.get_module(&imported_id, &self.disallowed, self.errors),
            None => None,
        };
        let Some(module) = module else {
            // Keep cascades out: a cycle (or parse failure) below already
            // carries the useful diagnostic.
            if self.errors.clean() {
                let dotted = imported_id.parts().join(".");
                self.log_error(format!("Parser failed to find module {dotted}"));
            }
            return None;
        };

        {
            let imported = module.borrow();
            for s in &imported.structs {
                self.scope.set_struct(&s.id, s.layout.clone());
            }
        }

        let element = ImportElement {
            names: imported_id,
            import_as,
            module,
        };
        self.imports.push(element.clone());

        Some(Tle::Import(element))
    }

    fn const_tle(&mut self) -> Option<Tle> {
        let assign = self.let_like_statement(TokenKind::Const, AssignKind::Const)?;
        Some(Tle::Const(ConstTle { assign }))
    }

    fn function_definition_tle(&mut self) -> Option<Tle> {
        self.function_definition().map(Tle::Function)
    }

    pub fn top_level_element(&mut self) -> Option<Tle> {
        let parsers: [fn(&mut Self) -> Option<Tle>; 4] = [
            Self::struct_definition,
            Self::function_definition_tle,
            Self::const_tle,
            Self::import_line,
        ];

        for parse in parsers {
            self.eat_semicolons();
            if let Some(tle) = parse(self) {
                return Some(tle);
            }
        }

        self.eat_semicolons();
        None
    }

    /// Parse the whole token stream into a module. Returns `None` (with
    /// diagnostics recorded) on failure.
    pub fn module(mut self) -> Option<Module> {
        self.start_scope();
        let module_scope = self.scope.clone();

        let mut elements = Vec::new();

        loop {
            let loc = self.current_location();

            let Some(tle) = self.top_level_element() else {
                break;
            };
            if !self.errors.clean() {
                return None;
            }

            elements.push(TleContainer {
                element: Tle::Dummy(loc),
                scope: self.scope.clone(),
            });
            elements.push(TleContainer {
                element: tle,
                scope: self.scope.clone(),
            });
        }

        if self.token(TokenKind::Eof).is_none() {
            let have = self.debug_peek();
            self.log_error(format!("Expecting EOF, got {have}"));
            return None;
        }

        Some(Module {
            id: self.id.clone(),
            elements,
            structs: Vec::new(),
            scope: module_scope,
            ffi: self.ffi.take(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyot_lex::tokenize;

    fn with_parser<T>(src: &str, f: impl FnOnce(&mut Parser<'_>) -> T) -> T {
        let tokens = tokenize(src).expect("tokenize failed");
        let mut errors = Errors::new();
        let mut parser = Parser::new(
            None,
            ModuleId::single("<unittest>"),
            &tokens,
            &mut errors,
            HashSet::new(),
            None,
        );
        f(&mut parser)
    }

    #[test]
    fn terminals() {
        with_parser("12 \"hi\" true", |p| {
            match p.expression() {
                Some(Expr::Int(it)) => assert_eq!(it.value, 12),
                other => panic!("wrong expression: {other:?}"),
            }
            match p.expression() {
                Some(Expr::Str(st)) => assert_eq!(st.value, "hi"),
                other => panic!("wrong expression: {other:?}"),
            }
            match p.expression() {
                Some(Expr::Bool(bt)) => assert!(bt.value),
                other => panic!("wrong expression: {other:?}"),
            }
        });
    }

    #[test]
    fn empty_statement_block() {
        with_parser("{}", |p| {
            let block = p.statement_block().expect("no block");
            assert!(block.statements.is_empty());
        });
    }

    #[test]
    fn statements_carry_location_dummies() {
        with_parser("{\nhello(12)\nthere(13)\n }", |p| {
            let block = p.statement_block().expect("no block");
            // Two parsed statements, each preceded by a location carrier.
            assert_eq!(block.statements.len(), 4);
        });
    }

    #[test]
    fn function_definition_parses() {
        with_parser("fn foo() {\nhello(12)\n }", |p| {
            let tle = p.top_level_element().expect("no tle");
            match tle {
                Tle::Function(fd) => {
                    assert_eq!(fd.id.name, "foo");
                    assert_eq!(fd.block.statements.len(), 2);
                    assert_eq!(fd.ret, Type::Void);
                }
                other => panic!("wrong element: {other:?}"),
            }
        });
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        for src in ["1 + 2 * 3", "1 * 2 + 3"] {
            with_parser(src, |p| match p.expression() {
                Some(Expr::Binary(top)) => assert_eq!(top.op, BinaryOp::Add),
                other => panic!("wrong expression for {src:?}: {other:?}"),
            });
        }
    }

    #[test]
    fn parens_override_precedence() {
        with_parser("(1 + 2) * 3", |p| match p.expression() {
            Some(Expr::Binary(top)) => assert_eq!(top.op, BinaryOp::Multiply),
            other => panic!("wrong expression: {other:?}"),
        });
    }

    #[test]
    fn lvalue_index_of_access() {
        with_parser("a.b[c]", |p| {
            let lv = p.lvalue().expect("no lvalue");
            match lv {
                LValue::Index(ilv) => match *ilv.indexed {
                    LValue::Access(_) => {}
                    other => panic!("inner was not an access: {other:?}"),
                },
                other => panic!("top level was not an index: {other:?}"),
            }
        });
    }

    #[test]
    fn single_element_tuple_is_the_element() {
        with_parser("1", |p| {
            let e = p.tuple_expression().expect("no expression");
            assert!(matches!(e, Expr::Int(_)));
        });
        with_parser("1, 2", |p| {
            let e = p.tuple_expression().expect("no expression");
            match e {
                Expr::Tuple(t) => assert_eq!(t.items.len(), 2),
                other => panic!("expected tuple, got {other:?}"),
            }
        });
    }

    #[test]
    fn range_argument_expansion() {
        let expect = |src: &str, start: i64, step: i64| {
            with_parser(src, |p| match p.expression() {
                Some(Expr::Range(r)) => {
                    match *r.start {
                        Expr::Int(ref i) => assert_eq!(i.value, start, "{src}"),
                        ref other => panic!("start not an int: {other:?}"),
                    }
                    match *r.step {
                        Expr::Int(ref i) => assert_eq!(i.value, step, "{src}"),
                        ref other => panic!("step not an int: {other:?}"),
                    }
                }
                other => panic!("not a range: {other:?}"),
            })
        };

        expect("range(10)", 0, 1);
        expect("range(2, 10)", 2, 1);
        expect("range(2, 10, 3)", 2, 3);
    }

    #[test]
    fn partial_placeholders_are_none() {
        with_parser("partial f(_, 2)", |p| match p.expression() {
            Some(Expr::Closure(c)) => {
                assert_eq!(c.supplied.len(), 2);
                assert!(c.supplied[0].is_none());
                assert!(c.supplied[1].is_some());
            }
            other => panic!("not a closure: {other:?}"),
        });
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        with_parser("fn f() { break }", |p| {
            assert!(p.top_level_element().is_none() || !p.errors.clean());
        });
    }

    #[test]
    fn struct_literal_disallowed_in_if_head() {
        with_parser("if x { }", |p| {
            let stmt = p.statement().expect("no statement");
            match stmt {
                Stmt::If(ifs) => {
                    assert!(matches!(
                        ifs.segments[0].condition,
                        Some(Expr::Ident(_))
                    ));
                }
                other => panic!("not an if: {other:?}"),
            }
        });
    }

    #[test]
    fn struct_definition_with_fields_and_methods() {
        let src = "struct Point {\n x, y i64\n fn sum() i64 { return self.x + self.y }\n}";
        with_parser(src, |p| {
            let tle = p.top_level_element().expect("no tle");
            match tle {
                Tle::Struct(sds) => {
                    assert_eq!(sds.fields.len(), 2);
                    assert_eq!(sds.functions.len(), 1);
                    assert_eq!(sds.functions[0].id.struct_id.name, "Point");
                }
                other => panic!("not a struct: {other:?}"),
            }
        });
    }

    #[test]
    fn worker_type_syntax() {
        with_parser("fn f(w worker(i64) i64) { }", |p| {
            let tle = p.top_level_element().expect("no tle");
            match tle {
                Tle::Function(fd) => match &fd.parameters[0].ty {
                    Type::Worker { send, recv } => {
                        assert_eq!(**send, Type::Integer);
                        assert_eq!(**recv, Type::Integer);
                    }
                    other => panic!("not a worker type: {other:?}"),
                },
                other => panic!("not a function: {other:?}"),
            }
        });
    }
}
