use std::rc::Rc;

use crate::ast::{
    BinOp, BoolOp, CallArg, CmpOp, CompClause, CompKind, ExceptHandler, Expr, FStringPart, Param,
    ParamSpec, Stmt, Target, UnaryOp,
};
use crate::error::{ExecResult, ExecutionError};
use crate::lexer::{self, Kw, Tok, TokKind};

/// Parses a whole program: zero or more statements, newline-separated.
pub fn parse_program(source: &str) -> ExecResult<Vec<Stmt>> {
    let toks = lexer::tokenize(source)?;
    let mut parser = Parser { toks, pos: 0 };
    parser.program()
}

/// Parses a single expression, as used for `FINAL(...)` payloads.
pub fn parse_expression(source: &str) -> ExecResult<Expr> {
    let toks = lexer::tokenize(source)?;
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.testlist()?;
    parser.skip_newlines();
    if !matches!(parser.peek(), TokKind::Eof) {
        return Err(parser.err("unexpected trailing input after expression"));
    }
    Ok(expr)
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokKind {
        &self.toks[self.pos.min(self.toks.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &TokKind {
        &self.toks[(self.pos + offset).min(self.toks.len() - 1)].kind
    }

    fn here(&self) -> (usize, usize) {
        let tok = &self.toks[self.pos.min(self.toks.len() - 1)];
        (tok.line, tok.col)
    }

    fn bump(&mut self) -> TokKind {
        let kind = self.toks[self.pos.min(self.toks.len() - 1)].kind.clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn err(&self, message: impl AsRef<str>) -> ExecutionError {
        let (line, col) = self.here();
        ExecutionError::syntax(line, col, message)
    }

    fn eat(&mut self, kind: &TokKind) -> bool {
        if self.peek() == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokKind, what: &str) -> ExecResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.err(format!("expected {what}")))
        }
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if matches!(self.peek(), TokKind::Kw(k) if *k == kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokKind::Newline) {
            self.bump();
        }
    }

    fn program(&mut self) -> ExecResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.peek(), TokKind::Eof) {
                return Ok(stmts);
            }
            stmts.extend(self.statement()?);
        }
    }

    /// One statement; simple-statement lines may carry several via `;`.
    fn statement(&mut self) -> ExecResult<Vec<Stmt>> {
        match self.peek() {
            TokKind::Kw(Kw::If) => Ok(vec![self.if_stmt()?]),
            TokKind::Kw(Kw::While) => Ok(vec![self.while_stmt()?]),
            TokKind::Kw(Kw::For) => Ok(vec![self.for_stmt()?]),
            TokKind::Kw(Kw::Def) => Ok(vec![self.def_stmt()?]),
            TokKind::Kw(Kw::Try) => Ok(vec![self.try_stmt()?]),
            _ => self.simple_stmt_line(),
        }
    }

    fn simple_stmt_line(&mut self) -> ExecResult<Vec<Stmt>> {
        let mut stmts = vec![self.simple_stmt()?];
        while self.eat(&TokKind::Semicolon) {
            if matches!(self.peek(), TokKind::Newline | TokKind::Eof) {
                break;
            }
            stmts.push(self.simple_stmt()?);
        }
        if !matches!(self.peek(), TokKind::Eof | TokKind::Dedent) {
            self.expect(&TokKind::Newline, "end of line")?;
        }
        Ok(stmts)
    }

    fn simple_stmt(&mut self) -> ExecResult<Stmt> {
        match self.peek() {
            TokKind::Kw(Kw::Pass) => {
                self.bump();
                Ok(Stmt::Pass)
            }
            TokKind::Kw(Kw::Break) => {
                self.bump();
                Ok(Stmt::Break)
            }
            TokKind::Kw(Kw::Continue) => {
                self.bump();
                Ok(Stmt::Continue)
            }
            TokKind::Kw(Kw::Return) => {
                self.bump();
                if matches!(
                    self.peek(),
                    TokKind::Newline | TokKind::Semicolon | TokKind::Eof
                ) {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.testlist()?)))
                }
            }
            TokKind::Kw(Kw::Raise) => {
                self.bump();
                if matches!(
                    self.peek(),
                    TokKind::Newline | TokKind::Semicolon | TokKind::Eof
                ) {
                    Ok(Stmt::Raise(None))
                } else {
                    Ok(Stmt::Raise(Some(self.test()?)))
                }
            }
            TokKind::Kw(Kw::Import) | TokKind::Kw(Kw::From) => {
                Err(ExecutionError::import_forbidden())
            }
            TokKind::Kw(kw @ (Kw::Class | Kw::Global | Kw::Nonlocal | Kw::Del | Kw::With
            | Kw::Async | Kw::Await | Kw::Yield | Kw::Assert)) => {
                let word = format!("{kw:?}").to_lowercase();
                Err(self.err(format!("'{word}' is not supported in the sandbox")))
            }
            _ => self.expr_stmt(),
        }
    }

    fn expr_stmt(&mut self) -> ExecResult<Stmt> {
        let first = self.testlist()?;
        if let TokKind::AugAssign(op) = self.peek() {
            let op = *op;
            self.bump();
            let value = self.testlist()?;
            let target = self.expr_to_target(first)?;
            if matches!(target, Target::Unpack(_)) {
                return Err(self.err("augmented assignment target must be a name or subscript"));
            }
            return Ok(Stmt::AugAssign { target, op, value });
        }
        if !matches!(self.peek(), TokKind::Assign) {
            return Ok(Stmt::Expr(first));
        }
        let mut parts = vec![first];
        while self.eat(&TokKind::Assign) {
            parts.push(self.testlist()?);
        }
        let value = parts.pop().expect("assignment has a value");
        let targets: ExecResult<Vec<Target>> = parts
            .into_iter()
            .map(|expr| self.expr_to_target(expr))
            .collect();
        Ok(Stmt::Assign {
            targets: targets?,
            value,
        })
    }

    fn expr_to_target(&self, expr: Expr) -> ExecResult<Target> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Index { obj, index } => Ok(Target::Index {
                obj: *obj,
                index: *index,
            }),
            Expr::Tuple(items) | Expr::List(items) => {
                let targets: ExecResult<Vec<Target>> = items
                    .into_iter()
                    .map(|item| self.expr_to_target(item))
                    .collect();
                Ok(Target::Unpack(targets?))
            }
            Expr::Slice { .. } => Err(self.err("cannot assign to a slice")),
            Expr::Attr { .. } => Err(self.err("cannot assign to an attribute")),
            _ => Err(self.err("cannot assign to this expression")),
        }
    }

    fn block(&mut self) -> ExecResult<Vec<Stmt>> {
        if self.eat(&TokKind::Newline) {
            self.expect(&TokKind::Indent, "an indented block")?;
            let mut stmts = Vec::new();
            loop {
                self.skip_newlines();
                if self.eat(&TokKind::Dedent) {
                    break;
                }
                if matches!(self.peek(), TokKind::Eof) {
                    break;
                }
                stmts.extend(self.statement()?);
            }
            if stmts.is_empty() {
                return Err(self.err("expected an indented block"));
            }
            Ok(stmts)
        } else {
            // inline suite: `if x: y = 1`
            self.simple_stmt_line()
        }
    }

    fn if_stmt(&mut self) -> ExecResult<Stmt> {
        self.bump();
        let mut branches = Vec::new();
        let test = self.test()?;
        self.expect(&TokKind::Colon, "':'")?;
        branches.push((test, self.block()?));
        let mut orelse = Vec::new();
        loop {
            if self.eat_kw(Kw::Elif) {
                let test = self.test()?;
                self.expect(&TokKind::Colon, "':'")?;
                branches.push((test, self.block()?));
            } else if self.eat_kw(Kw::Else) {
                self.expect(&TokKind::Colon, "':'")?;
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    fn while_stmt(&mut self) -> ExecResult<Stmt> {
        self.bump();
        let test = self.test()?;
        self.expect(&TokKind::Colon, "':'")?;
        Ok(Stmt::While {
            test,
            body: self.block()?,
        })
    }

    fn for_stmt(&mut self) -> ExecResult<Stmt> {
        self.bump();
        let target = self.target_list()?;
        if !self.eat_kw(Kw::In) {
            return Err(self.err("expected 'in'"));
        }
        let iter = self.testlist()?;
        self.expect(&TokKind::Colon, "':'")?;
        Ok(Stmt::For {
            target,
            iter,
            body: self.block()?,
        })
    }

    fn def_stmt(&mut self) -> ExecResult<Stmt> {
        self.bump();
        let name = match self.bump() {
            TokKind::Name(name) => name,
            _ => return Err(self.err("expected function name")),
        };
        self.expect(&TokKind::LParen, "'('")?;
        let params = self.param_spec(&TokKind::RParen)?;
        self.expect(&TokKind::RParen, "')'")?;
        self.expect(&TokKind::Colon, "':'")?;
        let body = self.block()?;
        Ok(Stmt::FuncDef {
            name,
            params: Rc::new(params),
            body: body.into(),
        })
    }

    fn param_spec(&mut self, terminator: &TokKind) -> ExecResult<ParamSpec> {
        let mut spec = ParamSpec::default();
        let mut saw_default = false;
        loop {
            if self.peek() == terminator {
                break;
            }
            if self.eat(&TokKind::Star) {
                let name = match self.bump() {
                    TokKind::Name(name) => name,
                    _ => return Err(self.err("expected a name after '*'")),
                };
                if spec.vararg.is_some() {
                    return Err(self.err("duplicate *args parameter"));
                }
                spec.vararg = Some(name);
            } else if self.eat(&TokKind::DoubleStar) {
                let name = match self.bump() {
                    TokKind::Name(name) => name,
                    _ => return Err(self.err("expected a name after '**'")),
                };
                spec.kwarg = Some(name);
            } else {
                let name = match self.bump() {
                    TokKind::Name(name) => name,
                    _ => return Err(self.err("expected a parameter name")),
                };
                let default = if self.eat(&TokKind::Assign) {
                    saw_default = true;
                    Some(self.test()?)
                } else {
                    if saw_default && spec.vararg.is_none() {
                        return Err(self.err(
                            "parameter without a default follows one with a default",
                        ));
                    }
                    None
                };
                spec.params.push(Param { name, default });
            }
            if !self.eat(&TokKind::Comma) {
                break;
            }
        }
        Ok(spec)
    }

    fn try_stmt(&mut self) -> ExecResult<Stmt> {
        self.bump();
        self.expect(&TokKind::Colon, "':'")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while matches!(self.peek(), TokKind::Kw(Kw::Except)) {
            self.bump();
            let mut classes = Vec::new();
            let mut name = None;
            if !matches!(self.peek(), TokKind::Colon) {
                if self.eat(&TokKind::LParen) {
                    loop {
                        match self.bump() {
                            TokKind::Name(class) => classes.push(class),
                            _ => return Err(self.err("expected an exception class name")),
                        }
                        if !self.eat(&TokKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokKind::RParen, "')'")?;
                } else {
                    match self.bump() {
                        TokKind::Name(class) => classes.push(class),
                        _ => return Err(self.err("expected an exception class name")),
                    }
                }
                if self.eat_kw(Kw::As) {
                    match self.bump() {
                        TokKind::Name(bound) => name = Some(bound),
                        _ => return Err(self.err("expected a name after 'as'")),
                    }
                }
            }
            self.expect(&TokKind::Colon, "':'")?;
            handlers.push(ExceptHandler {
                classes,
                name,
                body: self.block()?,
            });
        }
        let mut finally = Vec::new();
        if self.eat_kw(Kw::Finally) {
            self.expect(&TokKind::Colon, "':'")?;
            finally = self.block()?;
        }
        if handlers.is_empty() && finally.is_empty() {
            return Err(self.err("expected 'except' or 'finally'"));
        }
        Ok(Stmt::Try {
            body,
            handlers,
            finally,
        })
    }

    fn target_list(&mut self) -> ExecResult<Target> {
        let expr = self.testlist()?;
        self.expr_to_target(expr)
    }

    /// `a, b, c` becomes a tuple; a single expression stays itself.
    fn testlist(&mut self) -> ExecResult<Expr> {
        let first = self.test()?;
        if !matches!(self.peek(), TokKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokKind::Comma) {
            if self.starts_expression() {
                items.push(self.test()?);
            } else {
                break;
            }
        }
        Ok(Expr::Tuple(items))
    }

    fn starts_expression(&self) -> bool {
        matches!(
            self.peek(),
            TokKind::Int(_)
                | TokKind::Float(_)
                | TokKind::Str(_)
                | TokKind::FStr { .. }
                | TokKind::Bytes(_)
                | TokKind::Name(_)
                | TokKind::LParen
                | TokKind::LBracket
                | TokKind::LBrace
                | TokKind::Minus
                | TokKind::Plus
                | TokKind::Tilde
                | TokKind::Kw(
                    Kw::True | Kw::False | Kw::None | Kw::Not | Kw::Lambda
                )
        )
    }

    fn test(&mut self) -> ExecResult<Expr> {
        if matches!(self.peek(), TokKind::Kw(Kw::Lambda)) {
            return self.lambda();
        }
        let body = self.or_test()?;
        if self.eat_kw(Kw::If) {
            let test = self.or_test()?;
            if !self.eat_kw(Kw::Else) {
                return Err(self.err("expected 'else' in conditional expression"));
            }
            let orelse = self.test()?;
            return Ok(Expr::Cond {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn lambda(&mut self) -> ExecResult<Expr> {
        self.bump();
        let params = self.param_spec(&TokKind::Colon)?;
        self.expect(&TokKind::Colon, "':'")?;
        let body = self.test()?;
        Ok(Expr::Lambda {
            params: Rc::new(params),
            body: Rc::new(body),
        })
    }

    fn or_test(&mut self) -> ExecResult<Expr> {
        let first = self.and_test()?;
        if !matches!(self.peek(), TokKind::Kw(Kw::Or)) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw(Kw::Or) {
            values.push(self.and_test()?);
        }
        Ok(Expr::BoolChain {
            op: BoolOp::Or,
            values,
        })
    }

    fn and_test(&mut self) -> ExecResult<Expr> {
        let first = self.not_test()?;
        if !matches!(self.peek(), TokKind::Kw(Kw::And)) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw(Kw::And) {
            values.push(self.not_test()?);
        }
        Ok(Expr::BoolChain {
            op: BoolOp::And,
            values,
        })
    }

    fn not_test(&mut self) -> ExecResult<Expr> {
        if self.eat_kw(Kw::Not) {
            return Ok(Expr::Not(Box::new(self.not_test()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ExecResult<Expr> {
        let left = self.bit_or()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                TokKind::Lt => CmpOp::Lt,
                TokKind::Le => CmpOp::Le,
                TokKind::Gt => CmpOp::Gt,
                TokKind::Ge => CmpOp::Ge,
                TokKind::EqEq => CmpOp::Eq,
                TokKind::Ne => CmpOp::Ne,
                TokKind::Kw(Kw::In) => CmpOp::In,
                TokKind::Kw(Kw::Not) if matches!(self.peek_at(1), TokKind::Kw(Kw::In)) => {
                    self.bump();
                    CmpOp::NotIn
                }
                TokKind::Kw(Kw::Is) => {
                    if matches!(self.peek_at(1), TokKind::Kw(Kw::Not)) {
                        self.bump();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.bump();
            rest.push((op, self.bit_or()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    fn bit_or(&mut self) -> ExecResult<Expr> {
        let mut left = self.bit_xor()?;
        while self.eat(&TokKind::Pipe) {
            left = binary(BinOp::BitOr, left, self.bit_xor()?);
        }
        Ok(left)
    }

    fn bit_xor(&mut self) -> ExecResult<Expr> {
        let mut left = self.bit_and()?;
        while self.eat(&TokKind::Caret) {
            left = binary(BinOp::BitXor, left, self.bit_and()?);
        }
        Ok(left)
    }

    fn bit_and(&mut self) -> ExecResult<Expr> {
        let mut left = self.shift()?;
        while self.eat(&TokKind::Amp) {
            left = binary(BinOp::BitAnd, left, self.shift()?);
        }
        Ok(left)
    }

    fn shift(&mut self) -> ExecResult<Expr> {
        let mut left = self.arith()?;
        loop {
            if self.eat(&TokKind::Shl) {
                left = binary(BinOp::Shl, left, self.arith()?);
            } else if self.eat(&TokKind::Shr) {
                left = binary(BinOp::Shr, left, self.arith()?);
            } else {
                return Ok(left);
            }
        }
    }

    fn arith(&mut self) -> ExecResult<Expr> {
        let mut left = self.term()?;
        loop {
            if self.eat(&TokKind::Plus) {
                left = binary(BinOp::Add, left, self.term()?);
            } else if self.eat(&TokKind::Minus) {
                left = binary(BinOp::Sub, left, self.term()?);
            } else {
                return Ok(left);
            }
        }
    }

    fn term(&mut self) -> ExecResult<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                TokKind::Star => BinOp::Mul,
                TokKind::Slash => BinOp::Div,
                TokKind::DoubleSlash => BinOp::FloorDiv,
                TokKind::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            self.bump();
            left = binary(op, left, self.factor()?);
        }
    }

    fn factor(&mut self) -> ExecResult<Expr> {
        let op = match self.peek() {
            TokKind::Minus => Some(UnaryOp::Neg),
            TokKind::Plus => Some(UnaryOp::Pos),
            TokKind::Tilde => Some(UnaryOp::Invert),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            return Ok(Expr::Unary {
                op,
                operand: Box::new(self.factor()?),
            });
        }
        self.power()
    }

    fn power(&mut self) -> ExecResult<Expr> {
        let base = self.postfix()?;
        if self.eat(&TokKind::DoubleStar) {
            // right-associative, binds tighter than unary on the left
            let exp = self.factor()?;
            return Ok(binary(BinOp::Pow, base, exp));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> ExecResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                TokKind::LParen => {
                    self.bump();
                    let args = self.call_args()?;
                    self.expect(&TokKind::RParen, "')'")?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                    };
                }
                TokKind::LBracket => {
                    self.bump();
                    expr = self.subscript(expr)?;
                    self.expect(&TokKind::RBracket, "']'")?;
                }
                TokKind::Dot => {
                    self.bump();
                    let name = match self.bump() {
                        TokKind::Name(name) => name,
                        _ => return Err(self.err("expected an attribute name")),
                    };
                    expr = Expr::Attr {
                        obj: Box::new(expr),
                        name,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> ExecResult<Vec<CallArg>> {
        let mut args = Vec::new();
        loop {
            if matches!(self.peek(), TokKind::RParen) {
                break;
            }
            if self.eat(&TokKind::Star) {
                args.push(CallArg::Star(self.test()?));
            } else if self.eat(&TokKind::DoubleStar) {
                args.push(CallArg::DoubleStar(self.test()?));
            } else if matches!(self.peek(), TokKind::Name(_))
                && matches!(self.peek_at(1), TokKind::Assign)
            {
                let TokKind::Name(name) = self.bump() else {
                    unreachable!()
                };
                self.bump();
                args.push(CallArg::Keyword(name, self.test()?));
            } else {
                let value = self.test()?;
                if matches!(self.peek(), TokKind::Kw(Kw::For)) {
                    // a bare generator expression argument: f(x for x in y)
                    let clauses = self.comp_clauses()?;
                    args.push(CallArg::Positional(Expr::Comp {
                        kind: CompKind::Generator,
                        key: Box::new(value),
                        value: None,
                        clauses,
                    }));
                    break;
                }
                args.push(CallArg::Positional(value));
            }
            if !self.eat(&TokKind::Comma) {
                break;
            }
        }
        Ok(args)
    }

    fn subscript(&mut self, obj: Expr) -> ExecResult<Expr> {
        let lower = if matches!(self.peek(), TokKind::Colon) {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        if !self.eat(&TokKind::Colon) {
            let index = lower.ok_or_else(|| self.err("expected a subscript"))?;
            return Ok(Expr::Index {
                obj: Box::new(obj),
                index,
            });
        }
        let upper = if matches!(self.peek(), TokKind::Colon | TokKind::RBracket) {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat(&TokKind::Colon) {
            if matches!(self.peek(), TokKind::RBracket) {
                None
            } else {
                Some(Box::new(self.test()?))
            }
        } else {
            None
        };
        Ok(Expr::Slice {
            obj: Box::new(obj),
            lower,
            upper,
            step,
        })
    }

    fn comp_clauses(&mut self) -> ExecResult<Vec<CompClause>> {
        let mut clauses = Vec::new();
        while self.eat_kw(Kw::For) {
            let target_expr = {
                let first = self.or_test()?;
                if matches!(self.peek(), TokKind::Comma) {
                    let mut items = vec![first];
                    while self.eat(&TokKind::Comma) {
                        if matches!(self.peek(), TokKind::Kw(Kw::In)) {
                            break;
                        }
                        items.push(self.or_test()?);
                    }
                    Expr::Tuple(items)
                } else {
                    first
                }
            };
            let target = self.expr_to_target(target_expr)?;
            if !self.eat_kw(Kw::In) {
                return Err(self.err("expected 'in'"));
            }
            let iter = self.or_test()?;
            let mut ifs = Vec::new();
            while matches!(self.peek(), TokKind::Kw(Kw::If)) {
                self.bump();
                ifs.push(self.or_test()?);
            }
            clauses.push(CompClause { target, iter, ifs });
        }
        Ok(clauses)
    }

    fn atom(&mut self) -> ExecResult<Expr> {
        match self.peek().clone() {
            TokKind::Int(v) => {
                self.bump();
                Ok(Expr::Int(v))
            }
            TokKind::Float(v) => {
                self.bump();
                Ok(Expr::Float(v))
            }
            TokKind::Str(_) => {
                // adjacent string literals concatenate
                let mut text = String::new();
                while let TokKind::Str(s) = self.peek() {
                    text.push_str(s);
                    self.bump();
                }
                Ok(Expr::Str(text.into()))
            }
            TokKind::Bytes(b) => {
                self.bump();
                Ok(Expr::Bytes(b.into()))
            }
            TokKind::FStr { text, raw } => {
                let (line, col) = self.here();
                self.bump();
                let parts = parse_fstring(&text, raw, line, col)?;
                Ok(Expr::FString(parts))
            }
            TokKind::Name(name) => {
                self.bump();
                Ok(Expr::Name(name))
            }
            TokKind::Kw(Kw::True) => {
                self.bump();
                Ok(Expr::True)
            }
            TokKind::Kw(Kw::False) => {
                self.bump();
                Ok(Expr::False)
            }
            TokKind::Kw(Kw::None) => {
                self.bump();
                Ok(Expr::None)
            }
            TokKind::Kw(Kw::Lambda) => self.lambda(),
            TokKind::LParen => {
                self.bump();
                if self.eat(&TokKind::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.test()?;
                if matches!(self.peek(), TokKind::Kw(Kw::For)) {
                    let clauses = self.comp_clauses()?;
                    self.expect(&TokKind::RParen, "')'")?;
                    return Ok(Expr::Comp {
                        kind: CompKind::Generator,
                        key: Box::new(first),
                        value: None,
                        clauses,
                    });
                }
                if matches!(self.peek(), TokKind::Comma) {
                    let mut items = vec![first];
                    while self.eat(&TokKind::Comma) {
                        if matches!(self.peek(), TokKind::RParen) {
                            break;
                        }
                        items.push(self.test()?);
                    }
                    self.expect(&TokKind::RParen, "')'")?;
                    return Ok(Expr::Tuple(items));
                }
                self.expect(&TokKind::RParen, "')'")?;
                Ok(first)
            }
            TokKind::LBracket => {
                self.bump();
                if self.eat(&TokKind::RBracket) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.test()?;
                if matches!(self.peek(), TokKind::Kw(Kw::For)) {
                    let clauses = self.comp_clauses()?;
                    self.expect(&TokKind::RBracket, "']'")?;
                    return Ok(Expr::Comp {
                        kind: CompKind::List,
                        key: Box::new(first),
                        value: None,
                        clauses,
                    });
                }
                let mut items = vec![first];
                while self.eat(&TokKind::Comma) {
                    if matches!(self.peek(), TokKind::RBracket) {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect(&TokKind::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            TokKind::LBrace => {
                self.bump();
                if self.eat(&TokKind::RBrace) {
                    return Ok(Expr::Dict(Vec::new()));
                }
                let first = self.test()?;
                if self.eat(&TokKind::Colon) {
                    let first_value = self.test()?;
                    if matches!(self.peek(), TokKind::Kw(Kw::For)) {
                        let clauses = self.comp_clauses()?;
                        self.expect(&TokKind::RBrace, "'}'")?;
                        return Ok(Expr::Comp {
                            kind: CompKind::Dict,
                            key: Box::new(first),
                            value: Some(Box::new(first_value)),
                            clauses,
                        });
                    }
                    let mut entries = vec![(first, first_value)];
                    while self.eat(&TokKind::Comma) {
                        if matches!(self.peek(), TokKind::RBrace) {
                            break;
                        }
                        let key = self.test()?;
                        self.expect(&TokKind::Colon, "':'")?;
                        entries.push((key, self.test()?));
                    }
                    self.expect(&TokKind::RBrace, "'}'")?;
                    return Ok(Expr::Dict(entries));
                }
                if matches!(self.peek(), TokKind::Kw(Kw::For)) {
                    let clauses = self.comp_clauses()?;
                    self.expect(&TokKind::RBrace, "'}'")?;
                    return Ok(Expr::Comp {
                        kind: CompKind::Set,
                        key: Box::new(first),
                        value: None,
                        clauses,
                    });
                }
                let mut items = vec![first];
                while self.eat(&TokKind::Comma) {
                    if matches!(self.peek(), TokKind::RBrace) {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect(&TokKind::RBrace, "'}'")?;
                Ok(Expr::Set(items))
            }
            TokKind::Kw(Kw::Import) | TokKind::Kw(Kw::From) => {
                Err(ExecutionError::import_forbidden())
            }
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Splits the raw inner text of an f-string into literal and `{expr}` parts.
/// The expression source is re-tokenized through the normal pipeline.
fn parse_fstring(
    text: &str,
    raw: bool,
    line: usize,
    col: usize,
) -> ExecResult<Vec<FStringPart>> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut i = 0;
    let flush_lit = |lit: &mut String, parts: &mut Vec<FStringPart>| -> ExecResult<()> {
        if lit.is_empty() {
            return Ok(());
        }
        let decoded = if raw {
            lit.clone()
        } else {
            lexer::decode_str_escapes(lit).map_err(|m| ExecutionError::syntax(line, col, m))?
        };
        parts.push(FStringPart::Lit(decoded));
        lit.clear();
        Ok(())
    };
    while i < chars.len() {
        let c = chars[i];
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            lit.push('{');
            i += 2;
            continue;
        }
        if c == '}' && chars.get(i + 1) == Some(&'}') {
            lit.push('}');
            i += 2;
            continue;
        }
        if c == '}' {
            return Err(ExecutionError::syntax(
                line,
                col,
                "single '}' is not allowed in an f-string",
            ));
        }
        if c != '{' {
            lit.push(c);
            i += 1;
            continue;
        }
        flush_lit(&mut lit, &mut parts)?;
        i += 1;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut field = String::new();
        let mut closed = false;
        while i < chars.len() {
            let c = chars[i];
            if let Some(q) = quote {
                field.push(c);
                if c == q {
                    quote = None;
                }
                i += 1;
                continue;
            }
            match c {
                '\'' | '"' => {
                    quote = Some(c);
                    field.push(c);
                }
                '(' | '[' | '{' => {
                    depth += 1;
                    field.push(c);
                }
                ')' | ']' => {
                    depth = depth.saturating_sub(1);
                    field.push(c);
                }
                '}' if depth == 0 => {
                    closed = true;
                    i += 1;
                    break;
                }
                '}' => {
                    depth -= 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            i += 1;
        }
        if !closed {
            return Err(ExecutionError::syntax(
                line,
                col,
                "unterminated '{' in f-string",
            ));
        }
        // split off !conversion and :format at the top level of the field
        let field_chars: Vec<char> = field.chars().collect();
        let mut split_depth = 0usize;
        let mut split_quote: Option<char> = None;
        let mut conv: Option<char> = None;
        let mut fmt: Option<String> = None;
        let mut expr_end = field_chars.len();
        let mut j = 0;
        while j < field_chars.len() {
            let c = field_chars[j];
            if let Some(q) = split_quote {
                if c == q {
                    split_quote = None;
                }
                j += 1;
                continue;
            }
            match c {
                '\'' | '"' => split_quote = Some(c),
                '(' | '[' | '{' => split_depth += 1,
                ')' | ']' | '}' => split_depth = split_depth.saturating_sub(1),
                '!' if split_depth == 0
                    && matches!(field_chars.get(j + 1), Some('r') | Some('s'))
                    && !matches!(field_chars.get(j + 2), Some(c2) if *c2 != ':') =>
                {
                    conv = field_chars.get(j + 1).copied();
                    expr_end = expr_end.min(j);
                    if field_chars.get(j + 2) == Some(&':') {
                        fmt = Some(field_chars[j + 3..].iter().collect());
                    }
                    break;
                }
                ':' if split_depth == 0 => {
                    fmt = Some(field_chars[j + 1..].iter().collect());
                    expr_end = j;
                    break;
                }
                _ => {}
            }
            j += 1;
        }
        let expr_src: String = field_chars[..expr_end].iter().collect();
        if expr_src.trim().is_empty() {
            return Err(ExecutionError::syntax(
                line,
                col,
                "empty expression in f-string",
            ));
        }
        let expr = parse_expression(expr_src.trim())?;
        parts.push(FStringPart::Expr {
            expr,
            conversion: conv,
            format: fmt,
        });
    }
    flush_lit(&mut lit, &mut parts)?;
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assignment_and_expression() {
        let stmts = parse_program("x = 1\nx + 2\n").unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(&stmts[0], Stmt::Assign { .. }));
        assert!(matches!(&stmts[1], Stmt::Expr(_)));
    }

    #[test]
    fn import_is_rejected_with_contract_message() {
        for src in ["import re\n", "from json import loads\n"] {
            let err = parse_program(src).unwrap_err();
            assert!(err.to_string().contains("__import__ not found"), "{src}");
        }
    }

    #[test]
    fn class_and_del_are_rejected() {
        assert!(parse_program("class A:\n    pass\n").is_err());
        assert!(parse_program("del x\n").is_err());
        assert!(parse_program("with open('f') as f:\n    pass\n").is_err());
    }

    #[test]
    fn syntax_error_carries_position() {
        let err = parse_program("x = = 1\n").unwrap_err();
        assert!(err.message.contains("line 1"));
    }

    #[test]
    fn chained_comparison() {
        let stmts = parse_program("1 < x <= 10\n").unwrap();
        let Stmt::Expr(Expr::Compare { rest, .. }) = &stmts[0] else {
            panic!("expected comparison");
        };
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn comprehension_forms() {
        assert!(parse_program("[x * 2 for x in xs if x]\n").is_ok());
        assert!(parse_program("{k: v for k, v in items}\n").is_ok());
        assert!(parse_program("{x for x in xs}\n").is_ok());
        assert!(parse_program("sum(x for x in xs)\n").is_ok());
    }

    #[test]
    fn slices_parse() {
        assert!(parse_program("s[1:10:2]\n").is_ok());
        assert!(parse_program("s[::-1]\n").is_ok());
        assert!(parse_program("s[:5]\n").is_ok());
    }

    #[test]
    fn fstring_parts_split() {
        let stmts = parse_program("f\"a{x}b{y:>10}c\"\n").unwrap();
        let Stmt::Expr(Expr::FString(parts)) = &stmts[0] else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 5);
        assert!(matches!(
            &parts[3],
            FStringPart::Expr { format: Some(f), .. } if f == ">10"
        ));
    }

    #[test]
    fn def_with_defaults_and_varargs() {
        let src = "def f(a, b=2, *args, **kwargs):\n    return a\n";
        let stmts = parse_program(src).unwrap();
        let Stmt::FuncDef { params, .. } = &stmts[0] else {
            panic!("expected def");
        };
        assert_eq!(params.params.len(), 2);
        assert_eq!(params.vararg.as_deref(), Some("args"));
        assert_eq!(params.kwarg.as_deref(), Some("kwargs"));
    }

    #[test]
    fn unpacking_assignment() {
        let stmts = parse_program("a, b = 1, 2\n").unwrap();
        let Stmt::Assign { targets, .. } = &stmts[0] else {
            panic!("expected assign");
        };
        assert!(matches!(&targets[0], Target::Unpack(items) if items.len() == 2));
    }

    #[test]
    fn parse_expression_rejects_trailing_garbage() {
        assert!(parse_expression("1 + 2").is_ok());
        assert!(parse_expression("1 + 2 junk +").is_err());
    }
}
