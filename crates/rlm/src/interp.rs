use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::ast::{
    BinOp, BoolOp, CallArg, CmpOp, CompClause, CompKind, ExceptHandler, Expr, FStringPart, Stmt,
    Target, UnaryOp,
};
use crate::caps;
use crate::error::{ErrorKind, ExecResult, ExecutionError};
use crate::output::OutputBuffer;
use crate::value::{
    DictValue, ExceptionValue, FuncBody, FuncValue, IterValue, Key, RangeValue, ScopeRef,
    SetValue, Value, compare_values, new_scope, repr, to_display, truthy, type_name, values_equal,
};

/// Synchronous hook behind the `recursive_llm` builtin. Always returns a
/// string; child failures come back as error text, never as exceptions.
pub type RecursionHook = dyn Fn(&str, &str) -> String;

/// Per-`execute` resource caps.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub timeout: Duration,
    pub max_steps: u64,
    pub max_frames: usize,
    pub max_alloc: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_steps: 1_000_000,
            max_frames: 64,
            max_alloc: 64 * 1024 * 1024,
        }
    }
}

/// Non-error control flow out of a statement.
pub enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interp<'a> {
    pub chain: Vec<ScopeRef>,
    pub output: &'a mut OutputBuffer,
    pub recursion: Option<Rc<RecursionHook>>,
    pub zlib_max_output: usize,
    limits: Limits,
    deadline: Instant,
    steps: u64,
    frames: usize,
    allocated: usize,
    active_exceptions: Vec<ExecutionError>,
}

impl<'a> Interp<'a> {
    pub fn new(
        globals: ScopeRef,
        output: &'a mut OutputBuffer,
        limits: Limits,
        recursion: Option<Rc<RecursionHook>>,
        zlib_max_output: usize,
    ) -> Self {
        Self {
            chain: vec![globals],
            output,
            recursion,
            zlib_max_output,
            limits,
            deadline: Instant::now() + limits.timeout,
            steps: 0,
            frames: 0,
            allocated: 0,
            active_exceptions: Vec::new(),
        }
    }

    /// Runs a program; a trailing expression statement with a non-None value
    /// echoes its repr, REPL-style.
    pub fn run(&mut self, stmts: &[Stmt]) -> ExecResult<()> {
        for (idx, stmt) in stmts.iter().enumerate() {
            if idx + 1 == stmts.len()
                && let Stmt::Expr(expr) = stmt
            {
                let value = self.eval(expr)?;
                if !matches!(value, Value::None) {
                    let text = repr(&value);
                    self.charge(text.len())?;
                    self.output.push_str(&text);
                    self.output.push_str("\n");
                }
                return Ok(());
            }
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                Flow::Break | Flow::Continue => {
                    return Err(ExecutionError::new(
                        ErrorKind::Syntax,
                        "'break' or 'continue' outside of a loop",
                    ));
                }
                Flow::Return(_) => {
                    return Err(ExecutionError::new(
                        ErrorKind::Syntax,
                        "'return' outside of a function",
                    ));
                }
            }
        }
        Ok(())
    }

    /// One primitive step: counts toward the step cap and periodically
    /// re-checks the wall clock.
    pub fn tick(&mut self) -> ExecResult<()> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(ExecutionError::new(
                ErrorKind::StepLimit,
                format!("step limit of {} exceeded", self.limits.max_steps),
            ));
        }
        if self.steps % 256 == 0 && Instant::now() > self.deadline {
            return Err(ExecutionError::new(
                ErrorKind::Timeout,
                format!(
                    "execution exceeded the {:.1}s wall-clock budget",
                    self.limits.timeout.as_secs_f64()
                ),
            ));
        }
        Ok(())
    }

    /// Charges freshly-allocated bytes against the memory cap. Call before
    /// building anything whose size is known up front.
    pub fn charge(&mut self, bytes: usize) -> ExecResult<()> {
        self.allocated = self.allocated.saturating_add(bytes);
        if self.allocated > self.limits.max_alloc {
            return Err(ExecutionError::new(
                ErrorKind::MemoryLimit,
                format!("allocation limit of {} bytes exceeded", self.limits.max_alloc),
            ));
        }
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> ExecResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> ExecResult<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
                Ok(Flow::Normal)
            }
            Stmt::AugAssign { target, op, value } => {
                self.exec_aug_assign(target, *op, value)?;
                Ok(Flow::Normal)
            }
            Stmt::If { branches, orelse } => {
                for (test, body) in branches {
                    if truthy(&self.eval(test)?) {
                        return self.exec_block(body);
                    }
                }
                self.exec_block(orelse)
            }
            Stmt::While { test, body } => {
                while truthy(&self.eval(test)?) {
                    self.tick()?;
                    match self.exec_block(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                let mut cursor = self.cursor(&iterable)?;
                while let Some(item) = cursor.next() {
                    self.tick()?;
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::FuncDef { name, params, body } => {
                let func = self.make_function(name.clone(), params.clone(), FuncBody::Block(body.clone()))?;
                self.bind_name(name, func);
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Pass => Ok(Flow::Normal),
            Stmt::Try {
                body,
                handlers,
                finally,
            } => self.exec_try(body, handlers, finally),
            Stmt::Raise(expr) => Err(self.make_raise(expr)?),
        }
    }

    fn make_raise(&mut self, expr: &Option<Expr>) -> ExecResult<ExecutionError> {
        match expr {
            None => self.active_exceptions.last().cloned().ok_or_else(|| {
                ExecutionError::new(ErrorKind::Other, "no active exception to re-raise")
            }),
            Some(expr) => match self.eval(expr)? {
                Value::Exception(exc) => Ok(ExecutionError::new(exc.kind, exc.message.clone())),
                Value::Builtin(builtin) => match builtin.exception_kind() {
                    Some(kind) => Ok(ExecutionError::new(kind, "")),
                    None => Err(ExecutionError::type_err(
                        "exceptions must be raised from the error classes",
                    )),
                },
                other => Err(ExecutionError::type_err(format!(
                    "exceptions must be error values, not '{}'",
                    type_name(&other)
                ))),
            },
        }
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        finally: &[Stmt],
    ) -> ExecResult<Flow> {
        let outcome = match self.exec_block(body) {
            Err(err) if err.kind.catchable() && !handlers.is_empty() => {
                self.dispatch_handler(handlers, err)
            }
            other => other,
        };
        if !finally.is_empty() {
            match self.exec_block(finally)? {
                Flow::Normal => {}
                // a flow out of finally wins over the pending outcome
                flow => return Ok(flow),
            }
        }
        outcome
    }

    fn dispatch_handler(
        &mut self,
        handlers: &[ExceptHandler],
        err: ExecutionError,
    ) -> ExecResult<Flow> {
        for handler in handlers {
            let matched = handler.classes.is_empty()
                || handler.classes.iter().any(|class| {
                    class == "Exception"
                        || ExecutionError::kind_for_class(class) == Some(err.kind)
                });
            if !matched {
                continue;
            }
            if let Some(name) = &handler.name {
                self.bind_name(
                    name,
                    Value::Exception(Rc::new(ExceptionValue {
                        kind: err.kind,
                        message: err.message.clone(),
                    })),
                );
            }
            self.active_exceptions.push(err);
            let result = self.exec_block(&handler.body);
            self.active_exceptions.pop();
            return result;
        }
        Err(err)
    }

    fn exec_aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> ExecResult<()> {
        let rhs = self.eval(value)?;
        let current = match target {
            Target::Name(name) => self.lookup(name)?,
            Target::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                let current = self.get_index(&obj, &index)?;
                let result = self.apply_inplace(current, op, rhs)?;
                return self.set_index(&obj, &index, result);
            }
            Target::Unpack(_) => {
                return Err(ExecutionError::type_err(
                    "augmented assignment target must be a name or subscript",
                ));
            }
        };
        let result = self.apply_inplace(current, op, rhs)?;
        let Target::Name(name) = target else {
            unreachable!()
        };
        self.bind_name(name, result);
        Ok(())
    }

    /// `list += iterable` extends in place so aliases observe the update;
    /// everything else falls back to the plain binary operation.
    fn apply_inplace(&mut self, current: Value, op: BinOp, rhs: Value) -> ExecResult<Value> {
        if op == BinOp::Add
            && let Value::List(items) = &current
        {
            let extra = self.materialize(&rhs)?;
            self.charge(extra.len() * 16)?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        self.binary_op(op, current, rhs)
    }

    fn assign(&mut self, target: &Target, value: Value) -> ExecResult<()> {
        match target {
            Target::Name(name) => {
                self.bind_name(name, value);
                Ok(())
            }
            Target::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                self.set_index(&obj, &index, value)
            }
            Target::Unpack(targets) => {
                let items = self.materialize(&value)?;
                if items.len() != targets.len() {
                    return Err(ExecutionError::value_err(format!(
                        "cannot unpack {} values into {} targets",
                        items.len(),
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
        }
    }

    pub fn bind_name(&mut self, name: &str, value: Value) {
        let scope = self.chain.last().expect("scope chain is never empty");
        scope.borrow_mut().insert(name.to_owned(), value);
    }

    fn lookup(&self, name: &str) -> ExecResult<Value> {
        for scope in self.chain.iter().rev() {
            if let Some(value) = scope.borrow().get(name) {
                return Ok(value.clone());
            }
        }
        if name == "__import__" {
            return Err(ExecutionError::import_forbidden());
        }
        Err(ExecutionError::name(name))
    }

    pub fn eval(&mut self, expr: &Expr) -> ExecResult<Value> {
        self.tick()?;
        match expr {
            Expr::None => Ok(Value::None),
            Expr::True => Ok(Value::Bool(true)),
            Expr::False => Ok(Value::Bool(false)),
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Float(v) => Ok(Value::Float(*v)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bytes(b) => Ok(Value::Bytes(b.clone())),
            Expr::FString(parts) => self.eval_fstring(parts),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                self.charge(items.len() * 16)?;
                let values: ExecResult<Vec<Value>> =
                    items.iter().map(|item| self.eval(item)).collect();
                Ok(Value::List(Rc::new(std::cell::RefCell::new(values?))))
            }
            Expr::Tuple(items) => {
                self.charge(items.len() * 16)?;
                let values: ExecResult<Vec<Value>> =
                    items.iter().map(|item| self.eval(item)).collect();
                Ok(Value::Tuple(values?.into()))
            }
            Expr::Dict(entries) => {
                self.charge(entries.len() * 32)?;
                let mut dict = DictValue::new();
                for (key_expr, value_expr) in entries {
                    let key = Key::from_value(&self.eval(key_expr)?)?;
                    let value = self.eval(value_expr)?;
                    dict.insert(key, value);
                }
                Ok(Value::Dict(Rc::new(std::cell::RefCell::new(dict))))
            }
            Expr::Set(items) => {
                self.charge(items.len() * 16)?;
                let mut set = SetValue::new(false);
                for item in items {
                    set.insert(Key::from_value(&self.eval(item)?)?);
                }
                Ok(Value::Set(Rc::new(std::cell::RefCell::new(set))))
            }
            Expr::Attr { obj, name } => {
                let obj = self.eval(obj)?;
                caps::get_attr(&obj, name)
            }
            Expr::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                self.get_index(&obj, &index)
            }
            Expr::Slice {
                obj,
                lower,
                upper,
                step,
            } => {
                let obj = self.eval(obj)?;
                let lower = self.eval_opt_index(lower)?;
                let upper = self.eval_opt_index(upper)?;
                let step = self.eval_opt_index(step)?;
                self.get_slice(&obj, lower, upper, step)
            }
            Expr::Call { func, args } => {
                let func = self.eval(func)?;
                let (positional, keywords) = self.eval_call_args(args)?;
                self.call_value(&func, positional, keywords)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                self.unary_op(*op, value)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary_op(*op, left, right)
            }
            Expr::BoolChain { op, values } => {
                let mut last = Value::None;
                for (idx, value_expr) in values.iter().enumerate() {
                    last = self.eval(value_expr)?;
                    let is_true = truthy(&last);
                    let done = match op {
                        BoolOp::And => !is_true,
                        BoolOp::Or => is_true,
                    };
                    if done && idx + 1 < values.len() {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            Expr::Not(operand) => {
                let value = self.eval(operand)?;
                Ok(Value::Bool(!truthy(&value)))
            }
            Expr::Compare { left, rest } => {
                let mut prev = self.eval(left)?;
                for (op, right_expr) in rest {
                    let right = self.eval(right_expr)?;
                    if !self.compare(*op, &prev, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    prev = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Cond { test, body, orelse } => {
                if truthy(&self.eval(test)?) {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Lambda { params, body } => self.make_function(
                "<lambda>".to_owned(),
                params.clone(),
                FuncBody::Expr(body.clone()),
            ),
            Expr::Comp {
                kind,
                key,
                value,
                clauses,
            } => self.eval_comp(*kind, key, value.as_deref(), clauses),
        }
    }

    fn make_function(
        &mut self,
        name: String,
        params: Rc<crate::ast::ParamSpec>,
        body: FuncBody,
    ) -> ExecResult<Value> {
        let mut defaults = Vec::new();
        for param in &params.params {
            if let Some(default) = &param.default {
                defaults.push(self.eval(default)?);
            }
        }
        Ok(Value::Func(Rc::new(FuncValue {
            name,
            params,
            defaults,
            body,
            closure: self.chain.clone(),
        })))
    }

    fn eval_opt_index(&mut self, expr: &Option<Box<Expr>>) -> ExecResult<Option<i64>> {
        match expr {
            None => Ok(None),
            Some(expr) => {
                let value = self.eval(expr)?;
                Ok(Some(self.expect_int(&value, "slice index")?))
            }
        }
    }

    pub fn expect_int(&self, value: &Value, what: &str) -> ExecResult<i64> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(*b as i64),
            other => Err(ExecutionError::type_err(format!(
                "{what} must be an integer, not '{}'",
                type_name(other)
            ))),
        }
    }

    fn eval_call_args(
        &mut self,
        args: &[CallArg],
    ) -> ExecResult<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::new();
        let mut keywords: Vec<(String, Value)> = Vec::new();
        for arg in args {
            match arg {
                CallArg::Positional(expr) => positional.push(self.eval(expr)?),
                CallArg::Keyword(name, expr) => keywords.push((name.clone(), self.eval(expr)?)),
                CallArg::Star(expr) => {
                    let value = self.eval(expr)?;
                    positional.extend(self.materialize(&value)?);
                }
                CallArg::DoubleStar(expr) => {
                    let value = self.eval(expr)?;
                    let Value::Dict(dict) = &value else {
                        return Err(ExecutionError::type_err(
                            "argument after ** must be a dict",
                        ));
                    };
                    for (key, item) in dict.borrow().entries() {
                        let Key::Str(name) = key else {
                            return Err(ExecutionError::type_err(
                                "keywords must be strings",
                            ));
                        };
                        keywords.push((name.to_string(), item.clone()));
                    }
                }
            }
        }
        Ok((positional, keywords))
    }

    pub fn call_value(
        &mut self,
        func: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ExecResult<Value> {
        match func {
            Value::Func(f) => self.call_function(f, args, kwargs),
            Value::Builtin(b) => caps::call_builtin(self, *b, args, kwargs),
            Value::Method(m) => crate::methods::dispatch(self, &m.recv, &m.name, args, kwargs),
            other => Err(ExecutionError::type_err(format!(
                "'{}' object is not callable",
                type_name(other)
            ))),
        }
    }

    pub fn call_function(
        &mut self,
        func: &Rc<FuncValue>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ExecResult<Value> {
        if self.frames + 1 > self.limits.max_frames {
            return Err(ExecutionError::new(
                ErrorKind::RecursionLimit,
                format!("maximum call depth of {} exceeded", self.limits.max_frames),
            ));
        }
        let local = new_scope();
        self.bind_params(func, args, kwargs, &local)?;
        let mut chain = func.closure.clone();
        chain.push(local);
        let saved = std::mem::replace(&mut self.chain, chain);
        self.frames += 1;
        let result = match &func.body {
            FuncBody::Block(stmts) => self.exec_block(stmts).map(|flow| match flow {
                Flow::Return(value) => value,
                _ => Value::None,
            }),
            FuncBody::Expr(expr) => self.eval(expr),
        };
        self.frames -= 1;
        self.chain = saved;
        result
    }

    fn bind_params(
        &mut self,
        func: &FuncValue,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        local: &ScopeRef,
    ) -> ExecResult<()> {
        let spec = &func.params;
        let n_params = spec.params.len();
        let mut bound: Vec<Option<Value>> = vec![None; n_params];
        let mut extra_positional = Vec::new();
        for (idx, value) in args.into_iter().enumerate() {
            if idx < n_params {
                bound[idx] = Some(value);
            } else {
                extra_positional.push(value);
            }
        }
        if !extra_positional.is_empty() && spec.vararg.is_none() {
            return Err(ExecutionError::type_err(format!(
                "{}() takes {} positional arguments but more were given",
                func.name, n_params
            )));
        }
        let mut extra_keywords = DictValue::new();
        for (name, value) in kwargs {
            if let Some(idx) = spec.params.iter().position(|p| p.name == name) {
                if bound[idx].is_some() {
                    return Err(ExecutionError::type_err(format!(
                        "{}() got multiple values for argument '{name}'",
                        func.name
                    )));
                }
                bound[idx] = Some(value);
            } else if spec.kwarg.is_some() {
                extra_keywords.insert(Key::Str(name.into()), value);
            } else {
                return Err(ExecutionError::type_err(format!(
                    "{}() got an unexpected keyword argument '{name}'",
                    func.name
                )));
            }
        }
        let mut default_iter = func.defaults.iter();
        for (idx, param) in spec.params.iter().enumerate() {
            if param.default.is_some() {
                let default = default_iter.next().expect("defaults align with params");
                if bound[idx].is_none() {
                    bound[idx] = Some(default.clone());
                }
            }
        }
        let mut scope = local.borrow_mut();
        for (idx, param) in spec.params.iter().enumerate() {
            match bound[idx].take() {
                Some(value) => {
                    scope.insert(param.name.clone(), value);
                }
                None => {
                    return Err(ExecutionError::type_err(format!(
                        "{}() missing required argument '{}'",
                        func.name, param.name
                    )));
                }
            }
        }
        if let Some(vararg) = &spec.vararg {
            scope.insert(vararg.clone(), Value::Tuple(extra_positional.into()));
        }
        if let Some(kwarg) = &spec.kwarg {
            scope.insert(
                kwarg.clone(),
                Value::Dict(Rc::new(std::cell::RefCell::new(extra_keywords))),
            );
        }
        Ok(())
    }

    fn eval_comp(
        &mut self,
        kind: CompKind,
        key: &Expr,
        value: Option<&Expr>,
        clauses: &[CompClause],
    ) -> ExecResult<Value> {
        enum CompOut {
            List(Vec<Value>),
            Set(SetValue),
            Dict(DictValue),
        }
        let mut out = match kind {
            CompKind::List | CompKind::Generator => CompOut::List(Vec::new()),
            CompKind::Set => CompOut::Set(SetValue::new(false)),
            CompKind::Dict => CompOut::Dict(DictValue::new()),
        };
        self.chain.push(new_scope());
        let result = self.comp_clause(clauses, 0, key, value, &mut |interp, k, v| match &mut out {
            CompOut::List(items) => {
                interp.charge(16)?;
                items.push(k);
                let _ = v;
                Ok(())
            }
            CompOut::Set(set) => {
                interp.charge(16)?;
                set.insert(Key::from_value(&k)?);
                Ok(())
            }
            CompOut::Dict(dict) => {
                interp.charge(32)?;
                dict.insert(Key::from_value(&k)?, v.expect("dict comp has a value"));
                Ok(())
            }
        });
        self.chain.pop();
        result?;
        Ok(match out {
            CompOut::List(items) => {
                if kind == CompKind::Generator {
                    IterValue::from_values(items)
                } else {
                    Value::List(Rc::new(std::cell::RefCell::new(items)))
                }
            }
            CompOut::Set(set) => Value::Set(Rc::new(std::cell::RefCell::new(set))),
            CompOut::Dict(dict) => Value::Dict(Rc::new(std::cell::RefCell::new(dict))),
        })
    }

    fn comp_clause(
        &mut self,
        clauses: &[CompClause],
        idx: usize,
        key: &Expr,
        value: Option<&Expr>,
        emit: &mut dyn FnMut(&mut Self, Value, Option<Value>) -> ExecResult<()>,
    ) -> ExecResult<()> {
        if idx == clauses.len() {
            let k = self.eval(key)?;
            let v = match value {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            };
            return emit(self, k, v);
        }
        let clause = &clauses[idx];
        let iterable = self.eval(&clause.iter)?;
        let mut cursor = self.cursor(&iterable)?;
        'items: while let Some(item) = cursor.next() {
            self.tick()?;
            self.assign(&clause.target, item)?;
            for test in &clause.ifs {
                if !truthy(&self.eval(test)?) {
                    continue 'items;
                }
            }
            self.comp_clause(clauses, idx + 1, key, value, emit)?;
        }
        Ok(())
    }

    fn eval_fstring(&mut self, parts: &[FStringPart]) -> ExecResult<Value> {
        let mut out = String::new();
        for part in parts {
            match part {
                FStringPart::Lit(text) => {
                    self.charge(text.len())?;
                    out.push_str(text);
                }
                FStringPart::Expr {
                    expr,
                    conversion,
                    format,
                } => {
                    let value = self.eval(expr)?;
                    let rendered = match conversion {
                        Some('r') => repr(&value),
                        _ => match format {
                            Some(spec) => crate::methods::format_value(&value, spec)?,
                            None => to_display(&value),
                        },
                    };
                    let rendered = match (conversion, format) {
                        (Some('r'), Some(spec)) => crate::methods::format_str(&rendered, spec)?,
                        _ => rendered,
                    };
                    self.charge(rendered.len())?;
                    out.push_str(&rendered);
                }
            }
        }
        Ok(Value::Str(out.into()))
    }

    // ---- iteration ----------------------------------------------------

    pub fn cursor(&mut self, value: &Value) -> ExecResult<Cursor> {
        Ok(match value {
            Value::Str(s) => {
                self.charge(s.len() * 4)?;
                Cursor::Items(
                    s.chars()
                        .map(|c| Value::Str(c.to_string().into()))
                        .collect::<Vec<_>>()
                        .into_iter(),
                )
            }
            Value::Bytes(b) => {
                self.charge(b.len() * 8)?;
                Cursor::Items(
                    b.iter()
                        .map(|&byte| Value::Int(byte as i64))
                        .collect::<Vec<_>>()
                        .into_iter(),
                )
            }
            Value::List(items) => Cursor::Items(items.borrow().clone().into_iter()),
            Value::Tuple(items) => Cursor::Items(items.to_vec().into_iter()),
            Value::Dict(dict) => Cursor::Items(
                dict.borrow()
                    .keys()
                    .map(Key::to_value)
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            Value::Set(set) => Cursor::Items(
                set.borrow()
                    .keys()
                    .map(Key::to_value)
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            Value::Range(range) => Cursor::Range {
                cur: range.start,
                stop: range.stop,
                step: range.step,
            },
            Value::Iter(shared) => Cursor::Shared(shared.clone()),
            other => {
                return Err(ExecutionError::type_err(format!(
                    "'{}' object is not iterable",
                    type_name(other)
                )));
            }
        })
    }

    /// Collects an iterable into a vector, charging steps per element.
    pub fn materialize(&mut self, value: &Value) -> ExecResult<Vec<Value>> {
        let mut cursor = self.cursor(value)?;
        let mut items = Vec::new();
        while let Some(item) = cursor.next() {
            self.tick()?;
            self.charge(16)?;
            items.push(item);
        }
        Ok(items)
    }

    // ---- indexing and slicing -----------------------------------------

    pub fn get_index(&mut self, obj: &Value, index: &Value) -> ExecResult<Value> {
        match obj {
            Value::List(items) => {
                let items = items.borrow();
                let idx = self.normalize_index(index, items.len(), "list")?;
                Ok(items[idx].clone())
            }
            Value::Tuple(items) => {
                let idx = self.normalize_index(index, items.len(), "tuple")?;
                Ok(items[idx].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = self.normalize_index(index, chars.len(), "string")?;
                Ok(Value::Str(chars[idx].to_string().into()))
            }
            Value::Bytes(b) => {
                let idx = self.normalize_index(index, b.len(), "bytes")?;
                Ok(Value::Int(b[idx] as i64))
            }
            Value::Dict(dict) => {
                let key = Key::from_value(index)?;
                dict.borrow().get(&key).cloned().ok_or_else(|| {
                    ExecutionError::new(ErrorKind::Key, repr(&key.to_value()))
                })
            }
            Value::Range(range) => {
                let len = range.len() as usize;
                let idx = self.normalize_index(index, len, "range")?;
                Ok(Value::Int(range.start + range.step * idx as i64))
            }
            other => Err(ExecutionError::type_err(format!(
                "'{}' object is not subscriptable",
                type_name(other)
            ))),
        }
    }

    fn set_index(&mut self, obj: &Value, index: &Value, value: Value) -> ExecResult<()> {
        match obj {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let idx = self.normalize_index(index, items.len(), "list")?;
                items[idx] = value;
                Ok(())
            }
            Value::Dict(dict) => {
                let key = Key::from_value(index)?;
                dict.borrow_mut().insert(key, value);
                Ok(())
            }
            other => Err(ExecutionError::type_err(format!(
                "'{}' object does not support item assignment",
                type_name(other)
            ))),
        }
    }

    fn normalize_index(&self, index: &Value, len: usize, what: &str) -> ExecResult<usize> {
        let idx = self.expect_int(index, "index")?;
        let adjusted = if idx < 0 { idx + len as i64 } else { idx };
        if adjusted < 0 || adjusted as usize >= len {
            return Err(ExecutionError::new(
                ErrorKind::Index,
                format!("{what} index out of range"),
            ));
        }
        Ok(adjusted as usize)
    }

    fn get_slice(
        &mut self,
        obj: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
    ) -> ExecResult<Value> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(ExecutionError::value_err("slice step cannot be zero"));
        }
        match obj {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = slice_indices(chars.len(), lower, upper, step);
                self.charge(picked.len() * 4)?;
                let out: String = picked.into_iter().map(|i| chars[i]).collect();
                Ok(Value::Str(out.into()))
            }
            Value::Bytes(b) => {
                let picked = slice_indices(b.len(), lower, upper, step);
                self.charge(picked.len())?;
                let out: Vec<u8> = picked.into_iter().map(|i| b[i]).collect();
                Ok(Value::Bytes(out.into()))
            }
            Value::List(items) => {
                let items = items.borrow();
                let picked = slice_indices(items.len(), lower, upper, step);
                self.charge(picked.len() * 16)?;
                let out: Vec<Value> = picked.into_iter().map(|i| items[i].clone()).collect();
                Ok(Value::List(Rc::new(std::cell::RefCell::new(out))))
            }
            Value::Tuple(items) => {
                let picked = slice_indices(items.len(), lower, upper, step);
                self.charge(picked.len() * 16)?;
                let out: Vec<Value> = picked.into_iter().map(|i| items[i].clone()).collect();
                Ok(Value::Tuple(out.into()))
            }
            other => Err(ExecutionError::type_err(format!(
                "'{}' object cannot be sliced",
                type_name(other)
            ))),
        }
    }

    // ---- operators ----------------------------------------------------

    fn unary_op(&mut self, op: UnaryOp, value: Value) -> ExecResult<Value> {
        match (op, &value) {
            (UnaryOp::Neg, Value::Int(i)) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| ExecutionError::value_err("integer overflow")),
            (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnaryOp::Neg, Value::Bool(b)) => Ok(Value::Int(-(*b as i64))),
            (UnaryOp::Pos, Value::Int(_) | Value::Float(_)) => Ok(value),
            (UnaryOp::Pos, Value::Bool(b)) => Ok(Value::Int(*b as i64)),
            (UnaryOp::Invert, Value::Int(i)) => Ok(Value::Int(!i)),
            (UnaryOp::Invert, Value::Bool(b)) => Ok(Value::Int(!(*b as i64))),
            _ => Err(ExecutionError::type_err(format!(
                "bad operand type for unary operator: '{}'",
                type_name(&value)
            ))),
        }
    }

    pub fn binary_op(&mut self, op: BinOp, left: Value, right: Value) -> ExecResult<Value> {
        use BinOp::*;
        let type_error = |left: &Value, right: &Value| {
            ExecutionError::type_err(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                type_name(left),
                type_name(right)
            ))
        };
        match op {
            Add => match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => {
                    self.charge(a.len() + b.len())?;
                    Ok(Value::Str(format!("{a}{b}").into()))
                }
                (Value::Bytes(a), Value::Bytes(b)) => {
                    self.charge(a.len() + b.len())?;
                    let mut out = a.to_vec();
                    out.extend_from_slice(b);
                    Ok(Value::Bytes(out.into()))
                }
                (Value::List(a), Value::List(b)) => {
                    let mut out = a.borrow().clone();
                    out.extend(b.borrow().iter().cloned());
                    self.charge(out.len() * 16)?;
                    Ok(Value::List(Rc::new(std::cell::RefCell::new(out))))
                }
                (Value::Tuple(a), Value::Tuple(b)) => {
                    self.charge((a.len() + b.len()) * 16)?;
                    let mut out = a.to_vec();
                    out.extend_from_slice(b);
                    Ok(Value::Tuple(out.into()))
                }
                _ => self.numeric_op(op, &left, &right, type_error),
            },
            Sub => match (&left, &right) {
                (Value::Set(a), Value::Set(b)) => {
                    let (a, b) = (a.borrow(), b.borrow());
                    let mut out = SetValue::new(false);
                    for key in a.keys() {
                        if !b.contains(key) {
                            out.insert(key.clone());
                        }
                    }
                    Ok(Value::Set(Rc::new(std::cell::RefCell::new(out))))
                }
                _ => self.numeric_op(op, &left, &right, type_error),
            },
            Mul => match (&left, &right) {
                (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
                    let count = (*n).max(0) as usize;
                    self.charge(s.len().saturating_mul(count))?;
                    Ok(Value::Str(s.repeat(count).into()))
                }
                (Value::Bytes(b), Value::Int(n)) | (Value::Int(n), Value::Bytes(b)) => {
                    let count = (*n).max(0) as usize;
                    self.charge(b.len().saturating_mul(count))?;
                    Ok(Value::Bytes(b.repeat(count).into()))
                }
                (Value::List(items), Value::Int(n)) | (Value::Int(n), Value::List(items)) => {
                    let items = items.borrow();
                    let count = (*n).max(0) as usize;
                    self.charge(items.len().saturating_mul(count).saturating_mul(16))?;
                    let mut out = Vec::with_capacity(items.len() * count);
                    for _ in 0..count {
                        out.extend(items.iter().cloned());
                    }
                    Ok(Value::List(Rc::new(std::cell::RefCell::new(out))))
                }
                (Value::Tuple(items), Value::Int(n)) | (Value::Int(n), Value::Tuple(items)) => {
                    let count = (*n).max(0) as usize;
                    self.charge(items.len().saturating_mul(count).saturating_mul(16))?;
                    let mut out = Vec::with_capacity(items.len() * count);
                    for _ in 0..count {
                        out.extend(items.iter().cloned());
                    }
                    Ok(Value::Tuple(out.into()))
                }
                _ => self.numeric_op(op, &left, &right, type_error),
            },
            BitAnd | BitOr | BitXor => match (&left, &right) {
                (Value::Set(a), Value::Set(b)) => {
                    let (a, b) = (a.borrow(), b.borrow());
                    let mut out = SetValue::new(false);
                    match op {
                        BitAnd => {
                            for key in a.keys() {
                                if b.contains(key) {
                                    out.insert(key.clone());
                                }
                            }
                        }
                        BitOr => {
                            for key in a.keys().chain(b.keys()) {
                                out.insert(key.clone());
                            }
                        }
                        _ => {
                            for key in a.keys() {
                                if !b.contains(key) {
                                    out.insert(key.clone());
                                }
                            }
                            for key in b.keys() {
                                if !a.contains(key) {
                                    out.insert(key.clone());
                                }
                            }
                        }
                    }
                    Ok(Value::Set(Rc::new(std::cell::RefCell::new(out))))
                }
                _ => {
                    let a = self.expect_int(&left, "operand").map_err(|_| type_error(&left, &right))?;
                    let b = self.expect_int(&right, "operand").map_err(|_| type_error(&left, &right))?;
                    Ok(Value::Int(match op {
                        BitAnd => a & b,
                        BitOr => a | b,
                        _ => a ^ b,
                    }))
                }
            },
            Shl | Shr => {
                let a = self.expect_int(&left, "operand").map_err(|_| type_error(&left, &right))?;
                let b = self.expect_int(&right, "operand").map_err(|_| type_error(&left, &right))?;
                if b < 0 {
                    return Err(ExecutionError::value_err("negative shift count"));
                }
                if op == Shl {
                    let factor = if b >= 63 {
                        None
                    } else {
                        Some(1i64 << b)
                    };
                    factor
                        .and_then(|f| a.checked_mul(f))
                        .map(Value::Int)
                        .ok_or_else(overflow)
                } else {
                    Ok(Value::Int(a >> b.min(63)))
                }
            }
            _ => self.numeric_op(op, &left, &right, type_error),
        }
    }

    fn numeric_op(
        &mut self,
        op: BinOp,
        left: &Value,
        right: &Value,
        type_error: impl Fn(&Value, &Value) -> ExecutionError,
    ) -> ExecResult<Value> {
        use BinOp::*;
        let as_int = |v: &Value| match v {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        };
        let as_float = |v: &Value| match v {
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        };
        if let (Some(a), Some(b)) = (as_int(left), as_int(right)) {
            return match op {
                Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
                Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
                Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
                Div => {
                    if b == 0 {
                        Err(zero_division())
                    } else {
                        Ok(Value::Float(a as f64 / b as f64))
                    }
                }
                FloorDiv => {
                    if b == 0 {
                        Err(zero_division())
                    } else {
                        let mut q = a / b;
                        let r = a % b;
                        if r != 0 && (r < 0) != (b < 0) {
                            q -= 1;
                        }
                        Ok(Value::Int(q))
                    }
                }
                Mod => {
                    if b == 0 {
                        Err(zero_division())
                    } else {
                        let mut r = a % b;
                        if r != 0 && (r < 0) != (b < 0) {
                            r += b;
                        }
                        Ok(Value::Int(r))
                    }
                }
                Pow => {
                    if b >= 0 {
                        let exp = u32::try_from(b).map_err(|_| overflow())?;
                        a.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
                    } else {
                        Ok(Value::Float((a as f64).powi(b as i32)))
                    }
                }
                _ => Err(type_error(left, right)),
            };
        }
        if let (Some(a), Some(b)) = (as_float(left), as_float(right)) {
            return match op {
                Add => Ok(Value::Float(a + b)),
                Sub => Ok(Value::Float(a - b)),
                Mul => Ok(Value::Float(a * b)),
                Div => {
                    if b == 0.0 {
                        Err(zero_division())
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
                FloorDiv => {
                    if b == 0.0 {
                        Err(zero_division())
                    } else {
                        Ok(Value::Float((a / b).floor()))
                    }
                }
                Mod => {
                    if b == 0.0 {
                        Err(zero_division())
                    } else {
                        Ok(Value::Float(a - b * (a / b).floor()))
                    }
                }
                Pow => Ok(Value::Float(a.powf(b))),
                _ => Err(type_error(left, right)),
            };
        }
        Err(type_error(left, right))
    }

    fn compare(&mut self, op: CmpOp, left: &Value, right: &Value) -> ExecResult<bool> {
        use std::cmp::Ordering;
        Ok(match op {
            CmpOp::Eq => values_equal(left, right),
            CmpOp::Ne => !values_equal(left, right),
            CmpOp::Lt => compare_values(left, right)? == Ordering::Less,
            CmpOp::Le => compare_values(left, right)? != Ordering::Greater,
            CmpOp::Gt => compare_values(left, right)? == Ordering::Greater,
            CmpOp::Ge => compare_values(left, right)? != Ordering::Less,
            CmpOp::In => self.contains(right, left)?,
            CmpOp::NotIn => !self.contains(right, left)?,
            CmpOp::Is => values_identical(left, right),
            CmpOp::IsNot => !values_identical(left, right),
        })
    }

    fn contains(&mut self, container: &Value, item: &Value) -> ExecResult<bool> {
        match container {
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
                other => Err(ExecutionError::type_err(format!(
                    "'in <string>' requires a string, not '{}'",
                    type_name(other)
                ))),
            },
            Value::Bytes(haystack) => match item {
                Value::Bytes(needle) => Ok(needle.is_empty()
                    || haystack
                        .windows(needle.len())
                        .any(|window| window == needle.as_ref())),
                Value::Int(byte) => Ok(haystack.contains(&(*byte as u8))),
                other => Err(ExecutionError::type_err(format!(
                    "'in <bytes>' requires bytes or an int, not '{}'",
                    type_name(other)
                ))),
            },
            Value::List(items) => {
                for candidate in items.borrow().iter() {
                    self.tick()?;
                    if values_equal(candidate, item) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Value::Tuple(items) => {
                for candidate in items.iter() {
                    self.tick()?;
                    if values_equal(candidate, item) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Value::Dict(dict) => Ok(dict.borrow().contains(&Key::from_value(item)?)),
            Value::Set(set) => Ok(set.borrow().contains(&Key::from_value(item)?)),
            Value::Range(range) => match item {
                Value::Int(i) => {
                    let RangeValue { start, stop, step } = **range;
                    let inside = if step > 0 {
                        *i >= start && *i < stop && (*i - start) % step == 0
                    } else {
                        *i <= start && *i > stop && (start - *i) % (-step) == 0
                    };
                    Ok(inside)
                }
                _ => Ok(false),
            },
            other => Err(ExecutionError::type_err(format!(
                "argument of type '{}' is not a container",
                type_name(other)
            ))),
        }
    }
}

fn overflow() -> ExecutionError {
    ExecutionError::value_err("integer overflow")
}

fn zero_division() -> ExecutionError {
    ExecutionError::new(ErrorKind::ZeroDivision, "division by zero")
}

fn values_identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => Rc::ptr_eq(x, y),
        (Value::Bytes(x), Value::Bytes(y)) => Rc::ptr_eq(x, y),
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Set(x), Value::Set(y)) => Rc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y),
        (Value::Func(x), Value::Func(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

pub enum Cursor {
    Items(std::vec::IntoIter<Value>),
    Range { cur: i64, stop: i64, step: i64 },
    Shared(Rc<std::cell::RefCell<IterValue>>),
}

impl Cursor {
    pub fn next(&mut self) -> Option<Value> {
        match self {
            Cursor::Items(iter) => iter.next(),
            Cursor::Range { cur, stop, step } => {
                let live = if *step > 0 { cur < stop } else { cur > stop };
                if !live {
                    return None;
                }
                let out = *cur;
                *cur += *step;
                Some(Value::Int(out))
            }
            Cursor::Shared(shared) => shared.borrow_mut().next(),
        }
    }
}

/// Python slice semantics: clamped bounds, optional negatives, any non-zero
/// step. Returns the selected indices in traversal order.
fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len_i = len as i64;
    let clamp = |idx: i64, max: i64| idx.clamp(0, max);
    let resolve = |idx: Option<i64>, default: i64, max: i64| match idx {
        None => default,
        Some(i) if i < 0 => clamp(i + len_i, max),
        Some(i) => clamp(i, max),
    };
    let mut out = Vec::new();
    if step > 0 {
        let start = resolve(lower, 0, len_i);
        let stop = resolve(upper, len_i, len_i);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = match lower {
            None => len_i - 1,
            Some(i) if i < 0 => (i + len_i).clamp(-1, len_i - 1),
            Some(i) => i.clamp(-1, len_i - 1),
        };
        let stop = match upper {
            None => -1,
            Some(i) if i < 0 => (i + len_i).clamp(-1, len_i - 1),
            Some(i) => i.clamp(-1, len_i - 1),
        };
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_indices_match_python() {
        assert_eq!(slice_indices(5, None, None, 1), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(5, Some(1), Some(4), 1), vec![1, 2, 3]);
        assert_eq!(slice_indices(5, None, None, -1), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, 1), vec![3, 4]);
        assert_eq!(slice_indices(5, None, Some(-3), 1), vec![0, 1]);
        assert_eq!(slice_indices(5, Some(10), Some(20), 1), Vec::<usize>::new());
        assert_eq!(slice_indices(5, None, None, 2), vec![0, 2, 4]);
        assert_eq!(slice_indices(5, Some(4), Some(0), -2), vec![4, 2]);
    }
}
