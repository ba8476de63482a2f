use std::collections::HashMap;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::ast::{Ast, BinaryOp, ExprId, ExprKind, HelperFunction, StmtId, StmtKind, Type, UnaryOp};
use crate::backend::{Backend, BackendFileId, HostCalls};
use crate::config::{DEFAULT_MAX_CALL_DEPTH, DEFAULT_ON_FN_TIME_LIMIT};
use crate::error::{CompileError, InvokeError, RuntimeErrorKind};
use crate::value::Value;

/// The default backend: a tree-walking interpreter over the resolved AST.
/// Compiling a script stores a copy of its tree; invoking walks it. Slow
/// next to a translating backend but dependency-free and exact, which
/// makes it the reference for what any other backend must observe.
pub struct Interpreter {
    units: HashMap<BackendFileId, Unit>,
    next_unit: u64,
    max_call_depth: usize,
    on_fn_time_limit: Duration,
    fast: bool,
}

struct Unit {
    ast: Ast,
    member_index: HashMap<String, usize>,
}

impl Interpreter {
    pub fn new(max_call_depth: usize, on_fn_time_limit: Duration) -> Self {
        Interpreter {
            units: HashMap::new(),
            next_unit: 0,
            max_call_depth,
            on_fn_time_limit,
            fast: false,
        }
    }

    fn unit(&self, id: BackendFileId) -> Result<&Unit, InvokeError> {
        self.units
            .get(&id)
            .ok_or_else(|| InvokeError::game_fn("script is not compiled in this backend"))
    }

    fn machine<'a>(
        &'a self,
        unit: &'a Unit,
        me: u64,
        members: &'a mut [Value],
        host: &'a mut dyn HostCalls,
    ) -> Machine<'a> {
        Machine {
            ast: &unit.ast,
            member_index: &unit.member_index,
            me,
            members,
            host,
            scopes: Vec::new(),
            depth: 0,
            max_depth: self.max_call_depth,
            deadline: Instant::now() + self.on_fn_time_limit,
            fast: self.fast,
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new(DEFAULT_MAX_CALL_DEPTH, DEFAULT_ON_FN_TIME_LIMIT)
    }
}

impl Backend for Interpreter {
    fn compile(&mut self, ast: &Ast) -> anyhow::Result<BackendFileId> {
        let mut member_index = HashMap::new();
        for (i, member) in ast.members.iter().enumerate() {
            if ast.member_type(i).is_none() {
                return Err(CompileError {
                    message: format!("member '{}' has no resolved type", member.name),
                    line: Some(member.line),
                }
                .into());
            }
            member_index.insert(member.name.clone(), i);
        }
        let id = BackendFileId(self.next_unit);
        self.next_unit += 1;
        self.units.insert(id, Unit { ast: ast.clone(), member_index });
        Ok(id)
    }

    fn remove(&mut self, unit: BackendFileId) {
        self.units.remove(&unit);
    }

    fn init_members(
        &mut self,
        unit: BackendFileId,
        me: u64,
        members: &mut [Value],
        host: &mut dyn HostCalls,
    ) -> Result<(), InvokeError> {
        let unit = self.unit(unit)?;
        if members.len() != unit.ast.members.len() {
            return Err(InvokeError::game_fn(format!(
                "members buffer holds {} values, script declares {}",
                members.len(),
                unit.ast.members.len()
            )));
        }
        // Defaults first so an initializer that fails partway leaves every
        // slot holding a value of the right shape.
        for i in 0..unit.ast.members.len() {
            let ty = unit
                .ast
                .member_type(i)
                .ok_or_else(|| InvokeError::game_fn("script members are unresolved"))?;
            members[i] = ty.default_value();
        }
        let mut machine = self.machine(unit, me, members, host);
        machine.scopes.push(HashMap::new());
        for i in 0..machine.ast.members.len() {
            let init = machine.ast.members[i].init;
            let value = machine.eval(init)?;
            machine.members[i] = value;
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        unit: BackendFileId,
        on_fn: &str,
        me: u64,
        members: &mut [Value],
        args: &[Value],
        host: &mut dyn HostCalls,
    ) -> Result<(), InvokeError> {
        let unit = self.unit(unit)?;
        let Some(f) = unit.ast.on_function(on_fn) else {
            return Err(InvokeError::game_fn(format!("no on function named '{on_fn}'")));
        };
        if members.len() != unit.ast.members.len() {
            return Err(InvokeError::game_fn(format!(
                "members buffer holds {} values, script declares {}",
                members.len(),
                unit.ast.members.len()
            )));
        }
        if args.len() < f.args.len() {
            return Err(InvokeError::game_fn(format!(
                "'{on_fn}' expects {} arguments, got {}",
                f.args.len(),
                args.len()
            )));
        }
        let mut params = HashMap::new();
        for (declared, value) in f.args.iter().zip(args) {
            params.insert(declared.name.clone(), value.clone());
        }
        let body = &f.body;
        let mut machine = self.machine(unit, me, members, host);
        machine.scopes.push(params);
        machine.exec_block(body)?;
        Ok(())
    }

    /// Fast mode trades the per-statement clock sampling away; runaway
    /// loops are then the mod author's problem until it is switched back.
    fn set_fast_mode(&mut self, fast: bool) {
        self.fast = fast;
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Option<Value>),
}

struct Machine<'a> {
    ast: &'a Ast,
    member_index: &'a HashMap<String, usize>,
    me: u64,
    members: &'a mut [Value],
    host: &'a mut dyn HostCalls,
    scopes: Vec<HashMap<String, Value>>,
    depth: usize,
    max_depth: usize,
    deadline: Instant,
    fast: bool,
}

impl Machine<'_> {
    fn check_deadline(&self) -> Result<(), InvokeError> {
        if !self.fast && Instant::now() >= self.deadline {
            return Err(InvokeError {
                kind: RuntimeErrorKind::TimeLimitExceeded,
                reason: "ran past the on-function time limit".into(),
            });
        }
        Ok(())
    }

    fn exec_block(&mut self, body: &[StmtId]) -> Result<Flow, InvokeError> {
        self.scopes.push(HashMap::new());
        let result = self.exec_stmts(body);
        self.scopes.pop();
        result
    }

    fn exec_stmts(&mut self, body: &[StmtId]) -> Result<Flow, InvokeError> {
        for id in body {
            self.check_deadline()?;
            match self.exec_stmt(*id)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, id: StmtId) -> Result<Flow, InvokeError> {
        match &self.ast.stmt(id).kind {
            StmtKind::VariableDecl { name, init, rebind, .. } => {
                let value = self.eval(*init)?;
                if *rebind {
                    self.assign(name, value)?;
                } else {
                    self.scopes
                        .last_mut()
                        .expect("statements always run inside a scope")
                        .insert(name.clone(), value);
                }
                Ok(Flow::Normal)
            }
            StmtKind::Call { expr } => {
                match &self.ast.expr(*expr).kind {
                    ExprKind::Call { name, args } => {
                        self.call_fn(name, args)?;
                    }
                    _ => {
                        self.eval(*expr)?;
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::If { condition, then_body, else_body } => {
                if self.eval_condition(*condition)? {
                    self.exec_block(then_body)
                } else {
                    self.exec_block(else_body)
                }
            }
            StmtKind::While { condition, body } => {
                loop {
                    self.check_deadline()?;
                    if !self.eval_condition(*condition)? {
                        return Ok(Flow::Normal);
                    }
                    match self.exec_block(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => return Ok(Flow::Normal),
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Return { value } => {
                let value = match value {
                    Some(id) => Some(self.eval(*id)?),
                    None => None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Comment { .. } | StmtKind::Empty => Ok(Flow::Normal),
        }
    }

    fn eval_condition(&mut self, id: ExprId) -> Result<bool, InvokeError> {
        let value = self.eval(id)?;
        value.as_bool().ok_or_else(|| {
            InvokeError::game_fn(format!("condition evaluated to {}, expected bool", value.tag()))
        })
    }

    fn assign(&mut self, name: &str, value: Value) -> Result<(), InvokeError> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return Ok(());
            }
        }
        if let Some(&i) = self.member_index.get(name) {
            self.members[i] = value;
            return Ok(());
        }
        Err(InvokeError::game_fn(format!("unknown variable '{name}'")))
    }

    fn eval(&mut self, id: ExprId) -> Result<Value, InvokeError> {
        match &self.ast.expr(id).kind {
            ExprKind::True => Ok(Value::Bool(true)),
            ExprKind::False => Ok(Value::Bool(false)),
            ExprKind::Number { value } => Ok(Value::Number(*value)),
            ExprKind::String { value } => Ok(Value::String(value.clone())),
            ExprKind::Resource { path } => Ok(Value::String(path.clone())),
            ExprKind::Entity { name } => Ok(Value::String(name.clone())),
            ExprKind::Identifier { name } => {
                for scope in self.scopes.iter().rev() {
                    if let Some(value) = scope.get(name) {
                        return Ok(value.clone());
                    }
                }
                if let Some(&i) = self.member_index.get(name) {
                    return Ok(self.members[i].clone());
                }
                if name == "me" {
                    return Ok(Value::Id(self.me));
                }
                Err(InvokeError::game_fn(format!("unknown variable '{name}'")))
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval(*operand)?;
                match op {
                    UnaryOp::Neg => match value.as_number() {
                        Some(n) => Ok(Value::Number(-n)),
                        None => Err(InvokeError::game_fn(format!("cannot negate {}", value.tag()))),
                    },
                    UnaryOp::Not => match value.as_bool() {
                        Some(b) => Ok(Value::Bool(!b)),
                        None => Err(InvokeError::game_fn(format!("'not' needs bool, got {}", value.tag()))),
                    },
                }
            }
            ExprKind::Binary { op, left, right } => self.eval_binary(*op, *left, *right),
            ExprKind::Call { name, args } => match self.call_fn(name, args)? {
                Some(value) => Ok(value),
                None => Err(InvokeError::game_fn(format!(
                    "'{name}' returns no value and cannot be used in an expression"
                ))),
            },
            ExprKind::Parenthesized { inner } => self.eval(*inner),
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, left: ExprId, right: ExprId) -> Result<Value, InvokeError> {
        // and/or evaluate the right side only when the left side allows.
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let lhs = self.eval(left)?;
            let Some(l) = lhs.as_bool() else {
                return Err(InvokeError::game_fn(format!(
                    "'{}' needs bool operands, got {}",
                    op.symbol(),
                    lhs.tag()
                )));
            };
            match (op, l) {
                (BinaryOp::And, false) => return Ok(Value::Bool(false)),
                (BinaryOp::Or, true) => return Ok(Value::Bool(true)),
                _ => {}
            }
            let rhs = self.eval(right)?;
            let Some(r) = rhs.as_bool() else {
                return Err(InvokeError::game_fn(format!(
                    "'{}' needs bool operands, got {}",
                    op.symbol(),
                    rhs.tag()
                )));
            };
            return Ok(Value::Bool(r));
        }

        let lhs = self.eval(left)?;
        let rhs = self.eval(right)?;
        match op {
            BinaryOp::Eq | BinaryOp::Ne => {
                if lhs.tag() != rhs.tag() {
                    return Err(InvokeError::game_fn(format!(
                        "cannot compare {} and {}",
                        lhs.tag(),
                        rhs.tag()
                    )));
                }
                let equal = lhs == rhs;
                Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
            }
            _ => {
                let (Some(l), Some(r)) = (lhs.as_number(), rhs.as_number()) else {
                    return Err(InvokeError::game_fn(format!(
                        "'{}' needs number operands, got {} and {}",
                        op.symbol(),
                        lhs.tag(),
                        rhs.tag()
                    )));
                };
                let value = match op {
                    BinaryOp::Add => Value::Number(l + r),
                    BinaryOp::Sub => Value::Number(l - r),
                    BinaryOp::Mul => Value::Number(l * r),
                    BinaryOp::Div => Value::Number(l / r),
                    BinaryOp::Rem => Value::Number(l % r),
                    BinaryOp::Lt => Value::Bool(l < r),
                    BinaryOp::Le => Value::Bool(l <= r),
                    BinaryOp::Gt => Value::Bool(l > r),
                    BinaryOp::Ge => Value::Bool(l >= r),
                    BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => {
                        unreachable!("handled above")
                    }
                };
                Ok(value)
            }
        }
    }

    fn call_fn(&mut self, name: &str, args: &[ExprId]) -> Result<Option<Value>, InvokeError> {
        let mut values: SmallVec<[Value; 4]> = SmallVec::new();
        for arg in args {
            values.push(self.eval(*arg)?);
        }
        if name.starts_with("helper_") {
            return self.call_helper(name, &values);
        }
        match self.host.call_game_fn(name, self.me, &values) {
            Ok(result) => Ok(result),
            Err(reason) => Err(InvokeError::game_fn(format!("'{name}': {reason}"))),
        }
    }

    fn call_helper(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, InvokeError> {
        let Some(f) = self.ast.helper_function(name) else {
            return Err(InvokeError::game_fn(format!("unknown helper function '{name}'")));
        };
        if self.depth + 1 > self.max_depth {
            return Err(InvokeError {
                kind: RuntimeErrorKind::StackOverflow,
                reason: format!("call depth exceeded {}", self.max_depth),
            });
        }
        if args.len() != f.args.len() {
            return Err(InvokeError::game_fn(format!(
                "'{name}' takes {} arguments, got {}",
                f.args.len(),
                args.len()
            )));
        }
        self.check_deadline()?;
        let mut params = HashMap::new();
        for (declared, value) in f.args.iter().zip(args) {
            params.insert(declared.name.clone(), value.clone());
        }
        // Helpers do not see the caller's locals.
        let saved = std::mem::replace(&mut self.scopes, vec![params]);
        self.depth += 1;
        let result = self.exec_stmts(&f.body);
        self.depth -= 1;
        self.scopes = saved;
        match result? {
            Flow::Return(value) => self.finish_helper(f, value),
            Flow::Normal => self.finish_helper(f, None),
            Flow::Break | Flow::Continue => {
                Err(InvokeError::game_fn("'break' escaped its function"))
            }
        }
    }

    fn finish_helper(
        &self,
        f: &HelperFunction,
        value: Option<Value>,
    ) -> Result<Option<Value>, InvokeError> {
        match (&f.return_type, value) {
            (Type::Void, _) => Ok(None),
            (_, Some(value)) => Ok(Some(value)),
            (expected, None) => Err(InvokeError::game_fn(format!(
                "'{}' finished without returning a {expected}",
                f.name
            ))),
        }
    }
}
