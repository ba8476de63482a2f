use std::collections::HashMap;

use crate::ast::{Ast, BinaryOp, ExprId, ExprKind, FnArg, StmtId, StmtKind, Type, UnaryOp};
use crate::dispatch::GameFns;
use crate::error::ParseError;

/// Side products of resolution the loader cares about: every resource
/// path the script references, in first-use order.
#[derive(Debug, Default)]
pub(crate) struct ResolveOutcome {
    pub resources: Vec<String>,
}

/// Walks a freshly parsed tree once, filling each expression's result
/// type, marking assignments to existing bindings as rebinds, and
/// reclassifying string literals whose expected type is a resource or
/// entity reference. Game functions the host has not registered resolve
/// dynamically; their misuse surfaces at run time instead.
pub(crate) fn resolve(ast: &mut Ast, game_fns: &GameFns) -> Result<ResolveOutcome, ParseError> {
    let mut helper_sigs = HashMap::new();
    for f in &ast.helper_functions {
        let sig = (f.args.iter().map(|a| a.ty.clone()).collect::<Vec<_>>(), f.return_type.clone());
        if helper_sigs.insert(f.name.clone(), sig).is_some() {
            return Err(err_at(f.line, format!("helper '{}' is defined twice", f.name)));
        }
    }
    let mut seen_on = HashMap::new();
    for f in &ast.on_functions {
        if seen_on.insert(f.name.clone(), ()).is_some() {
            return Err(err_at(f.line, format!("'{}' is defined twice", f.name)));
        }
    }

    let mut resolver = Resolver {
        game_fns,
        helper_sigs,
        members: Vec::new(),
        scopes: Vec::new(),
        loop_depth: 0,
        return_type: Type::Void,
        in_on_fn: false,
        outcome: ResolveOutcome::default(),
    };

    for i in 0..ast.members.len() {
        let member = ast.members[i].clone();
        if resolver.members.iter().any(|(name, _)| *name == member.name) {
            return Err(err_at(member.line, format!("member '{}' is declared twice", member.name)));
        }
        if member.name == "me" {
            return Err(err_at(member.line, "'me' is reserved"));
        }
        let got = resolver.resolve_expr(ast, member.init, member.ty.as_ref())?;
        let effective = match (&member.ty, got) {
            (Some(declared), Some(got)) if !declared.matches(&got) => {
                return Err(err_at(
                    member.line,
                    format!("member '{}' is declared {} but initialized with {}", member.name, declared, got),
                ));
            }
            (Some(declared), _) => declared.clone(),
            (None, Some(got)) if got != Type::Void => got,
            (None, _) => {
                return Err(err_at(
                    member.line,
                    format!("cannot infer the type of member '{}'; add a type annotation", member.name),
                ));
            }
        };
        resolver.members.push((member.name, effective));
    }

    for i in 0..ast.on_functions.len() {
        let f = ast.on_functions[i].clone();
        resolver.in_on_fn = true;
        resolver.return_type = Type::Void;
        resolver.resolve_fn_body(ast, &f.args, &f.body)?;
    }
    for i in 0..ast.helper_functions.len() {
        let f = ast.helper_functions[i].clone();
        resolver.in_on_fn = false;
        resolver.return_type = f.return_type.clone();
        resolver.resolve_fn_body(ast, &f.args, &f.body)?;
    }

    Ok(resolver.outcome)
}

fn err_at(line: u32, message: impl Into<String>) -> ParseError {
    ParseError::new(line, 1, message)
}

struct Resolver<'a> {
    game_fns: &'a GameFns,
    helper_sigs: HashMap<String, (Vec<Type>, Type)>,
    members: Vec<(String, Type)>,
    scopes: Vec<HashMap<String, Type>>,
    loop_depth: usize,
    return_type: Type,
    in_on_fn: bool,
    outcome: ResolveOutcome,
}

impl Resolver<'_> {
    fn resolve_fn_body(
        &mut self,
        ast: &mut Ast,
        args: &[FnArg],
        body: &[StmtId],
    ) -> Result<(), ParseError> {
        let mut params = HashMap::new();
        for arg in args {
            if arg.name == "me" {
                return Err(err_at(arg.line, "'me' is reserved"));
            }
            if self.members.iter().any(|(name, _)| *name == arg.name) {
                return Err(err_at(arg.line, format!("argument '{}' shadows a member", arg.name)));
            }
            if arg.ty == Type::Void {
                return Err(err_at(arg.line, format!("argument '{}' cannot be void", arg.name)));
            }
            if params.insert(arg.name.clone(), arg.ty.clone()).is_some() {
                return Err(err_at(arg.line, format!("duplicate argument '{}'", arg.name)));
            }
        }
        self.scopes.clear();
        self.scopes.push(params);
        self.loop_depth = 0;
        self.resolve_block(ast, body)
    }

    fn resolve_block(&mut self, ast: &mut Ast, body: &[StmtId]) -> Result<(), ParseError> {
        self.scopes.push(HashMap::new());
        let result = body.iter().try_for_each(|id| self.resolve_stmt(ast, *id));
        self.scopes.pop();
        result
    }

    fn lookup(&self, name: &str) -> Option<&Type> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .or_else(|| self.members.iter().find(|(n, _)| n == name).map(|(_, ty)| ty))
    }

    fn resolve_stmt(&mut self, ast: &mut Ast, id: StmtId) -> Result<(), ParseError> {
        let stmt = ast.stmt(id).clone();
        match stmt.kind {
            StmtKind::VariableDecl { ref name, ref ty, init, .. } => {
                if name == "me" {
                    return Err(err_at(stmt.line, "'me' is reserved"));
                }
                if let Some(existing) = self.lookup(name).cloned() {
                    if ty.is_some() {
                        return Err(err_at(
                            stmt.line,
                            format!("'{name}' is already declared; assign without a type"),
                        ));
                    }
                    let got = self.resolve_expr(ast, init, Some(&existing))?;
                    if let Some(got) = got {
                        if !existing.matches(&got) {
                            return Err(err_at(
                                stmt.line,
                                format!("cannot assign {got} to '{name}' of type {existing}"),
                            ));
                        }
                    }
                    if let StmtKind::VariableDecl { rebind, .. } = &mut ast.stmt_mut(id).kind {
                        *rebind = true;
                    }
                } else {
                    let got = self.resolve_expr(ast, init, ty.as_ref())?;
                    let effective = match (ty, got) {
                        (Some(declared), Some(got)) if !declared.matches(&got) => {
                            return Err(err_at(
                                stmt.line,
                                format!("'{name}' is declared {declared} but initialized with {got}"),
                            ));
                        }
                        (Some(declared), _) => declared.clone(),
                        (None, Some(got)) if got != Type::Void => got,
                        (None, _) => {
                            return Err(err_at(
                                stmt.line,
                                format!("cannot infer the type of '{name}'; add a type annotation"),
                            ));
                        }
                    };
                    self.scopes
                        .last_mut()
                        .expect("a function body always opens a scope")
                        .insert(name.clone(), effective);
                }
            }
            StmtKind::Call { expr } => {
                self.resolve_expr(ast, expr, None)?;
            }
            StmtKind::If { condition, ref then_body, ref else_body } => {
                self.resolve_condition(ast, condition, stmt.line)?;
                self.resolve_block(ast, then_body)?;
                self.resolve_block(ast, else_body)?;
            }
            StmtKind::While { condition, ref body } => {
                self.resolve_condition(ast, condition, stmt.line)?;
                self.loop_depth += 1;
                let result = self.resolve_block(ast, body);
                self.loop_depth -= 1;
                result?;
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    let what = if matches!(stmt.kind, StmtKind::Break) { "break" } else { "continue" };
                    return Err(err_at(stmt.line, format!("'{what}' outside of a loop")));
                }
            }
            StmtKind::Return { value } => match (value, self.return_type.clone()) {
                (Some(_), _) if self.in_on_fn => {
                    return Err(err_at(stmt.line, "on functions cannot return a value"));
                }
                (Some(value), expected) if expected != Type::Void => {
                    let got = self.resolve_expr(ast, value, Some(&expected))?;
                    if let Some(got) = got {
                        if !expected.matches(&got) {
                            return Err(err_at(
                                stmt.line,
                                format!("return type is {expected}, got {got}"),
                            ));
                        }
                    }
                }
                (Some(_), _) => {
                    return Err(err_at(stmt.line, "this helper does not return a value"));
                }
                (None, expected) if expected != Type::Void && !self.in_on_fn => {
                    return Err(err_at(stmt.line, format!("must return a {expected}")));
                }
                (None, _) => {}
            },
            StmtKind::Comment { .. } | StmtKind::Empty => {}
        }
        Ok(())
    }

    fn resolve_condition(&mut self, ast: &mut Ast, id: ExprId, line: u32) -> Result<(), ParseError> {
        match self.resolve_expr(ast, id, None)? {
            Some(Type::Bool) | None => Ok(()),
            Some(other) => Err(err_at(line, format!("condition must be bool, got {other}"))),
        }
    }

    /// Resolves one expression. `Some(ty)` once the type is known,
    /// `None` when it depends on an unregistered or value-returning game
    /// function and is checked dynamically instead.
    fn resolve_expr(
        &mut self,
        ast: &mut Ast,
        id: ExprId,
        expected: Option<&Type>,
    ) -> Result<Option<Type>, ParseError> {
        let expr = ast.expr(id).clone();
        let line = expr.line;
        let ty: Option<Type> = match expr.kind {
            ExprKind::True | ExprKind::False => Some(Type::Bool),
            ExprKind::Number { .. } => Some(Type::Number),
            ExprKind::String { value } => match expected {
                Some(Type::Resource { extension }) => {
                    if let Some(ext) = extension {
                        if !value.ends_with(ext.as_str()) {
                            return Err(err_at(
                                line,
                                format!("resource \"{value}\" must end with \"{ext}\""),
                            ));
                        }
                    }
                    if !self.outcome.resources.contains(&value) {
                        self.outcome.resources.push(value.clone());
                    }
                    ast.expr_mut(id).kind = ExprKind::Resource { path: value };
                    Some(Type::Resource { extension: extension.clone() })
                }
                Some(Type::Entity { entity_type }) => {
                    if let Some(t) = entity_type {
                        if !value.ends_with(&format!("-{t}.grug")) {
                            return Err(err_at(
                                line,
                                format!("\"{value}\" does not name a {t} script"),
                            ));
                        }
                    }
                    ast.expr_mut(id).kind = ExprKind::Entity { name: value };
                    Some(Type::Entity { entity_type: entity_type.clone() })
                }
                _ => Some(Type::String),
            },
            ExprKind::Resource { .. } => expr.result_type.clone(),
            ExprKind::Entity { .. } => expr.result_type.clone(),
            ExprKind::Identifier { ref name } => match self.lookup(name) {
                Some(ty) => Some(ty.clone()),
                None if name == "me" => Some(Type::Id { entity_type: None }),
                None => return Err(err_at(line, format!("unknown variable '{name}'"))),
            },
            ExprKind::Unary { op, operand } => {
                let (want, result) = match op {
                    UnaryOp::Neg => (Type::Number, Type::Number),
                    UnaryOp::Not => (Type::Bool, Type::Bool),
                };
                let got = self.resolve_expr(ast, operand, None)?;
                if let Some(got) = got {
                    if !got.matches(&want) {
                        let sym = if op == UnaryOp::Neg { "-" } else { "not" };
                        return Err(err_at(line, format!("'{sym}' needs a {want}, got {got}")));
                    }
                }
                Some(result)
            }
            ExprKind::Binary { op, left, right } => Some(self.resolve_binary(ast, op, left, right, line)?),
            ExprKind::Call { ref name, ref args } => self.resolve_call(ast, name, args, line)?,
            ExprKind::Parenthesized { inner } => self.resolve_expr(ast, inner, expected)?,
        };
        ast.expr_mut(id).result_type = ty.clone();
        Ok(ty)
    }

    fn resolve_binary(
        &mut self,
        ast: &mut Ast,
        op: BinaryOp,
        left: ExprId,
        right: ExprId,
        line: u32,
    ) -> Result<Type, ParseError> {
        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem
            | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                for side in [left, right] {
                    if let Some(got) = self.resolve_expr(ast, side, None)? {
                        if !got.matches(&Type::Number) {
                            return Err(err_at(
                                line,
                                format!("'{}' needs number operands, got {got}", op.symbol()),
                            ));
                        }
                    }
                }
                let comparison = matches!(op, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge);
                Ok(if comparison { Type::Bool } else { Type::Number })
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let lhs = self.resolve_expr(ast, left, None)?;
                let rhs = self.resolve_expr(ast, right, lhs.as_ref())?;
                if let (Some(l), Some(r)) = (&lhs, &rhs) {
                    if !l.matches(r) {
                        return Err(err_at(line, format!("cannot compare {l} and {r}")));
                    }
                }
                Ok(Type::Bool)
            }
            BinaryOp::And | BinaryOp::Or => {
                for side in [left, right] {
                    if let Some(got) = self.resolve_expr(ast, side, None)? {
                        if !got.matches(&Type::Bool) {
                            return Err(err_at(
                                line,
                                format!("'{}' needs bool operands, got {got}", op.symbol()),
                            ));
                        }
                    }
                }
                Ok(Type::Bool)
            }
        }
    }

    fn resolve_call(
        &mut self,
        ast: &mut Ast,
        name: &str,
        args: &[ExprId],
        line: u32,
    ) -> Result<Option<Type>, ParseError> {
        if name.starts_with("on_") {
            return Err(err_at(line, format!("'{name}' is an on function and cannot be called")));
        }
        if name.starts_with("helper_") {
            let Some((params, return_type)) = self.helper_sigs.get(name).cloned() else {
                return Err(err_at(line, format!("unknown helper function '{name}'")));
            };
            if args.len() != params.len() {
                return Err(err_at(
                    line,
                    format!(
                        "'{name}' takes {} argument{}, got {}",
                        params.len(),
                        if params.len() == 1 { "" } else { "s" },
                        args.len()
                    ),
                ));
            }
            for (arg, param) in args.iter().zip(&params) {
                if let Some(got) = self.resolve_expr(ast, *arg, Some(param))? {
                    if !got.matches(param) {
                        return Err(err_at(
                            line,
                            format!("'{name}' expects {param} here, got {got}"),
                        ));
                    }
                }
            }
            return Ok(Some(return_type));
        }
        // Game function. Unregistered names resolve dynamically so that
        // scripts loaded before the host finishes registering still work.
        let shape = self.game_fns.shape(name);
        if let Some(shape) = shape {
            if !shape.takes_args() && !args.is_empty() {
                return Err(err_at(line, format!("game function '{name}' takes no arguments")));
            }
        }
        for arg in args {
            self.resolve_expr(ast, *arg, None)?;
        }
        match shape {
            Some(shape) if !shape.returns_value() => Ok(Some(Type::Void)),
            _ => Ok(None),
        }
    }
}
