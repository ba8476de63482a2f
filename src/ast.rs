use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::value::{Value, ValueTag};

/// Handle into [`Ast::exprs`]. Handles are minted in construction order, so
/// every child handle is strictly smaller than its parent's. Teardown of an
/// arbitrarily deep script is two `Vec` drops, never a recursive walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprId(pub(crate) u32);

/// Handle into [`Ast::stmts`]. Same ordering invariant as [`ExprId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StmtId(pub(crate) u32);

/// Deepest nesting a tree may carry, counting both expression and statement
/// levels along one root-to-leaf path. [`crate::parse`] and [`decode`] reject
/// anything deeper, so every walk over an accepted tree runs in bounded
/// stack.
pub const MAX_NESTING_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Type {
    Void,
    Bool,
    Number,
    String,
    /// Opaque host handle, optionally narrowed to one entity type.
    Id {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_type: Option<String>,
    },
    /// Mods-relative asset path, optionally restricted by extension.
    Resource {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extension: Option<String>,
    },
    /// Reference to another script file by its mods-relative path.
    Entity {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_type: Option<String>,
    },
}

impl Type {
    /// The wire tag values of this type carry across the boundary.
    /// `Void` carries nothing.
    pub fn value_tag(&self) -> Option<ValueTag> {
        match self {
            Type::Void => None,
            Type::Bool => Some(ValueTag::Bool),
            Type::Number => Some(ValueTag::Number),
            Type::String => Some(ValueTag::String),
            Type::Id { .. } => Some(ValueTag::Id),
            Type::Resource { .. } | Type::Entity { .. } => Some(ValueTag::String),
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            Type::Void | Type::Number => Value::Number(0.0),
            Type::Bool => Value::Bool(false),
            Type::String | Type::Resource { .. } | Type::Entity { .. } => {
                Value::String(String::new())
            }
            Type::Id { .. } => Value::Id(0),
        }
    }

    /// True when both sides name the same base type, ignoring qualifiers.
    pub(crate) fn matches(&self, other: &Type) -> bool {
        use Type::*;
        matches!(
            (self, other),
            (Void, Void)
                | (Bool, Bool)
                | (Number, Number)
                | (String, String)
                | (Id { .. }, Id { .. })
                | (Resource { .. }, Resource { .. })
                | (Entity { .. }, Entity { .. })
        )
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Bool => f.write_str("bool"),
            Type::Number => f.write_str("number"),
            Type::String => f.write_str("string"),
            Type::Id { entity_type: None } => f.write_str("id"),
            Type::Id { entity_type: Some(t) } => write!(f, "id<{t}>"),
            Type::Resource { extension: None } => f.write_str("resource"),
            Type::Resource { extension: Some(e) } => write!(f, "resource<{e:?}>"),
            Type::Entity { entity_type: None } => f.write_str("entity"),
            Type::Entity { entity_type: Some(t) } => write!(f, "entity<{t}>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum ExprKind {
    True,
    False,
    Number { value: f64 },
    String { value: String },
    /// String literal reclassified by the resolver because its declared
    /// type is a resource. The path is mods-relative.
    Resource { path: String },
    /// String literal reclassified to a script-file reference.
    Entity { name: String },
    Identifier { name: String },
    Unary { op: UnaryOp, operand: ExprId },
    Binary { op: BinaryOp, left: ExprId, right: ExprId },
    Call { name: String, args: Vec<ExprId> },
    Parenthesized { inner: ExprId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    #[serde(flatten)]
    pub kind: ExprKind,
    pub line: u32,
    /// Filled by the resolver, `None` on a freshly parsed tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_type: Option<Type>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stmt", rename_all = "snake_case")]
pub enum StmtKind {
    VariableDecl {
        name: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        ty: Option<Type>,
        init: ExprId,
        /// Set by the resolver when `name` was already bound: the statement
        /// assigns instead of declaring.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        rebind: bool,
    },
    Call {
        expr: ExprId,
    },
    If {
        condition: ExprId,
        then_body: Vec<StmtId>,
        /// An `else if` chain nests as an else body holding a single `If`.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        else_body: Vec<StmtId>,
    },
    While {
        condition: ExprId,
        body: Vec<StmtId>,
    },
    Break,
    Continue,
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<ExprId>,
    },
    Comment {
        text: String,
    },
    /// A blank line inside a function body, kept so printing preserves the
    /// author's vertical spacing.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(flatten)]
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberVariable {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<Type>,
    pub init: ExprId,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnArg {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnFunction {
    pub name: String,
    pub args: Vec<FnArg>,
    pub body: Vec<StmtId>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperFunction {
    pub name: String,
    pub args: Vec<FnArg>,
    pub return_type: Type,
    pub body: Vec<StmtId>,
    pub line: u32,
}

/// One parsed script. Expressions and statements live in two flat arenas
/// and reference each other by index, so the whole tree serializes without
/// pointer chasing and drops without recursion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ast {
    pub members: Vec<MemberVariable>,
    pub on_functions: Vec<OnFunction>,
    pub helper_functions: Vec<HelperFunction>,
    exprs: Vec<Expr>,
    stmts: Vec<Statement>,
}

impl Ast {
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Statement {
        &self.stmts[id.0 as usize]
    }

    pub(crate) fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id.0 as usize]
    }

    pub(crate) fn stmt_mut(&mut self, id: StmtId) -> &mut Statement {
        &mut self.stmts[id.0 as usize]
    }

    pub(crate) fn push_expr(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(expr);
        id
    }

    pub(crate) fn push_stmt(&mut self, stmt: Statement) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(stmt);
        id
    }

    pub fn on_function(&self, name: &str) -> Option<&OnFunction> {
        self.on_functions.iter().find(|f| f.name == name)
    }

    pub fn helper_function(&self, name: &str) -> Option<&HelperFunction> {
        self.helper_functions.iter().find(|f| f.name == name)
    }

    /// The type a member holds: its declaration if written, otherwise the
    /// resolved type of its initializer.
    pub fn member_type(&self, index: usize) -> Option<&Type> {
        let member = self.members.get(index)?;
        member.ty.as_ref().or_else(|| self.expr(member.init).result_type.as_ref())
    }

    /// Checks that every handle is in range, that children precede parents
    /// (which rules out cycles in decoded trees), and that no node sits
    /// deeper than [`MAX_NESTING_DEPTH`].
    fn validate(&self) -> std::result::Result<(), DecodeError> {
        let expr_before = |id: ExprId, limit: u32| {
            if id.0 < limit {
                Ok(())
            } else {
                Err(DecodeError::BadExprHandle(id.0))
            }
        };
        let stmt_before = |id: StmtId, limit: u32| {
            if id.0 < limit {
                Ok(())
            } else {
                Err(DecodeError::BadStmtHandle(id.0))
            }
        };
        let n_exprs = self.exprs.len() as u32;
        let n_stmts = self.stmts.len() as u32;

        for (i, expr) in self.exprs.iter().enumerate() {
            let i = i as u32;
            match &expr.kind {
                ExprKind::Unary { operand, .. } => expr_before(*operand, i)?,
                ExprKind::Binary { left, right, .. } => {
                    expr_before(*left, i)?;
                    expr_before(*right, i)?;
                }
                ExprKind::Call { args, .. } => {
                    for arg in args {
                        expr_before(*arg, i)?;
                    }
                }
                ExprKind::Parenthesized { inner } => expr_before(*inner, i)?,
                _ => {}
            }
        }
        for (i, stmt) in self.stmts.iter().enumerate() {
            let i = i as u32;
            match &stmt.kind {
                StmtKind::VariableDecl { init, .. } => expr_before(*init, n_exprs)?,
                StmtKind::Call { expr } => expr_before(*expr, n_exprs)?,
                StmtKind::If { condition, then_body, else_body } => {
                    expr_before(*condition, n_exprs)?;
                    for s in then_body.iter().chain(else_body) {
                        stmt_before(*s, i)?;
                    }
                }
                StmtKind::While { condition, body } => {
                    expr_before(*condition, n_exprs)?;
                    for s in body {
                        stmt_before(*s, i)?;
                    }
                }
                StmtKind::Return { value: Some(v) } => expr_before(*v, n_exprs)?,
                _ => {}
            }
        }
        for member in &self.members {
            expr_before(member.init, n_exprs)?;
        }
        for body in self
            .on_functions
            .iter()
            .map(|f| &f.body)
            .chain(self.helper_functions.iter().map(|f| &f.body))
        {
            for s in body {
                stmt_before(*s, n_stmts)?;
            }
        }
        if self.nesting_violation().is_some() {
            return Err(DecodeError::NestingTooDeep);
        }
        Ok(())
    }

    /// Line of the first node nested deeper than [`MAX_NESTING_DEPTH`], if
    /// any. Children precede parents in the arenas, so one forward pass per
    /// arena computes every depth without recursing; a statement counts the
    /// expressions it references as nested under it.
    pub(crate) fn nesting_violation(&self) -> Option<u32> {
        let cap = MAX_NESTING_DEPTH as u32;
        let mut expr_depth = vec![0u32; self.exprs.len()];
        for (i, expr) in self.exprs.iter().enumerate() {
            let at = |id: &ExprId| expr_depth[id.0 as usize];
            let depth = 1 + match &expr.kind {
                ExprKind::Unary { operand, .. } => at(operand),
                ExprKind::Binary { left, right, .. } => at(left).max(at(right)),
                ExprKind::Call { args, .. } => args.iter().map(at).max().unwrap_or(0),
                ExprKind::Parenthesized { inner } => at(inner),
                _ => 0,
            };
            if depth > cap {
                return Some(expr.line);
            }
            expr_depth[i] = depth;
        }
        let block = |depths: &[u32], body: &[StmtId]| {
            body.iter().map(|s| depths[s.0 as usize]).max().unwrap_or(0)
        };
        let mut stmt_depth = vec![0u32; self.stmts.len()];
        for (i, stmt) in self.stmts.iter().enumerate() {
            let at = |id: &ExprId| expr_depth[id.0 as usize];
            let depth = 1 + match &stmt.kind {
                StmtKind::VariableDecl { init, .. } => at(init),
                StmtKind::Call { expr } => at(expr),
                StmtKind::If { condition, then_body, else_body } => at(condition)
                    .max(block(&stmt_depth, then_body))
                    .max(block(&stmt_depth, else_body)),
                StmtKind::While { condition, body } => {
                    at(condition).max(block(&stmt_depth, body))
                }
                StmtKind::Return { value: Some(v) } => at(v),
                _ => 0,
            };
            if depth > cap {
                return Some(stmt.line);
            }
            stmt_depth[i] = depth;
        }
        None
    }
}

/// Serializes an AST to JSON. Fails only on non-finite number literals,
/// which the parser never produces.
pub fn encode(ast: &Ast) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string(ast)
}

/// Deserializes an AST from JSON produced by [`encode`] or by an external
/// tool. Handles are bounds- and order-checked so a hostile document cannot
/// make later traversals panic or loop.
pub fn decode(json: &str) -> std::result::Result<Ast, DecodeError> {
    let ast: Ast = serde_json::from_str(json)?;
    ast.validate()?;
    Ok(ast)
}

/// Structural equality over everything the script author wrote: names,
/// declared types, operators, literals, comments and blank lines. Ignores
/// line numbers, resolver output and arena layout, so a tree survives a
/// print-and-reparse trip even though its handles are renumbered. A string
/// literal the resolver reclassified as a resource or entity reference
/// still compares equal to the plain string it was written as.
pub fn structurally_eq(a: &Ast, b: &Ast) -> bool {
    fn literal_text(kind: &ExprKind) -> Option<&str> {
        match kind {
            ExprKind::String { value } => Some(value),
            ExprKind::Resource { path } => Some(path),
            ExprKind::Entity { name } => Some(name),
            _ => None,
        }
    }

    fn expr_eq(a: &Ast, ai: ExprId, b: &Ast, bi: ExprId) -> bool {
        let (ak, bk) = (&a.expr(ai).kind, &b.expr(bi).kind);
        if let (Some(x), Some(y)) = (literal_text(ak), literal_text(bk)) {
            return x == y;
        }
        match (ak, bk) {
            (ExprKind::True, ExprKind::True) | (ExprKind::False, ExprKind::False) => true,
            (ExprKind::Number { value: x }, ExprKind::Number { value: y }) => x == y,
            (ExprKind::Identifier { name: x }, ExprKind::Identifier { name: y }) => x == y,
            (
                ExprKind::Unary { op: xo, operand: xi },
                ExprKind::Unary { op: yo, operand: yi },
            ) => xo == yo && expr_eq(a, *xi, b, *yi),
            (
                ExprKind::Binary { op: xo, left: xl, right: xr },
                ExprKind::Binary { op: yo, left: yl, right: yr },
            ) => xo == yo && expr_eq(a, *xl, b, *yl) && expr_eq(a, *xr, b, *yr),
            (
                ExprKind::Call { name: xn, args: xa },
                ExprKind::Call { name: yn, args: ya },
            ) => {
                xn == yn
                    && xa.len() == ya.len()
                    && xa.iter().zip(ya).all(|(x, y)| expr_eq(a, *x, b, *y))
            }
            (ExprKind::Parenthesized { inner: xi }, ExprKind::Parenthesized { inner: yi }) => {
                expr_eq(a, *xi, b, *yi)
            }
            _ => false,
        }
    }

    fn block_eq(a: &Ast, xs: &[StmtId], b: &Ast, ys: &[StmtId]) -> bool {
        xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| stmt_eq(a, *x, b, *y))
    }

    fn stmt_eq(a: &Ast, ai: StmtId, b: &Ast, bi: StmtId) -> bool {
        match (&a.stmt(ai).kind, &b.stmt(bi).kind) {
            (
                StmtKind::VariableDecl { name: xn, ty: xt, init: xi, .. },
                StmtKind::VariableDecl { name: yn, ty: yt, init: yi, .. },
            ) => xn == yn && xt == yt && expr_eq(a, *xi, b, *yi),
            (StmtKind::Call { expr: x }, StmtKind::Call { expr: y }) => expr_eq(a, *x, b, *y),
            (
                StmtKind::If { condition: xc, then_body: xt, else_body: xe },
                StmtKind::If { condition: yc, then_body: yt, else_body: ye },
            ) => {
                expr_eq(a, *xc, b, *yc) && block_eq(a, xt, b, yt) && block_eq(a, xe, b, ye)
            }
            (
                StmtKind::While { condition: xc, body: xb },
                StmtKind::While { condition: yc, body: yb },
            ) => expr_eq(a, *xc, b, *yc) && block_eq(a, xb, b, yb),
            (StmtKind::Break, StmtKind::Break) => true,
            (StmtKind::Continue, StmtKind::Continue) => true,
            (StmtKind::Return { value: None }, StmtKind::Return { value: None }) => true,
            (StmtKind::Return { value: Some(x) }, StmtKind::Return { value: Some(y) }) => {
                expr_eq(a, *x, b, *y)
            }
            (StmtKind::Comment { text: x }, StmtKind::Comment { text: y }) => x == y,
            (StmtKind::Empty, StmtKind::Empty) => true,
            _ => false,
        }
    }

    fn args_eq(xs: &[FnArg], ys: &[FnArg]) -> bool {
        xs.len() == ys.len()
            && xs.iter().zip(ys).all(|(x, y)| x.name == y.name && x.ty == y.ty)
    }

    a.members.len() == b.members.len()
        && a.members.iter().zip(&b.members).all(|(x, y)| {
            x.name == y.name && x.ty == y.ty && expr_eq(a, x.init, b, y.init)
        })
        && a.on_functions.len() == b.on_functions.len()
        && a.on_functions.iter().zip(&b.on_functions).all(|(x, y)| {
            x.name == y.name && args_eq(&x.args, &y.args) && block_eq(a, &x.body, b, &y.body)
        })
        && a.helper_functions.len() == b.helper_functions.len()
        && a.helper_functions.iter().zip(&b.helper_functions).all(|(x, y)| {
            x.name == y.name
                && args_eq(&x.args, &y.args)
                && x.return_type == y.return_type
                && block_eq(a, &x.body, b, &y.body)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ast() -> Ast {
        let mut ast = Ast::default();
        let lit = ast.push_expr(Expr {
            kind: ExprKind::Resource { path: "sounds/bark.wav".into() },
            line: 1,
            result_type: Some(Type::Resource { extension: Some(".wav".into()) }),
        });
        ast.members.push(MemberVariable {
            name: "bark_sound".into(),
            ty: Some(Type::Resource { extension: Some(".wav".into()) }),
            init: lit,
            line: 1,
        });
        let cond = ast.push_expr(Expr {
            kind: ExprKind::True,
            line: 3,
            result_type: Some(Type::Bool),
        });
        let ret = ast.push_stmt(Statement { kind: StmtKind::Return { value: None }, line: 4 });
        let guard = ast.push_stmt(Statement {
            kind: StmtKind::If { condition: cond, then_body: vec![ret], else_body: vec![] },
            line: 3,
        });
        ast.on_functions.push(OnFunction {
            name: "on_spawn".into(),
            args: vec![],
            body: vec![guard],
            line: 2,
        });
        ast
    }

    #[test]
    fn encode_decode_preserves_resolved_tree_exactly() {
        let ast = sample_ast();
        let json = encode(&ast).expect("encode");
        let back = decode(&json).expect("decode");
        assert_eq!(back, ast);
    }

    #[test]
    fn decode_rejects_out_of_range_handle() {
        let mut ast = sample_ast();
        ast.members[0].init = ExprId(999);
        let json = encode(&ast).expect("encode");
        let err = decode(&json).expect_err("bad handle must not decode");
        assert!(matches!(err, DecodeError::BadExprHandle(999)));
    }

    #[test]
    fn decode_rejects_cyclic_handles() {
        // A parenthesized expression pointing at itself.
        let mut ast = Ast::default();
        let id = ast.push_expr(Expr {
            kind: ExprKind::Parenthesized { inner: ExprId(0) },
            line: 1,
            result_type: None,
        });
        ast.members.push(MemberVariable { name: "x".into(), ty: None, init: id, line: 1 });
        let json = encode(&ast).expect("encode");
        assert!(decode(&json).is_err());
    }

    #[test]
    fn decode_rejects_nesting_past_the_cap() {
        let mut ast = Ast::default();
        let mut id = ast.push_expr(Expr {
            kind: ExprKind::Number { value: 1.0 },
            line: 1,
            result_type: None,
        });
        for _ in 0..MAX_NESTING_DEPTH {
            id = ast.push_expr(Expr {
                kind: ExprKind::Parenthesized { inner: id },
                line: 1,
                result_type: None,
            });
        }
        ast.members.push(MemberVariable { name: "x".into(), ty: None, init: id, line: 1 });
        let json = encode(&ast).expect("encode");
        let err = decode(&json).expect_err("too deep to decode");
        assert!(matches!(err, DecodeError::NestingTooDeep), "got: {err:?}");

        // One paren fewer sits exactly at the cap and decodes.
        let mut ast = Ast::default();
        let mut id = ast.push_expr(Expr {
            kind: ExprKind::Number { value: 1.0 },
            line: 1,
            result_type: None,
        });
        for _ in 0..MAX_NESTING_DEPTH - 1 {
            id = ast.push_expr(Expr {
                kind: ExprKind::Parenthesized { inner: id },
                line: 1,
                result_type: None,
            });
        }
        ast.members.push(MemberVariable { name: "x".into(), ty: None, init: id, line: 1 });
        let json = encode(&ast).expect("encode");
        decode(&json).expect("tree at the cap must decode");
    }

    #[test]
    fn structural_equality_ignores_lines_and_resolution() {
        let resolved = sample_ast();
        let mut bare = resolved.clone();
        for i in 0..bare.exprs.len() {
            bare.exprs[i].result_type = None;
            bare.exprs[i].line += 7;
        }
        assert_ne!(bare, resolved);
        assert!(structurally_eq(&bare, &resolved));
    }
}
