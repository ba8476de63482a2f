use std::ops::Range;

use crate::ast::{
    Ast, BinaryOp, Expr, ExprId, ExprKind, FnArg, HelperFunction, MemberVariable, OnFunction,
    Statement, StmtId, StmtKind, Type, UnaryOp, MAX_NESTING_DEPTH,
};
use crate::error::ParseError;
use crate::lexer::{lex, LineMap, Token};

/// Parses one script. Deterministic: the same text always yields the same
/// tree, and a failed parse yields no tree at all. Nesting past
/// [`MAX_NESTING_DEPTH`] levels is a parse error.
pub fn parse(source: &str) -> Result<Ast, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser {
        stream: TokenStream { tokens, pos: 0, lines: LineMap::new(source), end: source.len() },
        ast: Ast::default(),
        depth: 0,
    };
    parser.parse_script()?;
    // The descent guard bounds recursion while parsing, but flat operator
    // chains build left-deep trees without recursing, so the finished arenas
    // get the same depth check decoded trees do.
    if let Some(line) = parser.ast.nesting_violation() {
        let message = format!("nesting exceeds {MAX_NESTING_DEPTH} levels");
        return Err(ParseError::new(line, 1, message));
    }
    Ok(parser.ast)
}

struct TokenStream {
    tokens: Vec<(Token, Range<usize>)>,
    pos: usize,
    lines: LineMap,
    end: usize,
}

impl TokenStream {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn location(&self) -> (u32, u32) {
        let byte = match self.tokens.get(self.pos) {
            Some((_, span)) => span.start,
            None => self.end,
        };
        self.lines.location(byte)
    }

    fn line(&self) -> u32 {
        self.location().0
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let (line, column) = self.location();
        ParseError::new(line, column, message)
    }

    fn found(&self) -> String {
        match self.peek() {
            Some(token) => token.describe(),
            None => "end of file".into(),
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ParseError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {}", self.found())))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::Ident(_)) => match self.next() {
                Some(Token::Ident(name)) => Ok(name),
                _ => unreachable!("peeked an identifier"),
            },
            _ => Err(self.error(format!("expected {what}, found {}", self.found()))),
        }
    }
}

struct Parser {
    stream: TokenStream,
    ast: Ast,
    depth: usize,
}

impl Parser {
    fn parse_script(&mut self) -> Result<(), ParseError> {
        loop {
            // Blank lines and comments between top-level items carry no
            // structure and are dropped.
            while matches!(self.stream.peek(), Some(Token::Newline | Token::Comment(_))) {
                self.stream.next();
            }
            if self.stream.at_end() {
                return Ok(());
            }
            let (line, column) = self.stream.location();
            let name = self.stream.expect_ident("a member variable or function name")?;
            match self.stream.peek() {
                Some(Token::LParen) => self.parse_function(name, line, column)?,
                Some(Token::Colon | Token::Assign) => self.parse_member(name, line)?,
                _ => {
                    return Err(self.stream.error(format!(
                        "expected '(', ':' or '=' after '{name}', found {}",
                        self.stream.found()
                    )))
                }
            }
        }
    }

    fn parse_member(&mut self, name: String, line: u32) -> Result<(), ParseError> {
        let ty = if self.stream.eat(&Token::Colon) { Some(self.parse_type()?) } else { None };
        self.stream.expect(&Token::Assign, "'='")?;
        let init = self.parse_expr()?;
        self.end_of_line()?;
        self.ast.members.push(MemberVariable { name, ty, init, line });
        Ok(())
    }

    fn parse_function(&mut self, name: String, line: u32, column: u32) -> Result<(), ParseError> {
        let is_on = name.starts_with("on_");
        let is_helper = name.starts_with("helper_");
        if !is_on && !is_helper {
            return Err(ParseError::new(
                line,
                column,
                format!("function '{name}' must be named on_* or helper_*"),
            ));
        }
        let args = self.parse_params()?;
        let return_type = if matches!(self.stream.peek(), Some(Token::Ident(_))) {
            if is_on {
                return Err(self
                    .stream
                    .error(format!("on function '{name}' cannot declare a return type")));
            }
            self.parse_type()?
        } else {
            Type::Void
        };
        let body = self.parse_block()?;
        self.end_of_line()?;
        if is_on {
            self.ast.on_functions.push(OnFunction { name, args, body, line });
        } else {
            self.ast.helper_functions.push(HelperFunction { name, args, return_type, body, line });
        }
        Ok(())
    }

    fn parse_params(&mut self) -> Result<Vec<FnArg>, ParseError> {
        self.stream.expect(&Token::LParen, "'('")?;
        let mut args = Vec::new();
        if self.stream.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            let line = self.stream.line();
            let name = self.stream.expect_ident("an argument name")?;
            self.stream.expect(&Token::Colon, "':' before the argument type")?;
            let ty = self.parse_type()?;
            args.push(FnArg { name, ty, line });
            if !self.stream.eat(&Token::Comma) {
                self.stream.expect(&Token::RParen, "')' or ','")?;
                return Ok(args);
            }
        }
    }

    fn parse_type(&mut self) -> Result<Type, ParseError> {
        let base = self.stream.expect_ident("a type name")?;
        match base.as_str() {
            "bool" => Ok(Type::Bool),
            "number" => Ok(Type::Number),
            "string" => Ok(Type::String),
            "id" => Ok(Type::Id { entity_type: self.parse_name_qualifier()? }),
            "entity" => Ok(Type::Entity { entity_type: self.parse_name_qualifier()? }),
            "resource" => {
                let extension = if self.stream.eat(&Token::Lt) {
                    match self.stream.next() {
                        Some(Token::Str(ext)) => {
                            self.stream.expect(&Token::Gt, "'>'")?;
                            Some(ext)
                        }
                        _ => {
                            return Err(self
                                .stream
                                .error("expected an extension string inside 'resource<>'"))
                        }
                    }
                } else {
                    None
                };
                Ok(Type::Resource { extension })
            }
            _ => Err(self.stream.error(format!("unknown type '{base}'"))),
        }
    }

    fn parse_name_qualifier(&mut self) -> Result<Option<String>, ParseError> {
        if !self.stream.eat(&Token::Lt) {
            return Ok(None);
        }
        let name = self.stream.expect_ident("an entity type inside '<>'")?;
        self.stream.expect(&Token::Gt, "'>'")?;
        Ok(Some(name))
    }

    // Recursion guard for nested expressions and blocks. Left unwound on
    // error paths: a failed parse abandons the whole parser.
    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.stream.error(format!("nesting exceeds {MAX_NESTING_DEPTH} levels")));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// A `{ ... }` body. Statements normally end at a newline, but a block
    /// may also sit on a single line, in which case `}` ends the last
    /// statement. Extra blank lines become explicit empty statements so the
    /// printer can reproduce them.
    fn parse_block(&mut self) -> Result<Vec<StmtId>, ParseError> {
        self.enter()?;
        self.stream.expect(&Token::LBrace, "'{'")?;
        self.stream.eat(&Token::Newline);
        let mut body = Vec::new();
        loop {
            while self.stream.peek() == Some(&Token::Newline) {
                let line = self.stream.line();
                self.stream.next();
                body.push(self.ast.push_stmt(Statement { kind: StmtKind::Empty, line }));
            }
            if self.stream.eat(&Token::RBrace) {
                self.leave();
                return Ok(body);
            }
            if self.stream.at_end() {
                return Err(self.stream.error("expected '}' before end of file"));
            }
            let stmt = self.parse_statement()?;
            body.push(stmt);
        }
    }

    fn parse_statement(&mut self) -> Result<StmtId, ParseError> {
        let line = self.stream.line();
        let kind = match self.stream.peek() {
            Some(Token::Comment(_)) => match self.stream.next() {
                Some(Token::Comment(text)) => StmtKind::Comment { text },
                _ => unreachable!("peeked a comment"),
            },
            Some(Token::If) => {
                let id = self.parse_if()?;
                self.end_of_statement()?;
                return Ok(id);
            }
            Some(Token::While) => {
                self.stream.next();
                let condition = self.parse_expr()?;
                let body = self.parse_block()?;
                StmtKind::While { condition, body }
            }
            Some(Token::Break) => {
                self.stream.next();
                StmtKind::Break
            }
            Some(Token::Continue) => {
                self.stream.next();
                StmtKind::Continue
            }
            Some(Token::Return) => {
                self.stream.next();
                let value = match self.stream.peek() {
                    Some(Token::Newline | Token::RBrace) | None => None,
                    _ => Some(self.parse_expr()?),
                };
                StmtKind::Return { value }
            }
            Some(Token::Ident(_)) => {
                if self.stream.peek_nth(1) == Some(&Token::LParen) {
                    let expr = self.parse_expr()?;
                    StmtKind::Call { expr }
                } else {
                    let name = self.stream.expect_ident("a variable name")?;
                    let ty = if self.stream.eat(&Token::Colon) {
                        Some(self.parse_type()?)
                    } else {
                        None
                    };
                    self.stream.expect(&Token::Assign, "'='")?;
                    let init = self.parse_expr()?;
                    StmtKind::VariableDecl { name, ty, init, rebind: false }
                }
            }
            _ => {
                return Err(self
                    .stream
                    .error(format!("expected a statement, found {}", self.stream.found())))
            }
        };
        self.end_of_statement()?;
        Ok(self.ast.push_stmt(Statement { kind, line }))
    }

    /// `if` with its full `else if` chain; does not consume the trailing
    /// newline so the chain terminates as one statement.
    fn parse_if(&mut self) -> Result<StmtId, ParseError> {
        let mut branches = Vec::new();
        let mut else_body = Vec::new();
        loop {
            let line = self.stream.line();
            self.stream.expect(&Token::If, "'if'")?;
            let condition = self.parse_expr()?;
            let then_body = self.parse_block()?;
            branches.push((condition, then_body, line));
            if !self.stream.eat(&Token::Else) {
                break;
            }
            if self.stream.peek() != Some(&Token::If) {
                else_body = self.parse_block()?;
                break;
            }
        }
        // Folded right to left: each branch becomes the single statement of
        // the previous branch's else body.
        let mut chain = None;
        for (condition, then_body, line) in branches.into_iter().rev() {
            let id = self.ast.push_stmt(Statement {
                kind: StmtKind::If { condition, then_body, else_body },
                line,
            });
            else_body = vec![id];
            chain = Some(id);
        }
        Ok(chain.expect("an if chain has at least one branch"))
    }

    /// Statements inside a block end at a newline or just before the
    /// closing brace of a single-line block.
    fn end_of_statement(&mut self) -> Result<(), ParseError> {
        match self.stream.peek() {
            Some(Token::Newline) => {
                self.stream.next();
                Ok(())
            }
            Some(Token::RBrace) | None => Ok(()),
            _ => Err(self
                .stream
                .error(format!("expected end of line, found {}", self.stream.found()))),
        }
    }

    /// Top-level items must end at a newline or the end of the file.
    fn end_of_line(&mut self) -> Result<(), ParseError> {
        match self.stream.peek() {
            Some(Token::Newline) => {
                self.stream.next();
                Ok(())
            }
            None => Ok(()),
            _ => Err(self
                .stream
                .error(format!("expected end of line, found {}", self.stream.found()))),
        }
    }

    fn parse_expr(&mut self) -> Result<ExprId, ParseError> {
        self.enter()?;
        let id = self.parse_binary(0)?;
        self.leave();
        Ok(id)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<ExprId, ParseError> {
        let mut left = self.parse_unary()?;
        while let Some((precedence, op)) = self.stream.peek().and_then(binary_op_info) {
            if precedence < min_precedence {
                break;
            }
            self.stream.next();
            let right = self.parse_binary(precedence + 1)?;
            let line = self.ast.expr(left).line;
            left = self.ast.push_expr(Expr {
                kind: ExprKind::Binary { op, left, right },
                line,
                result_type: None,
            });
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<ExprId, ParseError> {
        // Prefix operators stack without recursing: collected first, then
        // wrapped around the operand innermost-out.
        let mut ops = Vec::new();
        loop {
            let op = match self.stream.peek() {
                Some(Token::Minus) => UnaryOp::Neg,
                Some(Token::Not) => UnaryOp::Not,
                _ => break,
            };
            ops.push((op, self.stream.line()));
            self.stream.next();
        }
        let mut operand = self.parse_primary()?;
        for (op, line) in ops.into_iter().rev() {
            operand = self.ast.push_expr(Expr {
                kind: ExprKind::Unary { op, operand },
                line,
                result_type: None,
            });
        }
        Ok(operand)
    }

    fn parse_primary(&mut self) -> Result<ExprId, ParseError> {
        let line = self.stream.line();
        let kind = match self.stream.peek() {
            Some(Token::True) => {
                self.stream.next();
                ExprKind::True
            }
            Some(Token::False) => {
                self.stream.next();
                ExprKind::False
            }
            Some(Token::Number(_)) => match self.stream.next() {
                Some(Token::Number(value)) => ExprKind::Number { value },
                _ => unreachable!("peeked a number"),
            },
            Some(Token::Str(_)) => match self.stream.next() {
                Some(Token::Str(value)) => ExprKind::String { value },
                _ => unreachable!("peeked a string"),
            },
            Some(Token::Ident(_)) => {
                let name = self.stream.expect_ident("an expression")?;
                if self.stream.eat(&Token::LParen) {
                    let args = self.parse_call_args()?;
                    ExprKind::Call { name, args }
                } else {
                    ExprKind::Identifier { name }
                }
            }
            Some(Token::LParen) => {
                self.stream.next();
                let inner = self.parse_expr()?;
                self.stream.expect(&Token::RParen, "')'")?;
                ExprKind::Parenthesized { inner }
            }
            _ => {
                return Err(self
                    .stream
                    .error(format!("expected an expression, found {}", self.stream.found())))
            }
        };
        Ok(self.ast.push_expr(Expr { kind, line, result_type: None }))
    }

    fn parse_call_args(&mut self) -> Result<Vec<ExprId>, ParseError> {
        let mut args = Vec::new();
        if self.stream.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if !self.stream.eat(&Token::Comma) {
                self.stream.expect(&Token::RParen, "')' or ','")?;
                return Ok(args);
            }
        }
    }
}

/// Binding power and AST operator for infix tokens. All binary operators
/// associate left.
fn binary_op_info(token: &Token) -> Option<(u8, BinaryOp)> {
    let info = match token {
        Token::Or => (10, BinaryOp::Or),
        Token::And => (20, BinaryOp::And),
        Token::EqEq => (30, BinaryOp::Eq),
        Token::BangEq => (30, BinaryOp::Ne),
        Token::Lt => (40, BinaryOp::Lt),
        Token::Le => (40, BinaryOp::Le),
        Token::Gt => (40, BinaryOp::Gt),
        Token::Ge => (40, BinaryOp::Ge),
        Token::Plus => (50, BinaryOp::Add),
        Token::Minus => (50, BinaryOp::Sub),
        Token::Star => (60, BinaryOp::Mul),
        Token::Slash => (60, BinaryOp::Div),
        Token::Percent => (60, BinaryOp::Rem),
        _ => return None,
    };
    Some(info)
}
