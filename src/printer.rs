use std::fmt::Write;

use crate::ast::{Ast, ExprId, ExprKind, FnArg, StmtId, StmtKind, Type, UnaryOp};

const INDENT: &str = "    ";

/// Renders an AST back to script text in canonical form: four-space
/// indentation, one blank line between top-level items, author comments
/// and blank body lines kept in place. Parsing the output yields a tree
/// structurally equal to the input.
pub fn print(ast: &Ast) -> String {
    let mut out = String::new();
    let mut first = true;
    for member in &ast.members {
        first = false;
        match &member.ty {
            Some(ty) => {
                let _ = write!(out, "{}: {} = ", member.name, type_text(ty));
            }
            None => {
                let _ = write!(out, "{} = ", member.name);
            }
        }
        write_expr(&mut out, ast, member.init);
        out.push('\n');
    }
    for f in &ast.on_functions {
        if !first {
            out.push('\n');
        }
        first = false;
        let _ = write!(out, "{}(", f.name);
        write_args(&mut out, &f.args);
        out.push_str(") {\n");
        write_block(&mut out, ast, &f.body, 1);
        out.push_str("}\n");
    }
    for f in &ast.helper_functions {
        if !first {
            out.push('\n');
        }
        first = false;
        let _ = write!(out, "{}(", f.name);
        write_args(&mut out, &f.args);
        out.push(')');
        if f.return_type != Type::Void {
            let _ = write!(out, " {}", type_text(&f.return_type));
        }
        out.push_str(" {\n");
        write_block(&mut out, ast, &f.body, 1);
        out.push_str("}\n");
    }
    out
}

fn write_args(out: &mut String, args: &[FnArg]) {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}: {}", arg.name, type_text(&arg.ty));
    }
}

fn type_text(ty: &Type) -> String {
    ty.to_string()
}

fn write_block(out: &mut String, ast: &Ast, body: &[StmtId], depth: usize) {
    for id in body {
        write_stmt(out, ast, *id, depth);
    }
}

fn write_stmt(out: &mut String, ast: &Ast, id: StmtId, depth: usize) {
    let stmt = ast.stmt(id);
    if matches!(stmt.kind, StmtKind::Empty) {
        out.push('\n');
        return;
    }
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    match &stmt.kind {
        StmtKind::VariableDecl { name, ty, init, rebind } => {
            match ty {
                Some(ty) if !rebind => {
                    let _ = write!(out, "{name}: {} = ", type_text(ty));
                }
                _ => {
                    let _ = write!(out, "{name} = ");
                }
            }
            write_expr(out, ast, *init);
            out.push('\n');
        }
        StmtKind::Call { expr } => {
            write_expr(out, ast, *expr);
            out.push('\n');
        }
        StmtKind::If { condition, then_body, else_body } => {
            out.push_str("if ");
            write_if(out, ast, *condition, then_body, else_body, depth);
            out.push('\n');
        }
        StmtKind::While { condition, body } => {
            out.push_str("while ");
            write_expr(out, ast, *condition);
            out.push_str(" {\n");
            write_block(out, ast, body, depth + 1);
            for _ in 0..depth {
                out.push_str(INDENT);
            }
            out.push_str("}\n");
        }
        StmtKind::Break => out.push_str("break\n"),
        StmtKind::Continue => out.push_str("continue\n"),
        StmtKind::Return { value } => {
            out.push_str("return");
            if let Some(value) = value {
                out.push(' ');
                write_expr(out, ast, *value);
            }
            out.push('\n');
        }
        StmtKind::Comment { text } => {
            let _ = write!(out, "#{text}");
            out.push('\n');
        }
        StmtKind::Empty => unreachable!("handled above"),
    }
}

/// The condition-and-body part of an `if`, shared by the head of a chain
/// and every `else if` link. Leaves the final `}` or `{`-block unclosed by
/// a newline so the caller decides the terminator.
fn write_if(
    out: &mut String,
    ast: &Ast,
    condition: ExprId,
    then_body: &[StmtId],
    else_body: &[StmtId],
    depth: usize,
) {
    write_expr(out, ast, condition);
    out.push_str(" {\n");
    write_block(out, ast, then_body, depth + 1);
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push('}');
    if else_body.is_empty() {
        return;
    }
    if let [single] = else_body {
        if let StmtKind::If { condition, then_body, else_body } = &ast.stmt(*single).kind {
            out.push_str(" else if ");
            write_if(out, ast, *condition, then_body, else_body, depth);
            return;
        }
    }
    out.push_str(" else {\n");
    write_block(out, ast, else_body, depth + 1);
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push('}');
}

fn write_expr(out: &mut String, ast: &Ast, id: ExprId) {
    match &ast.expr(id).kind {
        ExprKind::True => out.push_str("true"),
        ExprKind::False => out.push_str("false"),
        ExprKind::Number { value } => {
            let _ = write!(out, "{value}");
        }
        ExprKind::String { value } | ExprKind::Resource { path: value } | ExprKind::Entity { name: value } => {
            write_quoted(out, value);
        }
        ExprKind::Identifier { name } => out.push_str(name),
        ExprKind::Unary { op, operand } => {
            match op {
                UnaryOp::Neg => out.push('-'),
                UnaryOp::Not => out.push_str("not "),
            }
            write_expr(out, ast, *operand);
        }
        ExprKind::Binary { op, left, right } => {
            write_expr(out, ast, *left);
            let _ = write!(out, " {} ", op.symbol());
            write_expr(out, ast, *right);
        }
        ExprKind::Call { name, args } => {
            let _ = write!(out, "{name}(");
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_expr(out, ast, *arg);
            }
            out.push(')');
        }
        ExprKind::Parenthesized { inner } => {
            out.push('(');
            write_expr(out, ast, *inner);
            out.push(')');
        }
    }
}

fn write_quoted(out: &mut String, text: &str) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
}
