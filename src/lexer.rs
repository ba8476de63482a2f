use std::ops::Range;

use logos::Logos;

use crate::error::ParseError;

/// Newlines terminate statements, so they are tokens rather than skipped
/// whitespace. `\r` is skipped to keep CRLF sources working.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
pub(crate) enum Token {
    #[token("\n")]
    Newline,

    #[regex(r"#[^\n]*", |lex| lex.slice()[1..].to_owned())]
    Comment(String),

    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    BangEq,
    #[token("=")]
    Assign,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_owned())]
    Ident(String),

    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),
}

impl Token {
    /// Short human label for "expected X, found Y" diagnostics.
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Newline => "end of line".into(),
            Token::Comment(_) => "comment".into(),
            Token::Ident(name) => format!("'{name}'"),
            Token::Number(n) => format!("'{n}'"),
            Token::Str(_) => "string literal".into(),
            Token::If => "'if'".into(),
            Token::Else => "'else'".into(),
            Token::While => "'while'".into(),
            Token::Break => "'break'".into(),
            Token::Continue => "'continue'".into(),
            Token::Return => "'return'".into(),
            Token::True => "'true'".into(),
            Token::False => "'false'".into(),
            Token::And => "'and'".into(),
            Token::Or => "'or'".into(),
            Token::Not => "'not'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::LBrace => "'{'".into(),
            Token::RBrace => "'}'".into(),
            Token::Lt => "'<'".into(),
            Token::Le => "'<='".into(),
            Token::Gt => "'>'".into(),
            Token::Ge => "'>='".into(),
            Token::EqEq => "'=='".into(),
            Token::BangEq => "'!='".into(),
            Token::Assign => "'='".into(),
            Token::Colon => "':'".into(),
            Token::Comma => "','".into(),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::Slash => "'/'".into(),
            Token::Percent => "'%'".into(),
        }
    }
}

fn unescape(quoted: &str) -> Option<String> {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            _ => return None,
        }
    }
    Some(out)
}

/// Maps byte offsets to 1-based line and column numbers.
pub(crate) struct LineMap {
    starts: Vec<usize>,
}

impl LineMap {
    pub(crate) fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.char_indices().filter(|(_, c)| *c == '\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    pub(crate) fn location(&self, byte: usize) -> (u32, u32) {
        let line = match self.starts.binary_search(&byte) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let column = byte - self.starts[line];
        (line as u32 + 1, column as u32 + 1)
    }
}

pub(crate) fn lex(source: &str) -> Result<Vec<(Token, Range<usize>)>, ParseError> {
    let lines = LineMap::new(source);
    let mut tokens = Vec::new();
    for (result, span) in Token::lexer(source).spanned() {
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let (line, column) = lines.location(span.start);
                let lexeme = &source[span.clone()];
                return Err(ParseError::new(
                    line,
                    column,
                    format!("unrecognized token '{lexeme}'"),
                ));
            }
        }
    }
    Ok(tokens)
}
