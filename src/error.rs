use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::entity::EntityId;
use crate::mods::FileId;
use crate::registry::OnFnId;

/// Result type for grug operations.
pub type Result<T> = std::result::Result<T, GrugError>;

#[derive(Debug, Error)]
pub enum GrugError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no loaded script for file id {0}")]
    UnknownFile(FileId),

    #[error("script {0} has no working compiled version")]
    FileNotCompiled(FileId),

    #[error("unknown entity handle {0}")]
    UnknownEntity(EntityId),

    #[error("unknown on_fn id {0}")]
    UnknownOnFn(OnFnId),

    #[error("members buffer holds {got} values, script needs {expected}")]
    MembersLen { expected: usize, got: usize },
}

/// Malformed script text. File-scoped and non-fatal: the file keeps serving
/// its previous working compiled version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at {line}:{column}: {message}")]
pub struct ParseError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl ParseError {
    pub fn new(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self { line, column, message: message.into() }
    }
}

/// The backend rejected an AST. File-scoped and non-fatal.
#[derive(Debug, Clone, Error)]
#[error("compile error: {message}")]
pub struct CompileError {
    pub message: String,
    pub line: Option<u32>,
}

/// Raised while script code runs. Reported through the error handler and
/// aborts only the offending call.
#[derive(Debug, Clone, Error)]
#[error("{kind} in {on_fn} ({script}): {reason}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub reason: String,
    pub on_fn: String,
    pub script: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    StackOverflow,
    TimeLimitExceeded,
    GameFnError,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RuntimeErrorKind::StackOverflow => "stack overflow",
            RuntimeErrorKind::TimeLimitExceeded => "time limit exceeded",
            RuntimeErrorKind::GameFnError => "game function error",
        };
        f.write_str(label)
    }
}

/// Runtime failure as a backend reports it; the state fills in the on_fn
/// and script context before it reaches the error channel.
#[derive(Debug, Clone)]
pub struct InvokeError {
    pub kind: RuntimeErrorKind,
    pub reason: String,
}

impl InvokeError {
    pub fn game_fn(reason: impl Into<String>) -> Self {
        Self { kind: RuntimeErrorKind::GameFnError, reason: reason.into() }
    }
}

/// Bad init settings. The only fatal class: `Grug::new` returns no state.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mods folder path is empty")]
    EmptyModsFolder,

    #[error("mods folder '{0}' is not a directory")]
    ModsFolderNotADirectory(PathBuf),

    #[error("game function '{0}' is already registered")]
    DuplicateGameFn(String),
}

/// JSON that does not decode to a well-formed AST.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("expression handle {0} out of range or cyclic")]
    BadExprHandle(u32),

    #[error("statement handle {0} out of range or cyclic")]
    BadStmtHandle(u32),

    #[error("nesting exceeds {} levels", crate::ast::MAX_NESTING_DEPTH)]
    NestingTooDeep,
}

/// Everything delivered through the host's error-channel handler.
#[derive(Debug)]
pub enum ErrorReport {
    Runtime(RuntimeError),
    ScriptDeleted { file: FileId, script: String, entities: Vec<EntityId> },
    Io { path: PathBuf, error: String },
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReport::Runtime(err) => write!(f, "{err}"),
            ErrorReport::ScriptDeleted { file, script, entities } => write!(
                f,
                "script {script} ({file}) was deleted with {} live entit{} referencing it",
                entities.len(),
                if entities.len() == 1 { "y" } else { "ies" },
            ),
            ErrorReport::Io { path, error } => {
                write!(f, "io error under {}: {error}", path.display())
            }
        }
    }
}
