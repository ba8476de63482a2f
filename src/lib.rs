pub mod ast;
pub mod backend;
pub mod config;
pub(crate) mod dispatch;
pub mod entity;
pub mod error;
pub mod interp;
pub(crate) mod lexer;
pub mod mods;
pub mod parser;
pub mod printer;
pub mod registry;
pub(crate) mod resolve;
pub mod state;
pub mod value;

pub use ast::{decode, encode, structurally_eq, Ast, MAX_NESTING_DEPTH};
pub use backend::{Backend, BackendFileId, HostCalls};
pub use config::{GrugConfig, DEFAULT_MAX_CALL_DEPTH, DEFAULT_ON_FN_TIME_LIMIT};
pub use entity::EntityId;
pub use error::{
    CompileError, ConfigError, DecodeError, ErrorReport, GrugError, InvokeError, ParseError,
    Result, RuntimeError, RuntimeErrorKind,
};
pub use interp::Interpreter;
pub use mods::{FileError, FileId, ModDir, ModFile};
pub use parser::parse;
pub use printer::print;
pub use registry::{OnFnEntry, OnFnId};
pub use state::Grug;
pub use value::{Value, ValueTag};
