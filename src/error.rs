use std::path::PathBuf;

use ns_protocol::ProtocolError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::tokenizer::TokenizerError;

/// Everything that can go wrong while serving one command. Every variant is
/// reported to the caller as a single `{"error": ...}` line.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("parse error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unknown command: '{0}'")]
    UnknownCommand(String),

    #[error("missing input: {0}")]
    MissingInput(&'static str),

    #[error("invalid field {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("tokenizer unavailable: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("engine unavailable: no inference backend compiled in")]
    EngineUnavailable,

    #[error("load failed: {}: {source}", .path.display())]
    LoadFailed { path: PathBuf, source: EngineError },

    #[error("inference failed: {0}")]
    Inference(EngineError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServeResult<T> = Result<T, ServeError>;
