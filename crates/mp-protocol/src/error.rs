//! Workspace-wide error enum.
//!
//! A flat set of variants at the crate boundary, with `#[from]` wrapping
//! for the library errors that cross it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("unknown name: {0}")]
    UnknownName(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("reload failed for '{module}': {reason}")]
    ReloadFailure { module: String, reason: String },

    #[error("malformed command graph: {0}")]
    MalformedGraph(String),

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
