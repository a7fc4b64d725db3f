//! Error taxonomy for the block session engine.

use thiserror::Error;

/// Errors produced by the core engine.
///
/// Invariant violations (`ParseInvariantViolation`) are fatal to the session that
/// raised them but never propagate across session boundaries.
#[derive(Debug, Error)]
pub enum KmuxError {
    #[error("operation not valid while session is {status}: {detail}")]
    InvalidOperation { status: String, detail: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no root password configured for this session")]
    MissingPrivilege,

    #[error("tool call timed out after {timeout_seconds:.2}s; underlying state is unknown")]
    ToolCallTimeout { timeout_seconds: f64 },

    #[error("marker stream violated ordering invariant: {0}")]
    ParseInvariantViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KmuxError>;
