//! Error types for zsilo.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. The variants mirror the error taxonomy the RPC surface emits, so
//! the transport layer can map them onto status codes without string
//! inspection.

use crate::exec::CommandResult;
use thiserror::Error;

/// Result type alias for zsilo operations.
pub type Result<T> = std::result::Result<T, SiloError>;

/// Main error type for zsilo.
#[derive(Error, Debug)]
pub enum SiloError {
    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    // Sparse-update errors
    #[error("field {field} expects {expected}, got {actual}")]
    FieldType { field: String, expected: &'static str, actual: &'static str },

    // Command execution errors
    #[error("command exited with code {}: {}", .0.exit_code, .0.stderr.trim_end())]
    CommandFailed(CommandResult),

    #[error("failed to execute command: {0}")]
    Exec(String),

    #[error("ssh: {0}")]
    Ssh(String),

    // Store errors
    #[error("database error: {0}")]
    Database(String),

    #[error("database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SiloError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// The stderr of the failed command, if this error carries one.
    pub fn command_stderr(&self) -> Option<&str> {
        match self {
            Self::CommandFailed(result) => Some(&result.stderr),
            _ => None,
        }
    }
}
