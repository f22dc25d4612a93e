//! Error types for filevault.

use std::fmt;

use thiserror::Error;

/// Common error type for filevault.
#[derive(Error, Debug)]
pub enum VaultError {
    /// File, session, share or account absent.
    #[error("{0} not found")]
    NotFound(String),

    /// Ownership or share check failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The operation would push an account past its quota.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The target is in the wrong state for the operation
    /// (directory targeted as file, completed file re-uploaded, deleted file).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Storage backend failure.
    ///
    /// Errors from the filesystem or the blob service are translated into
    /// this variant and never surfaced raw.
    #[error("I/O failure: {0}")]
    Io(String),

    /// Duplicate share or name collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Stable, machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    QuotaExceeded,
    InvalidState,
    IoFailure,
    Conflict,
    Database,
    Validation,
    Config,
}

impl ErrorKind {
    /// Wire representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Database => "database",
            ErrorKind::Validation => "validation",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VaultError {
    /// Get the stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::NotFound(_) => ErrorKind::NotFound,
            VaultError::Unauthorized(_) => ErrorKind::Unauthorized,
            VaultError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            VaultError::InvalidState(_) => ErrorKind::InvalidState,
            VaultError::Io(_) => ErrorKind::IoFailure,
            VaultError::Conflict(_) => ErrorKind::Conflict,
            VaultError::Database(_) => ErrorKind::Database,
            VaultError::Validation(_) => ErrorKind::Validation,
            VaultError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        VaultError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(e: reqwest::Error) -> Self {
        VaultError::Io(e.to_string())
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for VaultError {
    fn from(e: sqlx::Error) -> Self {
        VaultError::Database(e.to_string())
    }
}

/// Result type alias for filevault operations.
pub type Result<T> = std::result::Result<T, VaultError>;
