use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TidepoolError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to initialize database: {0}")]
    DatabaseInitializationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Conflict: {0}")]
    ConflictError(String),
    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("Illegal state transition: {0}")]
    StateError(String),
    #[error("Concurrent update lost: {0}")]
    ConcurrencyError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Arithmetic error: {0}")]
    ArithmeticError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
}

impl TidepoolError {
    /// Stable machine-readable reason code for CLI envelopes and callers
    /// that must branch on failure kind without parsing messages.
    pub fn reason_code(&self) -> &'static str {
        match self {
            TidepoolError::RusqliteError(_) | TidepoolError::DatabaseInitializationError(_) => {
                "STORE"
            }
            TidepoolError::IoError(_) => "IO",
            TidepoolError::ValidationError(_) => "VALIDATION",
            TidepoolError::ConflictError(_) => "CONFLICT",
            TidepoolError::InsufficientBalance(_) => "INSUFFICIENT_BALANCE",
            TidepoolError::StateError(_) => "STATE",
            TidepoolError::ConcurrencyError(_) => "CONCURRENCY",
            TidepoolError::NotFound(_) => "NOT_FOUND",
            TidepoolError::ArithmeticError(_) => "ARITHMETIC",
            TidepoolError::ConfigError(_) => "CONFIG",
        }
    }

    /// Whether a caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TidepoolError::ConcurrencyError(_))
    }
}
