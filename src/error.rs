//! Error taxonomy for the scheduling core.
//!
//! Contention is deliberately *not* an error: a conditional write that
//! affects zero rows is reported as an affected-row count (or `Ok(None)`)
//! and the caller re-polls. Errors here cover the cases where something
//! must be surfaced: transaction failures, invalid operation sequencing
//! on a store session, validation, and store-level faults.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Store-level errors (timeouts, connectivity, constraint violations)
    /// propagate unmodified from the backend.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A transaction failed to begin, commit, or stay consistent. Retryable
    /// for the bounded-retry protocols (dedup merge, stall recovery).
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// Insert and reset were invoked on the same store session. The backend
    /// may cache a prepared write plan that is inconsistent across that
    /// combination, so this fails fast instead of corrupting state.
    #[error("invalid operation sequence: {0}")]
    OperationSequence(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(#[from] config::ConfigError),
}

impl QueueError {
    /// Whether a bounded-retry loop may re-run its read-then-write step
    /// after seeing this error.
    pub fn is_contention(&self) -> bool {
        matches!(self, QueueError::Transaction(_) | QueueError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
