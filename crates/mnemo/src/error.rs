//! Error types for the Mnemo tier engine
//!
//! Every caller-visible operation surfaces one of the categories below so
//! that an upstream admission layer can tell "try later" apart from
//! "this record is gone".

use std::time::Duration;

use thiserror::Error;

use crate::memory::types::Tier;

/// Main error type for tier engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Source record absent at the time it was needed
    #[error("Memory not found: {id} in {tier}")]
    NotFound { id: String, tier: Tier },

    /// Resource-limit rejection or exhausted eviction attempts
    #[error("Capacity exceeded in {tier}: {count} items (limit {max_items})")]
    CapacityExceeded {
        tier: Tier,
        count: usize,
        max_items: usize,
    },

    /// Admission rejected or wait queue full
    #[error("Backpressure on {tier}: {reason}")]
    Backpressure { tier: Tier, reason: String },

    /// Queue wait, ingest or store exceeded its bound
    #[error("Timed out after {elapsed:?} during {operation}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// A pipeline stage failed; rollback was attempted
    #[error("Transaction '{transaction}' failed at stage '{stage}': {reason}")]
    TransactionFailed {
        transaction: String,
        stage: String,
        reason: String,
    },

    /// Explicit skip signal raised inside a transaction runner
    #[error("Transaction skipped: {0}")]
    Skipped(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tier collaborator failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse category of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    CapacityExceeded,
    Backpressure,
    Timeout,
    TransactionFailed,
    Skipped,
    Config,
    Storage,
    Serialization,
    Io,
}

/// What a caller should do after a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Transient condition; retry with backoff
    RetryLater,
    /// The record no longer exists; retrying will not help
    Gone,
    /// Not recoverable by retrying the same call
    Fatal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            EngineError::Backpressure { .. } => ErrorKind::Backpressure,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::TransactionFailed { .. } => ErrorKind::TransactionFailed,
            EngineError::Skipped(_) => ErrorKind::Skipped,
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Serialization(_) => ErrorKind::Serialization,
            EngineError::Io(_) => ErrorKind::Io,
        }
    }

    /// Translate the error category into caller guidance.
    ///
    /// - Backpressure, CapacityExceeded and Timeout: retry later
    /// - NotFound: the record is gone
    /// - everything else: fatal for this call
    pub fn retry_hint(&self) -> RetryHint {
        match self.kind() {
            ErrorKind::Backpressure | ErrorKind::CapacityExceeded | ErrorKind::Timeout => {
                RetryHint::RetryLater
            }
            ErrorKind::NotFound => RetryHint::Gone,
            _ => RetryHint::Fatal,
        }
    }

    /// Errors that carry their own category through a transaction unchanged
    pub(crate) fn is_typed(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound
                | ErrorKind::CapacityExceeded
                | ErrorKind::Backpressure
                | ErrorKind::Timeout
                | ErrorKind::TransactionFailed
                | ErrorKind::Skipped
        )
    }

    pub(crate) fn not_found(id: impl Into<String>, tier: Tier) -> Self {
        EngineError::NotFound {
            id: id.into(),
            tier,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        EngineError::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias for tier engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
