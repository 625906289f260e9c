//! EZKV - Custom Error Types
//! Defines the error hierarchy for the store.

use std::sync::PoisonError;

use thiserror::Error;

/// Custom Result type for the ezkv store.
pub type Result<T> = std::result::Result<T, EzkvError>;

/// Error types for the ezkv store.
#[derive(Error, Debug)]
pub enum EzkvError {
    /// Key is absent or its deadline has passed.
    #[error("Key not found")]
    NotFound,

    /// A typed decode was attempted on text that does not parse as that type.
    #[error("Malformed {kind} value: {reason}")]
    MalformedValue { kind: &'static str, reason: String },

    /// I/O errors from opening, reading or writing the store file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store file is not a valid ezkv log.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// A commit could not be durably recorded and was rolled back.
    #[error("Commit could not be persisted: {0}")]
    Persistence(#[source] std::io::Error),

    /// Record serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store has been closed.
    #[error("Store is closed")]
    Closed,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A thread panicked while holding an internal lock.
    #[error("Internal lock poisoned")]
    LockPoisoned,
}

impl EzkvError {
    pub(crate) fn malformed(kind: &'static str, reason: impl ToString) -> Self {
        EzkvError::MalformedValue {
            kind,
            reason: reason.to_string(),
        }
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EzkvError::NotFound)
    }

    /// True when the backing file could not be opened, read or written,
    /// or its contents are not a valid store.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, EzkvError::Io(_) | EzkvError::Corruption(_))
    }
}

impl<T> From<PoisonError<T>> for EzkvError {
    fn from(_: PoisonError<T>) -> Self {
        EzkvError::LockPoisoned
    }
}

impl From<bincode::Error> for EzkvError {
    fn from(err: bincode::Error) -> Self {
        EzkvError::Serialization(err.to_string())
    }
}
