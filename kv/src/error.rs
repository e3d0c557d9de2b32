//! Store error types

use thiserror::Error;

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by a [`crate::Store`]
///
/// Errors that describe the key space carry the store index observed when the
/// error was produced, so callers can resume a watch without another round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Key already exists: {key}")]
    AlreadyExists { key: String, index: u64 },

    #[error("Key not found: {key}")]
    NotFound { key: String, index: u64 },

    #[error("Compare failed on {key}: {reason}")]
    PreconditionFailed { key: String, reason: String, index: u64 },

    #[error("Not a directory: {key}")]
    NotADirectory { key: String },

    #[error("Not a file: {key}")]
    NotAFile { key: String },

    #[error("Directory not empty: {key}")]
    DirectoryNotEmpty { key: String },

    #[error("Invalid key: {key}")]
    InvalidKey { key: String },

    #[error("Event history compacted: wait index {wait_index} is older than {oldest}")]
    HistoryCompacted { wait_index: u64, oldest: u64 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Check if the operation may succeed when retried unchanged
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// Check if this is a missing-key error
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Store index carried by the error, if any
    pub fn index(&self) -> Option<u64> {
        match self {
            StoreError::AlreadyExists { index, .. }
            | StoreError::NotFound { index, .. }
            | StoreError::PreconditionFailed { index, .. } => Some(*index),
            _ => None,
        }
    }
}
