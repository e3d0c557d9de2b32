//! Coordinator error types

use kvstore::StoreError;
use thiserror::Error;

use crate::coordinator::RetryConfig;

/// Errors surfaced by the coordinator and its components
///
/// Lost claim races are not errors; they never appear here.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("Initialization failed: {reason}")]
    Initialization {
        reason: String,
        #[source]
        source: Option<StoreError>,
    },

    #[error("Store still failing after {attempts} attempts: {source}")]
    TransientStore {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Claim lost on task {task_id}: {reason}")]
    ClaimLost { task_id: String, reason: String },

    #[error("Shutdown incomplete: {0}")]
    Shutdown(String),

    #[error("Coordinator closed")]
    Closed,

    #[error("Namespace deleted: {0}")]
    NamespaceDeleted(String),

    #[error("Coordinator not initialized")]
    NotInitialized,

    #[error("Coordinator already initialized")]
    AlreadyInitialized,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid {kind} '{value}': {reason}")]
    InvalidPath {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Command encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CoordError {
    /// Wrap a store error that outlived the retry policy
    pub fn exhausted(retry: &RetryConfig, source: StoreError) -> Self {
        CoordError::TransientStore {
            attempts: retry.max_attempts,
            source,
        }
    }

    /// Wrap a store error raised while setting up the namespace
    pub fn init(reason: impl Into<String>, source: StoreError) -> Self {
        CoordError::Initialization {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Copy of an error that ended a background loop
    ///
    /// Only the variants a watcher or listener can end with are reproduced.
    pub(crate) fn replay(&self) -> Option<CoordError> {
        match self {
            CoordError::TransientStore { attempts, source } => Some(CoordError::TransientStore {
                attempts: *attempts,
                source: source.clone(),
            }),
            CoordError::NamespaceDeleted(key) => Some(CoordError::NamespaceDeleted(key.clone())),
            CoordError::Store(source) => Some(CoordError::Store(source.clone())),
            _ => None,
        }
    }

    /// Check if the error means the coordinator can no longer be used
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CoordError::ClaimLost { .. })
    }
}
