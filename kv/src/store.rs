//! Store trait definition

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{Precondition, Response};

/// A hierarchical, watchable key-value store
///
/// Implementations must be safe to share between many concurrent callers.
/// Create-if-absent and the conditional operations are the only primitives
/// callers may rely on for mutual exclusion.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a file key; fails with `AlreadyExists` if the key is present
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response>;

    /// Create a directory; fails with `AlreadyExists` if the key is present
    async fn create_dir(&self, key: &str, ttl: Option<Duration>) -> StoreResult<Response>;

    /// Write a file key unconditionally, creating it if needed
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response>;

    /// Replace a file's value and TTL if the precondition holds
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        precondition: Precondition,
        ttl: Option<Duration>,
    ) -> StoreResult<Response>;

    /// Delete a file key if the precondition holds
    async fn compare_and_delete(&self, key: &str, precondition: Precondition) -> StoreResult<Response>;

    /// Delete a key; non-empty directories require `recursive`
    async fn delete(&self, key: &str, recursive: bool) -> StoreResult<Response>;

    /// Read a key; directories include their children
    async fn get(&self, key: &str, recursive: bool) -> StoreResult<Response>;

    /// Block until a change at or after `wait_index` touches `prefix`
    ///
    /// Changes to the prefix key itself, to any descendant, and removals of
    /// any ancestor are reported. Fails with `HistoryCompacted` when events at
    /// `wait_index` are no longer retained.
    async fn watch_prefix(&self, prefix: &str, wait_index: u64) -> StoreResult<Response>;

    /// Index of the most recent change
    async fn current_index(&self) -> StoreResult<u64>;
}
