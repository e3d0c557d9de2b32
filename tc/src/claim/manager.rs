//! ClaimManager - atomic task claims

use std::sync::Arc;
use std::time::Duration;

use kvstore::{Precondition, Response, Store, StoreError, StoreResult};
use tracing::{debug, info, warn};

use crate::coordinator::RetryConfig;
use crate::error::CoordError;
use crate::namespace::{Namespace, validate_segment};
use crate::retry::with_retry;

/// Creates and removes claim keys on behalf of one node
pub struct ClaimManager {
    store: Arc<dyn Store>,
    namespace: Namespace,
    node_id: String,
    ttl: Duration,
    retry: RetryConfig,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn Store>, namespace: Namespace, node_id: String, ttl: Duration, retry: RetryConfig) -> Self {
        debug!(%node_id, ?ttl, "ClaimManager::new: called");
        Self {
            store,
            namespace,
            node_id,
            ttl,
            retry,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Try to become the owner of a task
    ///
    /// Returns true only when this call created the claim key. A claim held by
    /// anyone else, or a task that no longer exists, yields false. Transient
    /// failures are retried; if the policy runs out the error is returned.
    pub async fn try_claim(&self, task_id: &str) -> Result<bool, CoordError> {
        debug!(%task_id, node_id = %self.node_id, "try_claim: called");
        validate_segment("task id", task_id)?;
        let key = self.namespace.claim_path(task_id);
        let mut backoff = self.retry.backoff();
        // Set once an attempt failed without a definitive answer: that create
        // may have been applied even though we never saw the response.
        let mut uncertain = false;

        loop {
            match self.store.create(&key, &self.node_id, Some(self.ttl)).await {
                Ok(_) => {
                    info!(%task_id, node_id = %self.node_id, "Claimed task");
                    return Ok(true);
                }
                Err(StoreError::AlreadyExists { .. }) if uncertain => {
                    let ours = self.owned_by_self(&key).await?;
                    debug!(%task_id, ours, "try_claim: resolved uncertain create");
                    return Ok(ours);
                }
                Err(StoreError::AlreadyExists { .. }) => {
                    debug!(%task_id, "try_claim: already claimed");
                    return Ok(false);
                }
                Err(StoreError::NotFound { .. }) => {
                    debug!(%task_id, "try_claim: task no longer exists");
                    return Ok(false);
                }
                Err(e @ (StoreError::NotADirectory { .. } | StoreError::NotAFile { .. })) => {
                    warn!(%task_id, error = %e, "Task entry is not claimable");
                    return Ok(false);
                }
                Err(e) if e.is_transient() => {
                    uncertain = true;
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(%task_id, attempt = backoff.attempts(), ?delay, error = %e, "Claim attempt failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(CoordError::exhausted(&self.retry, e)),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn owned_by_self(&self, key: &str) -> Result<bool, CoordError> {
        match with_retry(&self.retry, "read claim", || self.store.get(key, false)).await {
            Ok(response) => Ok(response.node.value.as_deref() == Some(self.node_id.as_str())),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) if e.is_transient() => Err(CoordError::exhausted(&self.retry, e)),
            Err(e) => Err(e.into()),
        }
    }

    /// Current owner of a task, if it is claimed
    pub async fn owner(&self, task_id: &str) -> Result<Option<String>, CoordError> {
        debug!(%task_id, "owner: called");
        validate_segment("task id", task_id)?;
        let key = self.namespace.claim_path(task_id);
        match with_retry(&self.retry, "read claim", || self.store.get(&key, false)).await {
            Ok(response) => Ok(response.node.value),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) if e.is_transient() => Err(CoordError::exhausted(&self.retry, e)),
            Err(e) => Err(e.into()),
        }
    }

    /// Reset the claim TTL, failing unless this node still owns the claim
    ///
    /// A single attempt; the caller decides whether to retry.
    pub async fn refresh(&self, task_id: &str) -> StoreResult<Response> {
        debug!(%task_id, node_id = %self.node_id, "refresh: called");
        let owner = Precondition::PrevValue(self.node_id.clone());
        self.store
            .compare_and_swap(&self.namespace.claim_path(task_id), &self.node_id, owner, Some(self.ttl))
            .await
    }

    /// Delete this node's claim on a task
    ///
    /// Returns true if a claim owned by this node was removed. A missing claim
    /// or one owned by another node is left alone and reported as false.
    pub async fn release(&self, task_id: &str) -> Result<bool, CoordError> {
        debug!(%task_id, node_id = %self.node_id, "release: called");
        validate_segment("task id", task_id)?;
        let key = self.namespace.claim_path(task_id);
        let owner = Precondition::PrevValue(self.node_id.clone());

        match with_retry(&self.retry, "release claim", || {
            self.store.compare_and_delete(&key, owner.clone())
        })
        .await
        {
            Ok(_) => {
                info!(%task_id, node_id = %self.node_id, "Released task");
                Ok(true)
            }
            Err(StoreError::NotFound { .. }) => {
                debug!(%task_id, "release: claim already gone");
                Ok(false)
            }
            Err(StoreError::PreconditionFailed { .. }) => {
                warn!(%task_id, "release: claim now belongs to another node, leaving it");
                Ok(false)
            }
            Err(e) if e.is_transient() => Err(CoordError::exhausted(&self.retry, e)),
            Err(e) => Err(e.into()),
        }
    }
}
