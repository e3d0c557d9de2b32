//! LeaseManager - keeps held claims alive

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kvstore::{Precondition, Store, StoreError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::ClaimEvent;
use crate::coordinator::RetryConfig;
use crate::namespace::Namespace;

struct Lease {
    generation: u64,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Lost claims remembered for `lost_reason`
const LOST_CLAIMS_KEPT: usize = 1024;

type Leases = Arc<Mutex<HashMap<String, Lease>>>;
type LostClaims = Arc<Mutex<LostLedger>>;

/// Reasons for recently lost claims, oldest forgotten first
struct LostLedger {
    capacity: usize,
    reasons: HashMap<String, String>,
    order: VecDeque<String>,
}

impl LostLedger {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            reasons: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, task_id: String, reason: String) {
        if self.reasons.insert(task_id.clone(), reason).is_none() {
            self.order.push_back(task_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.reasons.remove(&oldest);
            }
        }
    }

    fn get(&self, task_id: &str) -> Option<&String> {
        self.reasons.get(task_id)
    }

    fn remove(&mut self, task_id: &str) -> Option<String> {
        let reason = self.reasons.remove(task_id)?;
        self.order.retain(|id| id != task_id);
        Some(reason)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Renews the TTL of every claim this node holds
///
/// One background task per held claim refreshes the claim key with a
/// compare-and-swap on the owner value. A claim whose renewal is refused, or
/// which could not be renewed for a full TTL, is declared lost: it is dropped
/// from the held set, recorded, and a [`ClaimEvent::Lost`] is broadcast.
pub struct LeaseManager {
    store: Arc<dyn Store>,
    namespace: Namespace,
    node_id: String,
    ttl: Duration,
    interval: Duration,
    retry: RetryConfig,
    leases: Leases,
    lost: LostClaims,
    generation: AtomicU64,
    events: broadcast::Sender<ClaimEvent>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn Store>,
        namespace: Namespace,
        node_id: String,
        ttl: Duration,
        interval: Duration,
        retry: RetryConfig,
        events: broadcast::Sender<ClaimEvent>,
    ) -> Self {
        debug!(%node_id, ?ttl, ?interval, "LeaseManager::new: called");
        Self {
            store,
            namespace,
            node_id,
            ttl,
            interval,
            retry,
            leases: Arc::new(Mutex::new(HashMap::new())),
            lost: Arc::new(Mutex::new(LostLedger::new(LOST_CLAIMS_KEPT))),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Begin renewing a freshly claimed task
    pub fn start(&self, task_id: &str) {
        debug!(%task_id, "LeaseManager::start: called");
        lock(&self.lost).remove(task_id);

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let renewer = Renewer {
            store: self.store.clone(),
            key: self.namespace.claim_path(task_id),
            task_id: task_id.to_string(),
            node_id: self.node_id.clone(),
            ttl: self.ttl,
            interval: self.interval,
            retry: self.retry.clone(),
            generation,
            leases: self.leases.clone(),
            lost: self.lost.clone(),
            events: self.events.clone(),
        };

        // Hold the lock across spawn so a lease lost immediately cannot try to
        // remove itself before it has been inserted.
        let mut leases = lock(&self.leases);
        let handle = tokio::spawn(renewer.run(cancel_rx));
        if let Some(previous) = leases.insert(
            task_id.to_string(),
            Lease {
                generation,
                cancel: cancel_tx,
                handle,
            },
        ) {
            warn!(%task_id, "Replacing an existing lease");
            let _ = previous.cancel.send(());
        }
    }

    /// Stop renewing a task; returns false if it was not held
    pub async fn stop(&self, task_id: &str) -> bool {
        debug!(%task_id, "LeaseManager::stop: called");
        let lease = lock(&self.leases).remove(task_id);
        match lease {
            Some(lease) => {
                let _ = lease.cancel.send(());
                if let Err(e) = lease.handle.await {
                    warn!(%task_id, error = %e, "Lease task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    /// Stop every lease, returning the tasks that were still held
    ///
    /// Renewals still running at `deadline` are aborted.
    pub async fn stop_all(&self, deadline: Instant) -> Vec<String> {
        debug!("LeaseManager::stop_all: called");
        let drained: Vec<(String, Lease)> = lock(&self.leases).drain().collect();
        let mut task_ids = Vec::with_capacity(drained.len());
        let mut handles = Vec::with_capacity(drained.len());
        for (task_id, lease) in drained {
            let _ = lease.cancel.send(());
            task_ids.push(task_id.clone());
            handles.push((task_id, lease.handle));
        }
        for (task_id, mut handle) in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%task_id, error = %e, "Lease task ended abnormally"),
                Err(_) => {
                    warn!(%task_id, "Lease task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        task_ids.sort();
        task_ids
    }

    /// Tasks currently held, sorted
    pub fn held(&self) -> Vec<String> {
        let mut held: Vec<String> = lock(&self.leases).keys().cloned().collect();
        held.sort();
        held
    }

    pub fn is_held(&self, task_id: &str) -> bool {
        lock(&self.leases).contains_key(task_id)
    }

    /// Why a claim was lost, if it was
    pub fn lost_reason(&self, task_id: &str) -> Option<String> {
        lock(&self.lost).get(task_id).cloned()
    }

    /// Drop the record of a lost claim
    pub fn forget(&self, task_id: &str) -> Option<String> {
        lock(&self.lost).remove(task_id)
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        for (task_id, lease) in lock(&self.leases).drain() {
            debug!(%task_id, "LeaseManager::drop: aborting renewal");
            lease.handle.abort();
        }
    }
}

/// State owned by one renewal task
struct Renewer {
    store: Arc<dyn Store>,
    key: String,
    task_id: String,
    node_id: String,
    ttl: Duration,
    interval: Duration,
    retry: RetryConfig,
    generation: u64,
    leases: Leases,
    lost: LostClaims,
    events: broadcast::Sender<ClaimEvent>,
}

impl Renewer {
    async fn run(self, mut cancel: oneshot::Receiver<()>) {
        debug!(task_id = %self.task_id, "Renewer::run: started");
        let mut last_renewed = Instant::now();
        let mut backoff = self.retry.backoff();
        let mut delay = self.interval;

        loop {
            tokio::select! {
                _ = &mut cancel => {
                    debug!(task_id = %self.task_id, "Renewer::run: cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let owner = Precondition::PrevValue(self.node_id.clone());
            match self
                .store
                .compare_and_swap(&self.key, &self.node_id, owner, Some(self.ttl))
                .await
            {
                Ok(_) => {
                    debug!(task_id = %self.task_id, "Renewer::run: renewed");
                    last_renewed = Instant::now();
                    backoff.reset();
                    delay = self.interval;
                }
                Err(e) if e.is_transient() => {
                    if last_renewed.elapsed() >= self.ttl {
                        self.declare_lost(format!("could not renew within the claim TTL: {}", e));
                        return;
                    }
                    delay = backoff.next_delay().unwrap_or(self.interval).min(self.interval);
                    warn!(task_id = %self.task_id, ?delay, error = %e, "Lease renewal failed, retrying");
                }
                Err(StoreError::PreconditionFailed { .. }) => {
                    self.declare_lost("claim is now owned by another node".to_string());
                    return;
                }
                Err(StoreError::NotFound { .. }) => {
                    self.declare_lost("claim key expired or was deleted".to_string());
                    return;
                }
                Err(e) => {
                    self.declare_lost(e.to_string());
                    return;
                }
            }
        }
    }

    fn declare_lost(&self, reason: String) {
        {
            let mut leases = lock(&self.leases);
            if leases.get(&self.task_id).is_some_and(|l| l.generation == self.generation) {
                leases.remove(&self.task_id);
            } else {
                // Already stopped by its owner; nothing to report
                return;
            }
        }
        error!(task_id = %self.task_id, node_id = %self.node_id, %reason, "Claim lost");
        lock(&self.lost).insert(self.task_id.clone(), reason.clone());
        let _ = self.events.send(ClaimEvent::Lost {
            task_id: self.task_id.clone(),
            reason,
        });
        info!(task_id = %self.task_id, "Lease renewal stopped");
    }
}
