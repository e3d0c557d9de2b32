//! Main Coordinator implementation

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use kvstore::{Store, StoreError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, debug, info, info_span, warn};

use super::config::CoordinatorConfig;
use crate::claim::{ClaimEvent, ClaimManager, LeaseManager};
use crate::command::{CommandListener, CommandMessage};
use crate::error::CoordError;
use crate::namespace::{Namespace, validate_segment};
use crate::retry::with_retry;
use crate::watcher::{TaskWatcher, list_pending};

const EVENT_BUFFER: usize = 256;

/// Receiving end of a background loop, remembering the error it ended with
struct Feed<T> {
    rx: mpsc::Receiver<Result<T, CoordError>>,
    failure: Option<CoordError>,
}

impl<T> Feed<T> {
    fn new(rx: mpsc::Receiver<Result<T, CoordError>>) -> Self {
        Self { rx, failure: None }
    }

    /// The error the loop ended with, for every caller after the first
    fn failed(&self) -> Option<CoordError> {
        self.failure.as_ref().and_then(CoordError::replay)
    }

    fn record(&mut self, err: CoordError) -> CoordError {
        self.failure = err.replay();
        err
    }
}

type Candidates = Feed<String>;
type Commands = Feed<CommandMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Starting,
    Running,
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Coordinates task ownership for one node
///
/// All methods take `&self`; share the coordinator behind an `Arc` to call
/// `watch()`, `command()` and `release()` from different tasks.
pub struct Coordinator {
    config: CoordinatorConfig,
    namespace: Namespace,
    store: Arc<dyn Store>,
    claims: ClaimManager,
    leases: LeaseManager,
    events: broadcast::Sender<ClaimEvent>,
    shutdown: watch::Sender<bool>,
    candidates: tokio::sync::Mutex<Option<Candidates>>,
    commands: tokio::sync::Mutex<Option<Commands>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Coordinator {
    /// Create a coordinator for one node over a shared store
    ///
    /// Nothing touches the store until [`Coordinator::init`].
    pub fn new(config: CoordinatorConfig, store: Arc<dyn Store>) -> Result<Self, CoordError> {
        debug!(node_id = %config.node_id, namespace = %config.namespace, "Coordinator::new: called");
        config.validate()?;
        let namespace = config.parsed_namespace()?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);

        let claims = ClaimManager::new(
            store.clone(),
            namespace.clone(),
            config.node_id.clone(),
            config.claim_ttl(),
            config.retry.clone(),
        );
        let leases = LeaseManager::new(
            store.clone(),
            namespace.clone(),
            config.node_id.clone(),
            config.claim_ttl(),
            config.renew_interval(),
            config.retry.clone(),
            events.clone(),
        );

        Ok(Self {
            config,
            namespace,
            store,
            claims,
            leases,
            events,
            shutdown,
            candidates: tokio::sync::Mutex::new(None),
            commands: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(Lifecycle::New),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Prepare the namespace and start discovery and the command inbox
    ///
    /// Fails with `Initialization` if the store cannot be reached or the
    /// namespace directories cannot be created. May be retried after a
    /// failure, but not called again once it has succeeded.
    pub async fn init(&self) -> Result<(), CoordError> {
        debug!(node_id = %self.config.node_id, "Coordinator::init: called");
        {
            let mut lifecycle = lock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::New => *lifecycle = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Running => return Err(CoordError::AlreadyInitialized),
                Lifecycle::Closed => return Err(CoordError::Closed),
            }
        }

        let handles = match self.start().await {
            Ok(handles) => handles,
            Err(e) => {
                warn!(node_id = %self.config.node_id, error = %e, "Coordinator init failed");
                let mut lifecycle = lock(&self.lifecycle);
                if *lifecycle == Lifecycle::Starting {
                    *lifecycle = Lifecycle::New;
                }
                return Err(e);
            }
        };

        let mut lifecycle = lock(&self.lifecycle);
        if *lifecycle != Lifecycle::Starting {
            // close() ran while we were starting
            for handle in handles {
                handle.abort();
            }
            return Err(CoordError::Closed);
        }
        *lifecycle = Lifecycle::Running;
        lock(&self.tasks).extend(handles);
        info!(node_id = %self.config.node_id, root = %self.namespace.root(), "Coordinator initialized");
        Ok(())
    }

    async fn start(&self) -> Result<Vec<JoinHandle<()>>, CoordError> {
        let retry = &self.config.retry;
        self.namespace.ensure_layout(self.store.as_ref(), retry).await?;

        let (pending, index) = with_retry(retry, "list pending tasks", || {
            list_pending(self.store.as_ref(), &self.namespace)
        })
        .await
        .map_err(|e| CoordError::init("cannot list tasks", e))?;
        debug!(pending = pending.len(), index, "Coordinator::start: initial listing");

        let (candidate_tx, candidate_rx) = mpsc::channel(self.config.channel_buffer);
        let (command_tx, command_rx) = mpsc::channel(self.config.channel_buffer);
        *self.candidates.lock().await = Some(Feed::new(candidate_rx));
        *self.commands.lock().await = Some(Feed::new(command_rx));

        let watcher = TaskWatcher::new(
            self.store.clone(),
            self.namespace.clone(),
            retry.clone(),
            index,
            candidate_tx,
            self.shutdown.subscribe(),
        );
        let listener = CommandListener::new(
            self.store.clone(),
            self.namespace.command_path(&self.config.node_id),
            retry.clone(),
            command_tx,
            self.shutdown.subscribe(),
        );

        let span = info_span!("coordinator", node_id = %self.config.node_id);
        Ok(vec![
            tokio::spawn(watcher.run(pending).instrument(span.clone())),
            tokio::spawn(listener.run().instrument(span)),
        ])
    }

    fn ensure_running(&self) -> Result<(), CoordError> {
        match *lock(&self.lifecycle) {
            Lifecycle::Running => Ok(()),
            Lifecycle::Closed => Err(CoordError::Closed),
            Lifecycle::New | Lifecycle::Starting => Err(CoordError::NotInitialized),
        }
    }

    /// Wait for a task and claim it
    ///
    /// Blocks until this node owns a task, then returns its id. The claim is
    /// renewed in the background until [`Coordinator::release`] or
    /// [`Coordinator::close`]. Tasks claimed by other nodes are skipped.
    ///
    /// Once discovery has stopped on an unrecoverable error, every later call
    /// returns that error again.
    pub async fn watch(&self) -> Result<String, CoordError> {
        debug!(node_id = %self.config.node_id, "Coordinator::watch: called");
        self.ensure_running()?;
        let mut shutdown = self.shutdown.subscribe();
        let mut guard = self.candidates.lock().await;
        let candidates = guard.as_mut().ok_or(CoordError::NotInitialized)?;
        if let Some(err) = candidates.failed() {
            return Err(err);
        }

        loop {
            let candidate = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return Err(CoordError::Closed),
                candidate = candidates.rx.recv() => candidate,
            };
            let task_id = match candidate {
                Some(Ok(task_id)) => task_id,
                Some(Err(e)) => return Err(candidates.record(e)),
                None => return Err(CoordError::Closed),
            };

            if self.leases.is_held(&task_id) {
                debug!(%task_id, "Coordinator::watch: already held, skipping");
                continue;
            }
            if self.claims.try_claim(&task_id).await? {
                self.leases.start(&task_id);
                let _ = self.events.send(ClaimEvent::Claimed {
                    task_id: task_id.clone(),
                });
                return Ok(task_id);
            }
        }
    }

    /// Give up a task
    ///
    /// Renewal stops before the claim is deleted. Releasing a task that is
    /// not claimed, or claimed by another node, succeeds without effect.
    pub async fn release(&self, task_id: &str) -> Result<(), CoordError> {
        debug!(node_id = %self.config.node_id, %task_id, "Coordinator::release: called");
        validate_segment("task id", task_id)?;
        let was_held = self.leases.stop(task_id).await;
        self.leases.forget(task_id);

        let removed = self.claims.release(task_id).await?;
        if was_held || removed {
            let _ = self.events.send(ClaimEvent::Released {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }

    /// Finish a task: stop renewal and delete the task together with its claim
    ///
    /// Every delete attempt is preceded by a refresh of the claim, so a retry
    /// never removes a task that another node claimed after ours expired.
    /// Fails with `ClaimLost`, deleting nothing, if this node no longer owns
    /// the task.
    pub async fn complete(&self, task_id: &str) -> Result<(), CoordError> {
        debug!(node_id = %self.config.node_id, %task_id, "Coordinator::complete: called");
        validate_segment("task id", task_id)?;
        self.check_claim(task_id)?;
        self.leases.stop(task_id).await;

        let retry = &self.config.retry;
        let path = self.namespace.task_path(task_id);
        let (claims, store, path) = (&self.claims, &self.store, path.as_str());
        let deleted = with_retry(retry, "delete task", || async move {
            claims.refresh(task_id).await?;
            store.delete(path, true).await
        })
        .await;
        match deleted {
            Ok(_) => {}
            Err(e @ (StoreError::NotFound { .. } | StoreError::PreconditionFailed { .. })) => {
                warn!(node_id = %self.config.node_id, %task_id, error = %e, "Claim gone before the task was deleted");
                return Err(CoordError::ClaimLost {
                    task_id: task_id.to_string(),
                    reason: "claim no longer owned by this node".to_string(),
                });
            }
            Err(e) if e.is_transient() => return Err(CoordError::exhausted(retry, e)),
            Err(e) => return Err(e.into()),
        }

        info!(node_id = %self.config.node_id, %task_id, "Completed task");
        let _ = self.events.send(ClaimEvent::Released {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// Wait for the next command addressed to this node
    ///
    /// The command has already been removed from the inbox when it is returned.
    /// Once the inbox listener has stopped on an unrecoverable error, every
    /// later call returns that error again.
    pub async fn command(&self) -> Result<CommandMessage, CoordError> {
        debug!(node_id = %self.config.node_id, "Coordinator::command: called");
        self.ensure_running()?;
        let mut shutdown = self.shutdown.subscribe();
        let mut guard = self.commands.lock().await;
        let commands = guard.as_mut().ok_or(CoordError::NotInitialized)?;
        if let Some(err) = commands.failed() {
            return Err(err);
        }

        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => Err(CoordError::Closed),
            delivery = commands.rx.recv() => match delivery {
                Some(Ok(message)) => Ok(message),
                Some(Err(e)) => Err(commands.record(e)),
                None => Err(CoordError::Closed),
            },
        }
    }

    /// Subscribe to claim, release and loss notifications
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClaimEvent> {
        self.events.subscribe()
    }

    /// Tasks this node currently holds, sorted
    pub fn held_tasks(&self) -> Vec<String> {
        self.leases.held()
    }

    /// Confirm this node still owns a task
    ///
    /// Returns `ClaimLost` once renewal has failed, or if the task was never
    /// claimed here.
    pub fn check_claim(&self, task_id: &str) -> Result<(), CoordError> {
        if let Some(reason) = self.leases.lost_reason(task_id) {
            return Err(CoordError::ClaimLost {
                task_id: task_id.to_string(),
                reason,
            });
        }
        if !self.leases.is_held(task_id) {
            return Err(CoordError::ClaimLost {
                task_id: task_id.to_string(),
                reason: "not held by this node".to_string(),
            });
        }
        Ok(())
    }

    /// Stop all background work and release held claims
    ///
    /// Releases are best effort. The whole shutdown, background loops
    /// included, is bounded by the shutdown grace period. Calling close more
    /// than once is harmless.
    pub async fn close(&self) -> Result<(), CoordError> {
        debug!(node_id = %self.config.node_id, "Coordinator::close: called");
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Closed {
                debug!("Coordinator::close: already closed");
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }
        info!(node_id = %self.config.node_id, "Coordinator shutting down");
        self.shutdown.send_replace(true);

        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for mut handle in handles {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                handle.abort();
            }
        }

        let held = self.leases.stop_all(deadline).await;
        if held.is_empty() {
            info!(node_id = %self.config.node_id, "Coordinator closed");
            return Ok(());
        }

        let releases = join_all(held.iter().map(|task_id| self.claims.release(task_id)));
        let results = match timeout_at(deadline, releases).await {
            Ok(results) => results,
            Err(_) => {
                let msg = format!("timed out releasing {} claims after {:?}", held.len(), grace);
                warn!(node_id = %self.config.node_id, %msg, "Shutdown incomplete");
                return Err(CoordError::Shutdown(msg));
            }
        };

        let mut failed = Vec::new();
        for (task_id, result) in held.iter().zip(results) {
            match result {
                Ok(_) => {
                    let _ = self.events.send(ClaimEvent::Released {
                        task_id: task_id.clone(),
                    });
                }
                Err(e) => {
                    warn!(%task_id, error = %e, "Failed to release claim during shutdown");
                    failed.push(task_id.clone());
                }
            }
        }

        if failed.is_empty() {
            info!(node_id = %self.config.node_id, released = held.len(), "Coordinator closed");
            Ok(())
        } else {
            Err(CoordError::Shutdown(format!(
                "could not release {}",
                failed.join(", ")
            )))
        }
    }
}
