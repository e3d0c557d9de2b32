//! TaskWatcher implementation

use std::sync::Arc;

use kvstore::{Action, Response, Store, StoreError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::list_pending;
use crate::coordinator::RetryConfig;
use crate::error::CoordError;
use crate::namespace::{Namespace, TaskKey};
use crate::retry::with_retry;

/// What a single store event means for task discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A new task was announced
    Candidate(String),
    /// A claim disappeared; every pending task must be offered again
    Rescan(String),
    /// The tasks directory is gone
    NamespaceDeleted(String),
    Ignore,
}

/// Interpret one event seen under the tasks directory
pub fn classify(namespace: &Namespace, event: &Response) -> WatchOutcome {
    let key = event.node.key.as_str();
    if event.action.is_removal() && namespace.covers_tasks(key) {
        return WatchOutcome::NamespaceDeleted(key.to_string());
    }
    match namespace.task_key(key) {
        Some(TaskKey::Task(task_id)) if event.action == Action::Create && event.node.dir => {
            WatchOutcome::Candidate(task_id)
        }
        Some(TaskKey::Claim(task_id)) if event.action.is_removal() => WatchOutcome::Rescan(task_id),
        _ => WatchOutcome::Ignore,
    }
}

type Candidate = Result<String, CoordError>;

/// Follows the tasks directory and pushes candidate task ids
pub struct TaskWatcher {
    store: Arc<dyn Store>,
    namespace: Namespace,
    retry: RetryConfig,
    next_index: u64,
    tx: mpsc::Sender<Candidate>,
    shutdown: watch::Receiver<bool>,
}

impl TaskWatcher {
    /// Create a watcher resuming after the listing taken at `listed_index`
    pub fn new(
        store: Arc<dyn Store>,
        namespace: Namespace,
        retry: RetryConfig,
        listed_index: u64,
        tx: mpsc::Sender<Candidate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        debug!(root = %namespace.root(), listed_index, "TaskWatcher::new: called");
        Self {
            store,
            namespace,
            retry,
            next_index: listed_index + 1,
            tx,
            shutdown,
        }
    }

    /// Run the watcher loop
    ///
    /// Offers `initial` first, then follows the store until shutdown, until
    /// the candidate receiver is dropped, or until an unrecoverable error has
    /// been handed to the receiver.
    pub async fn run(mut self, initial: Vec<String>) {
        info!(root = %self.namespace.root(), pending = initial.len(), "TaskWatcher started");
        if !self.offer(initial).await {
            return;
        }

        let tasks_path = self.namespace.tasks_path();
        let mut backoff = self.retry.backoff();

        loop {
            let event = tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!("TaskWatcher::run: shutdown requested");
                    break;
                }
                result = self.store.watch_prefix(&tasks_path, self.next_index) => result,
            };

            match event {
                Ok(event) => {
                    backoff.reset();
                    self.next_index = event.index + 1;
                    debug!(action = %event.action, key = %event.node.key, index = event.index, "TaskWatcher::run: event");

                    match classify(&self.namespace, &event) {
                        WatchOutcome::Candidate(task_id) => {
                            if !self.send(Ok(task_id)).await {
                                break;
                            }
                        }
                        WatchOutcome::Rescan(task_id) => {
                            info!(%task_id, "Claim released or expired, rescanning");
                            if !self.rescan(Some(&task_id)).await {
                                break;
                            }
                        }
                        WatchOutcome::NamespaceDeleted(key) => {
                            self.fail(CoordError::NamespaceDeleted(key)).await;
                            break;
                        }
                        WatchOutcome::Ignore => {}
                    }
                }
                Err(StoreError::HistoryCompacted { wait_index, oldest }) => {
                    info!(wait_index, oldest, "Watch history compacted, resyncing from a full listing");
                    if !self.rescan(None).await {
                        break;
                    }
                }
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(attempt = backoff.attempts(), ?delay, error = %e, "Task watch failed, retrying");
                        tokio::select! {
                            _ = self.shutdown.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        self.fail(CoordError::exhausted(&self.retry, e)).await;
                        break;
                    }
                },
                Err(e) => {
                    self.fail(e.into()).await;
                    break;
                }
            }
        }

        info!(root = %self.namespace.root(), "TaskWatcher stopped");
    }

    /// Re-list pending tasks and offer all of them; false if the loop must end
    ///
    /// The task whose claim triggered the rescan goes first when still pending.
    async fn rescan(&mut self, prefer: Option<&str>) -> bool {
        debug!(?prefer, "TaskWatcher::rescan: called");
        match with_retry(&self.retry, "list pending tasks", || {
            list_pending(self.store.as_ref(), &self.namespace)
        })
        .await
        {
            Ok((mut pending, index)) => {
                self.next_index = self.next_index.max(index + 1);
                if let Some(pos) = prefer.and_then(|id| pending.iter().position(|p| p == id)) {
                    let preferred = pending.remove(pos);
                    pending.insert(0, preferred);
                }
                self.offer(pending).await
            }
            Err(e) if e.is_not_found() => {
                self.fail(CoordError::NamespaceDeleted(self.namespace.tasks_path())).await;
                false
            }
            Err(e) if e.is_transient() => {
                self.fail(CoordError::exhausted(&self.retry, e)).await;
                false
            }
            Err(e) => {
                self.fail(e.into()).await;
                false
            }
        }
    }

    async fn offer(&mut self, task_ids: Vec<String>) -> bool {
        for task_id in task_ids {
            if !self.send(Ok(task_id)).await {
                return false;
            }
        }
        true
    }

    async fn fail(&mut self, err: CoordError) {
        error!(error = %err, "TaskWatcher giving up");
        self.send(Err(err)).await;
    }

    /// Hand a candidate to the coordinator; false once nobody is listening
    async fn send(&mut self, candidate: Candidate) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => false,
            result = self.tx.send(candidate) => result.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::{MemoryStore, Node, Operation};
    use std::time::Duration;

    fn event(action: Action, key: &str, dir: bool) -> Response {
        Response {
            action,
            node: Node {
                key: key.to_string(),
                value: None,
                dir,
                ttl: None,
                created_index: 1,
                modified_index: 1,
                nodes: Vec::new(),
            },
            prev_node: None,
            index: 1,
        }
    }

    #[test]
    fn test_classify() {
        let ns = Namespace::new("/testcluster").unwrap();
        assert_eq!(
            classify(&ns, &event(Action::Create, "/testcluster/tasks/t1", true)),
            WatchOutcome::Candidate("t1".to_string())
        );
        assert_eq!(
            classify(&ns, &event(Action::Create, "/testcluster/tasks/t1", false)),
            WatchOutcome::Ignore
        );
        assert_eq!(
            classify(&ns, &event(Action::Create, "/testcluster/tasks/t1/owner", false)),
            WatchOutcome::Ignore
        );
        assert_eq!(
            classify(&ns, &event(Action::Expire, "/testcluster/tasks/t1/owner", false)),
            WatchOutcome::Rescan("t1".to_string())
        );
        assert_eq!(
            classify(&ns, &event(Action::CompareAndDelete, "/testcluster/tasks/t1/owner", false)),
            WatchOutcome::Rescan("t1".to_string())
        );
        assert_eq!(
            classify(&ns, &event(Action::Delete, "/testcluster/tasks/t1", true)),
            WatchOutcome::Ignore
        );
        assert_eq!(
            classify(&ns, &event(Action::Delete, "/testcluster/tasks", true)),
            WatchOutcome::NamespaceDeleted("/testcluster/tasks".to_string())
        );
        assert_eq!(
            classify(&ns, &event(Action::Delete, "/testcluster", true)),
            WatchOutcome::NamespaceDeleted("/testcluster".to_string())
        );
    }

    struct Harness {
        store: Arc<MemoryStore>,
        ns: Namespace,
        rx: mpsc::Receiver<Candidate>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn start(store: Arc<MemoryStore>, initial_tasks: &[&str]) -> Harness {
        let ns = Namespace::new("/testcluster/").unwrap();
        let retry = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            max_attempts: 3,
        };
        ns.ensure_layout(store.as_ref(), &retry).await.unwrap();
        for id in initial_tasks {
            store.create_dir(&ns.task_path(id), None).await.unwrap();
        }
        let (initial, index) = list_pending(store.as_ref(), &ns).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let watcher = TaskWatcher::new(store.clone(), ns.clone(), retry, index, tx, shutdown_rx);
        let handle = tokio::spawn(watcher.run(initial));
        Harness {
            store,
            ns,
            rx,
            shutdown,
            handle,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Candidate>) -> Candidate {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for candidate")
            .expect("watcher channel closed")
    }

    #[tokio::test]
    async fn test_initial_then_new_tasks() {
        let mut h = start(Arc::new(MemoryStore::new()), &["t1", "t2"]).await;
        assert_eq!(next(&mut h.rx).await.unwrap(), "t1");
        assert_eq!(next(&mut h.rx).await.unwrap(), "t2");

        h.store.create_dir(&h.ns.task_path("t3"), None).await.unwrap();
        assert_eq!(next(&mut h.rx).await.unwrap(), "t3");

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_released_claim_triggers_rescan() {
        let mut h = start(Arc::new(MemoryStore::new()), &[]).await;
        h.store.create_dir(&h.ns.task_path("t1"), None).await.unwrap();
        h.store.create_dir(&h.ns.task_path("t2"), None).await.unwrap();
        h.store.create(&h.ns.claim_path("t1"), "test-1", None).await.unwrap();
        h.store.create(&h.ns.claim_path("t2"), "test-1", None).await.unwrap();
        assert_eq!(next(&mut h.rx).await.unwrap(), "t1");
        assert_eq!(next(&mut h.rx).await.unwrap(), "t2");

        h.store.delete(&h.ns.claim_path("t2"), false).await.unwrap();
        assert_eq!(next(&mut h.rx).await.unwrap(), "t2");

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rescan_offers_released_task_first() {
        let mut h = start(Arc::new(MemoryStore::new()), &["t1", "t2", "t3"]).await;
        for id in ["t1", "t2", "t3"] {
            assert_eq!(next(&mut h.rx).await.unwrap(), id);
        }
        h.store.create(&h.ns.claim_path("t3"), "test-1", None).await.unwrap();
        h.store.delete(&h.ns.claim_path("t3"), false).await.unwrap();

        assert_eq!(next(&mut h.rx).await.unwrap(), "t3");
        assert_eq!(next(&mut h.rx).await.unwrap(), "t1");
        assert_eq!(next(&mut h.rx).await.unwrap(), "t2");

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_claim_triggers_rescan() {
        let mut h = start(Arc::new(MemoryStore::new()), &["t1"]).await;
        assert_eq!(next(&mut h.rx).await.unwrap(), "t1");
        h.store
            .create(&h.ns.claim_path("t1"), "test-1", Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(next(&mut h.rx).await.unwrap(), "t1");
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_namespace_deleted() {
        let mut h = start(Arc::new(MemoryStore::new()), &[]).await;
        h.store.delete("/testcluster", true).await.unwrap();

        let err = next(&mut h.rx).await.unwrap_err();
        assert!(matches!(err, CoordError::NamespaceDeleted(_)));
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_compaction_resyncs() {
        let store = Arc::new(MemoryStore::with_history_capacity(2));
        let ns = Namespace::new("/testcluster/").unwrap();
        ns.ensure_layout(store.as_ref(), &RetryConfig::default()).await.unwrap();
        let (_, index) = list_pending(store.as_ref(), &ns).await.unwrap();

        // Events the watcher has not seen yet fall out of history
        for id in ["t1", "t2", "t3", "t4"] {
            store.create_dir(&ns.task_path(id), None).await.unwrap();
        }
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let watcher = TaskWatcher::new(store.clone(), ns.clone(), RetryConfig::default(), index, tx, shutdown_rx);
        let handle = tokio::spawn(watcher.run(Vec::new()));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(next(&mut rx).await.unwrap());
        }
        assert_eq!(seen, vec!["t1", "t2", "t3", "t4"]);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_escalate() {
        let mut h = start(Arc::new(MemoryStore::new()), &[]).await;
        h.store.fail_next(Operation::Watch, 100);
        // Wake the blocked watch so it observes the injected failures
        h.store.create("/testcluster/noise", "x", None).await.unwrap();

        let err = next(&mut h.rx).await.unwrap_err();
        assert!(matches!(err, CoordError::TransientStore { .. }));
        h.handle.await.unwrap();
    }
}
