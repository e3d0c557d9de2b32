//! CommandListener - consumes a node's command inbox

use std::sync::Arc;

use kvstore::{Precondition, Response, Store, StoreError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::types::CommandMessage;
use crate::coordinator::RetryConfig;
use crate::error::CoordError;
use crate::retry::Backoff;

type Delivery = Result<CommandMessage, CoordError>;

/// Deliveries allowed for one stored command whose delete keeps failing
const MAX_DELIVERIES: u32 = 2;

/// Reads, deletes and delivers commands addressed to one node
///
/// A command is delivered after its key has been deleted. When the delete
/// fails the command is delivered anyway and read again later, so a command
/// can arrive twice but is never dropped. Later reads of the same stored
/// value only retry the delete.
pub struct CommandListener {
    store: Arc<dyn Store>,
    key: String,
    retry: RetryConfig,
    tx: mpsc::Sender<Delivery>,
    shutdown: watch::Receiver<bool>,
    // modified index of a command still in the inbox, and how often it was delivered
    undeleted: Option<(u64, u32)>,
}

impl CommandListener {
    pub fn new(
        store: Arc<dyn Store>,
        key: String,
        retry: RetryConfig,
        tx: mpsc::Sender<Delivery>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        debug!(%key, "CommandListener::new: called");
        Self {
            store,
            key,
            retry,
            tx,
            shutdown,
            undeleted: None,
        }
    }

    /// Run the listener loop until shutdown or an unrecoverable error
    pub async fn run(mut self) {
        info!(key = %self.key, "CommandListener started");
        let mut backoff = self.retry.backoff();
        // Some(index) while waiting for the inbox to be written
        let mut wait_from: Option<u64> = None;

        loop {
            if let Some(index) = wait_from {
                let result = tokio::select! {
                    _ = self.shutdown.changed() => break,
                    result = self.store.watch_prefix(&self.key, index) => result,
                };
                match result {
                    Ok(event) => {
                        backoff.reset();
                        if event.action.is_write() && event.node.key == self.key {
                            debug!(index = event.index, "CommandListener::run: inbox written");
                            wait_from = None;
                        } else {
                            wait_from = Some(event.index + 1);
                        }
                    }
                    Err(StoreError::HistoryCompacted { wait_index, oldest }) => {
                        info!(wait_index, oldest, "Command watch history compacted, re-reading inbox");
                        wait_from = None;
                    }
                    Err(e) if e.is_transient() => {
                        if !self.pause(&mut backoff, e).await {
                            break;
                        }
                    }
                    Err(e) => {
                        self.fail(e.into()).await;
                        break;
                    }
                }
                continue;
            }

            let result = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = self.store.get(&self.key, false) => result,
            };
            match result {
                Ok(response) => {
                    if !self.consume(response, &mut backoff).await {
                        break;
                    }
                }
                Err(StoreError::NotFound { index, .. }) => {
                    backoff.reset();
                    wait_from = Some(index + 1);
                }
                Err(e) if e.is_transient() => {
                    if !self.pause(&mut backoff, e).await {
                        break;
                    }
                }
                Err(e) => {
                    self.fail(e.into()).await;
                    break;
                }
            }
        }

        info!(key = %self.key, "CommandListener stopped");
    }

    /// Delete and deliver the command just read; false if the loop must end
    async fn consume(&mut self, response: Response, backoff: &mut Backoff) -> bool {
        if response.node.dir {
            self.fail(StoreError::NotAFile { key: self.key.clone() }.into()).await;
            return false;
        }
        let raw = response.node.value.unwrap_or_default();
        let decoded = CommandMessage::decode(&raw);

        let index = response.node.modified_index;
        let mut deliveries = match self.undeleted {
            Some((undeleted, count)) if undeleted == index => count,
            _ => 0,
        };

        let precondition = Precondition::PrevIndex(index);
        let delete_failure = match self.store.compare_and_delete(&self.key, precondition).await {
            Ok(_) => {
                backoff.reset();
                None
            }
            Err(StoreError::NotFound { .. } | StoreError::PreconditionFailed { .. }) => {
                debug!("CommandListener::consume: inbox changed before delete");
                None
            }
            Err(e) if e.is_transient() => Some(e),
            Err(e) => {
                self.fail(e.into()).await;
                return false;
            }
        };

        match decoded {
            Ok(message) if deliveries < MAX_DELIVERIES => {
                info!(command = %message.command, index, "Received command");
                if !self.send(Ok(message)).await {
                    return false;
                }
                deliveries += 1;
            }
            Ok(message) => {
                debug!(command = %message.command, index, "CommandListener::consume: already delivered, retrying delete only");
            }
            Err(e) => warn!(error = %e, %raw, "Skipping undecodable command"),
        }

        match delete_failure {
            Some(e) => {
                warn!(error = %e, "Could not delete command, it may be delivered again");
                self.undeleted = Some((index, deliveries));
                self.pause(backoff, e).await
            }
            None => {
                self.undeleted = None;
                true
            }
        }
    }

    /// Wait out a transient failure; false once retries are exhausted
    async fn pause(&mut self, backoff: &mut Backoff, err: StoreError) -> bool {
        match backoff.next_delay() {
            Some(delay) => {
                warn!(attempt = backoff.attempts(), ?delay, error = %err, "Command inbox unavailable, retrying");
                tokio::select! {
                    _ = self.shutdown.changed() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
            None => {
                self.fail(CoordError::exhausted(&self.retry, err)).await;
                false
            }
        }
    }

    async fn fail(&mut self, err: CoordError) {
        error!(key = %self.key, error = %err, "CommandListener giving up");
        self.send(Err(err)).await;
    }

    async fn send(&mut self, delivery: Delivery) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => false,
            result = self.tx.send(delivery) => result.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, send_command};
    use crate::namespace::Namespace;
    use kvstore::{MemoryStore, Operation};
    use std::time::Duration;

    struct Harness {
        store: Arc<MemoryStore>,
        ns: Namespace,
        rx: mpsc::Receiver<Delivery>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            max_attempts: 3,
        }
    }

    async fn start() -> Harness {
        start_with(retry()).await
    }

    async fn start_with(retry: RetryConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ns = Namespace::new("/testcluster/").unwrap();
        ns.ensure_layout(store.as_ref(), &retry).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = CommandListener::new(store.clone(), ns.command_path("test-1"), retry, tx, shutdown_rx);
        let handle = tokio::spawn(listener.run());
        Harness {
            store,
            ns,
            rx,
            shutdown,
            handle,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for command")
            .expect("listener channel closed")
    }

    async fn quiet(rx: &mut mpsc::Receiver<Delivery>) -> bool {
        tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err()
    }

    #[tokio::test]
    async fn test_command_delivered_once_and_deleted() {
        let mut h = start().await;
        send_command(h.store.as_ref(), &h.ns, "test-1", Command::Freeze, &retry())
            .await
            .unwrap();

        assert_eq!(next(&mut h.rx).await.unwrap().command, Command::Freeze);
        assert!(quiet(&mut h.rx).await);
        assert!(h.store.get(&h.ns.command_path("test-1"), false).await.is_err());

        send_command(
            h.store.as_ref(),
            &h.ns,
            "test-1",
            Command::StopTask {
                task: "test-task0001".to_string(),
            },
            &retry(),
        )
        .await
        .unwrap();
        assert_eq!(
            next(&mut h.rx).await.unwrap().command,
            Command::StopTask {
                task: "test-task0001".to_string()
            }
        );

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_delete_redelivers_once() {
        let mut h = start().await;
        h.store.fail_next(Operation::CompareAndDelete, 1);
        send_command(h.store.as_ref(), &h.ns, "test-1", Command::Balance, &retry())
            .await
            .unwrap();

        assert_eq!(next(&mut h.rx).await.unwrap().command, Command::Balance);
        assert_eq!(next(&mut h.rx).await.unwrap().command, Command::Balance);
        assert!(quiet(&mut h.rx).await);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeated_delete_failures_deliver_at_most_twice() {
        let mut h = start_with(RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            max_attempts: 10,
        })
        .await;
        h.store.fail_next(Operation::CompareAndDelete, 3);
        send_command(h.store.as_ref(), &h.ns, "test-1", Command::Balance, &retry())
            .await
            .unwrap();

        assert_eq!(next(&mut h.rx).await.unwrap().command, Command::Balance);
        assert_eq!(next(&mut h.rx).await.unwrap().command, Command::Balance);
        assert!(quiet(&mut h.rx).await);
        assert!(h.store.get(&h.ns.command_path("test-1"), false).await.is_err());

        // A new command after the stuck one is delivered normally
        send_command(h.store.as_ref(), &h.ns, "test-1", Command::Freeze, &retry())
            .await
            .unwrap();
        assert_eq!(next(&mut h.rx).await.unwrap().command, Command::Freeze);
        assert!(quiet(&mut h.rx).await);

        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_command_is_dropped() {
        let mut h = start().await;
        let key = h.ns.command_path("test-1");
        h.store.set(&key, "self-destruct", None).await.unwrap();

        // The listener deletes the garbage without delivering anything
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.store.get(&key, false).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("undecodable command was never deleted");
        assert!(quiet(&mut h.rx).await);

        send_command(h.store.as_ref(), &h.ns, "test-1", Command::Stop, &retry())
            .await
            .unwrap();
        assert_eq!(next(&mut h.rx).await.unwrap().command, Command::Stop);
        assert!(quiet(&mut h.rx).await);
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_store_escalates() {
        let mut h = start().await;
        h.store.set_available(false);

        let err = next(&mut h.rx).await.unwrap_err();
        assert!(matches!(err, CoordError::TransientStore { .. }));
        h.handle.await.unwrap();
    }
}
