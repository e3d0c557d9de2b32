//! Per-node command inboxes
//!
//! Each node owns `<root>/commands/<node-id>`. Anyone may write a command
//! there; the owning node's CommandListener consumes it.

mod listener;
mod types;

pub use listener::CommandListener;
pub use types::{Command, CommandMessage};

use kvstore::{Response, Store};
use tracing::{debug, info};

use crate::coordinator::RetryConfig;
use crate::error::CoordError;
use crate::namespace::{Namespace, validate_segment};
use crate::retry::with_retry;

/// Write a command into a node's inbox, replacing any unread one
pub async fn send_command(
    store: &dyn Store,
    namespace: &Namespace,
    node_id: &str,
    command: Command,
    retry: &RetryConfig,
) -> Result<Response, CoordError> {
    debug!(%node_id, %command, "send_command: called");
    validate_segment("node id", node_id)?;
    let key = namespace.command_path(node_id);
    let payload = CommandMessage::new(command.clone()).encode()?;

    match with_retry(retry, "send command", || store.set(&key, &payload, None)).await {
        Ok(response) => {
            info!(%node_id, %command, "Sent command");
            Ok(response)
        }
        Err(e) if e.is_transient() => Err(CoordError::exhausted(retry, e)),
        Err(e) => Err(e.into()),
    }
}
