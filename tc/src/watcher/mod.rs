//! Task discovery
//!
//! The TaskWatcher follows the tasks directory and feeds candidate task ids to
//! the coordinator. It never claims anything itself.

mod task_watcher;

pub use task_watcher::{TaskWatcher, WatchOutcome, classify};

use kvstore::{Store, StoreResult};
use tracing::debug;

use crate::namespace::{CLAIM_KEY, Namespace};

/// List unclaimed tasks in insertion order, with the index of the listing
pub async fn list_pending(store: &dyn Store, namespace: &Namespace) -> StoreResult<(Vec<String>, u64)> {
    debug!(root = %namespace.root(), "list_pending: called");
    let response = store.get(&namespace.tasks_path(), true).await?;
    let pending: Vec<String> = response
        .node
        .nodes
        .iter()
        .filter(|task| task.dir && task.child(CLAIM_KEY).is_none())
        .map(|task| task.name().to_string())
        .collect();
    debug!(count = pending.len(), index = response.index, "list_pending: done");
    Ok((pending, response.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RetryConfig;
    use kvstore::MemoryStore;

    #[tokio::test]
    async fn test_list_pending_skips_claimed_and_files() {
        let store = MemoryStore::new();
        let ns = Namespace::new("/testcluster/").unwrap();
        ns.ensure_layout(&store, &RetryConfig::default()).await.unwrap();

        for id in ["c", "a", "b"] {
            store.create_dir(&ns.task_path(id), None).await.unwrap();
        }
        store.create(&ns.claim_path("a"), "test-1", None).await.unwrap();
        store.create(&ns.task_path("stray"), "not a task", None).await.unwrap();

        let (pending, index) = list_pending(&store, &ns).await.unwrap();
        assert_eq!(pending, vec!["c".to_string(), "b".to_string()]);
        assert_eq!(index, store.current_index().await.unwrap());
    }
}
