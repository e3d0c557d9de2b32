//! MemoryStore - in-process Store implementation
//!
//! All state lives behind one mutex so every operation is atomic with respect
//! to every other. TTL expiry is evaluated lazily: each operation first expires
//! due keys, and blocked watchers wake at the next deadline to do the same, so
//! expiry events reach watchers without a background reaper task.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use crate::types::{Action, Node, Precondition, Response, normalize_key, parent_key};

/// Number of change events retained for watches by default
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Store operations, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    CreateDir,
    Set,
    CompareAndSwap,
    CompareAndDelete,
    Delete,
    Get,
    Watch,
    CurrentIndex,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::CreateDir => "create_dir",
            Operation::Set => "set",
            Operation::CompareAndSwap => "compare_and_swap",
            Operation::CompareAndDelete => "compare_and_delete",
            Operation::Delete => "delete",
            Operation::Get => "get",
            Operation::Watch => "watch",
            Operation::CurrentIndex => "current_index",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    dir: bool,
    expires_at: Option<Instant>,
    created_index: u64,
    modified_index: u64,
}

impl Entry {
    fn snapshot(&self, key: &str, now: Instant) -> Node {
        Node {
            key: key.to_string(),
            value: self.value.clone(),
            dir: self.dir,
            ttl: self.expires_at.map(|at| at.saturating_duration_since(now)),
            created_index: self.created_index,
            modified_index: self.modified_index,
            nodes: Vec::new(),
        }
    }
}

fn subtree_prefix(key: &str) -> String {
    if key == "/" { "/".to_string() } else { format!("{}/", key) }
}

fn is_strict_descendant(key: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return key != "/";
    }
    key.len() > ancestor.len() && key.starts_with(ancestor) && key.as_bytes()[ancestor.len()] == b'/'
}

fn event_matches(prefix: &str, event: &Response) -> bool {
    let key = event.node.key.as_str();
    key == prefix
        || is_strict_descendant(key, prefix)
        || (event.action.is_removal() && is_strict_descendant(prefix, key))
}

fn deadline(ttl: Option<Duration>, now: Instant) -> Option<Instant> {
    ttl.map(|ttl| now + ttl)
}

struct State {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<Response>,
    history_capacity: usize,
    /// Index of the newest event dropped from history
    compacted_through: u64,
    faults: HashMap<Operation, u32>,
    available: bool,
}

impl State {
    fn new(history_capacity: usize) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "/".to_string(),
            Entry {
                value: None,
                dir: true,
                expires_at: None,
                created_index: 0,
                modified_index: 0,
            },
        );
        Self {
            entries,
            index: 0,
            history: VecDeque::new(),
            history_capacity: history_capacity.max(1),
            compacted_through: 0,
            faults: HashMap::new(),
            available: true,
        }
    }

    fn check(&mut self, op: Operation) -> StoreResult<()> {
        if !self.available {
            return Err(StoreError::Unavailable("store unreachable".to_string()));
        }
        if let Some(remaining) = self.faults.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StoreError::Unavailable(format!("injected {} failure", op)));
        }
        Ok(())
    }

    fn next_index(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn record(&mut self, event: Response) {
        self.history.push_back(event);
        while self.history.len() > self.history_capacity {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted_through = dropped.index;
            }
        }
    }

    fn not_found(&self, key: &str) -> StoreError {
        StoreError::NotFound {
            key: key.to_string(),
            index: self.index,
        }
    }

    fn require_parent_dir(&self, key: &str) -> StoreResult<()> {
        let Some(parent) = parent_key(key) else {
            return Err(StoreError::InvalidKey { key: key.to_string() });
        };
        match self.entries.get(parent) {
            None => Err(self.not_found(parent)),
            Some(entry) if !entry.dir => Err(StoreError::NotADirectory {
                key: parent.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn has_children(&self, key: &str) -> bool {
        let prefix = subtree_prefix(key);
        self.entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .any(|(k, _)| k != key)
    }

    /// Remove a key and everything below it, returning the key's entry
    fn remove_tree(&mut self, key: &str) -> Option<Entry> {
        let prefix = subtree_prefix(key);
        let descendants: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, _)| k.clone())
            .collect();
        for child in descendants {
            self.entries.remove(&child);
        }
        self.entries.remove(key)
    }

    fn children(&self, key: &str, recursive: bool, now: Instant) -> Vec<Node> {
        let prefix = subtree_prefix(key);
        let mut nodes: Vec<Node> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != key && !k[prefix.len()..].contains('/'))
            .map(|(k, entry)| {
                let mut node = entry.snapshot(k, now);
                if recursive && entry.dir {
                    node.nodes = self.children(k, true, now);
                }
                node
            })
            .collect();
        nodes.sort_by_key(|n| n.created_index);
        nodes
    }

    /// Expire every key whose TTL has passed; true if anything expired
    fn expire(&mut self, now: Instant) -> bool {
        let mut expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return false;
        }

        // Parents first so expired children of an expired dir are not reported twice
        expired.sort_by_key(|k| k.len());
        for key in expired {
            let Some(entry) = self.remove_tree(&key) else {
                continue;
            };
            let index = self.next_index();
            let prev = entry.snapshot(&key, now);
            let node = Node {
                value: None,
                ttl: None,
                modified_index: index,
                ..prev.clone()
            };
            trace!(%key, index, "expire: key expired");
            self.record(Response {
                action: Action::Expire,
                node,
                prev_node: Some(prev),
                index,
            });
        }
        true
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|entry| entry.expires_at).min()
    }

    fn find_event(&self, prefix: &str, wait_index: u64) -> StoreResult<Option<Response>> {
        if self.compacted_through > 0 && wait_index <= self.compacted_through {
            return Err(StoreError::HistoryCompacted {
                wait_index,
                oldest: self.compacted_through + 1,
            });
        }
        Ok(self
            .history
            .iter()
            .find(|event| event.index >= wait_index && event_matches(prefix, event))
            .cloned())
    }

    fn create(&mut self, key: &str, value: Option<String>, ttl: Option<Duration>, now: Instant) -> StoreResult<Response> {
        if self.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
                index: self.index,
            });
        }
        self.require_parent_dir(key)?;

        let index = self.next_index();
        let entry = Entry {
            dir: value.is_none(),
            value,
            expires_at: deadline(ttl, now),
            created_index: index,
            modified_index: index,
        };
        let node = entry.snapshot(key, now);
        self.entries.insert(key.to_string(), entry);

        let response = Response {
            action: Action::Create,
            node,
            prev_node: None,
            index,
        };
        self.record(response.clone());
        Ok(response)
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>, now: Instant) -> StoreResult<Response> {
        let prev = match self.entries.get(key) {
            Some(entry) if entry.dir => return Err(StoreError::NotAFile { key: key.to_string() }),
            Some(entry) => Some(entry.snapshot(key, now)),
            None => {
                self.require_parent_dir(key)?;
                None
            }
        };

        let index = self.next_index();
        let created_index = prev.as_ref().map_or(index, |p| p.created_index);
        let entry = Entry {
            value: Some(value.to_string()),
            dir: false,
            expires_at: deadline(ttl, now),
            created_index,
            modified_index: index,
        };
        let node = entry.snapshot(key, now);
        self.entries.insert(key.to_string(), entry);

        let response = Response {
            action: Action::Set,
            node,
            prev_node: prev,
            index,
        };
        self.record(response.clone());
        Ok(response)
    }

    /// Look up a file key and verify a precondition against it
    fn checked_file(&self, key: &str, precondition: &Precondition, now: Instant) -> StoreResult<Node> {
        let entry = self.entries.get(key).ok_or_else(|| self.not_found(key))?;
        if entry.dir {
            return Err(StoreError::NotAFile { key: key.to_string() });
        }
        if let Err(reason) = precondition.check(entry.value.as_deref(), entry.modified_index) {
            return Err(StoreError::PreconditionFailed {
                key: key.to_string(),
                reason,
                index: self.index,
            });
        }
        Ok(entry.snapshot(key, now))
    }

    fn compare_and_swap(
        &mut self,
        key: &str,
        value: &str,
        precondition: &Precondition,
        ttl: Option<Duration>,
        now: Instant,
    ) -> StoreResult<Response> {
        let prev = self.checked_file(key, precondition, now)?;
        let index = self.next_index();
        let entry = Entry {
            value: Some(value.to_string()),
            dir: false,
            expires_at: deadline(ttl, now),
            created_index: prev.created_index,
            modified_index: index,
        };
        let node = entry.snapshot(key, now);
        self.entries.insert(key.to_string(), entry);

        let response = Response {
            action: Action::CompareAndSwap,
            node,
            prev_node: Some(prev),
            index,
        };
        self.record(response.clone());
        Ok(response)
    }

    fn compare_and_delete(&mut self, key: &str, precondition: &Precondition, now: Instant) -> StoreResult<Response> {
        let prev = self.checked_file(key, precondition, now)?;
        let index = self.next_index();
        self.entries.remove(key);

        let response = Response {
            action: Action::CompareAndDelete,
            node: Node {
                value: None,
                ttl: None,
                modified_index: index,
                ..prev.clone()
            },
            prev_node: Some(prev),
            index,
        };
        self.record(response.clone());
        Ok(response)
    }

    fn delete(&mut self, key: &str, recursive: bool, now: Instant) -> StoreResult<Response> {
        if key == "/" {
            return Err(StoreError::InvalidKey { key: key.to_string() });
        }
        let entry = self.entries.get(key).ok_or_else(|| self.not_found(key))?;
        if entry.dir && !recursive && self.has_children(key) {
            return Err(StoreError::DirectoryNotEmpty { key: key.to_string() });
        }
        let prev = entry.snapshot(key, now);

        let index = self.next_index();
        self.remove_tree(key);

        let response = Response {
            action: Action::Delete,
            node: Node {
                value: None,
                ttl: None,
                modified_index: index,
                ..prev.clone()
            },
            prev_node: Some(prev),
            index,
        };
        self.record(response.clone());
        Ok(response)
    }

    fn get(&self, key: &str, recursive: bool, now: Instant) -> StoreResult<Response> {
        let entry = self.entries.get(key).ok_or_else(|| self.not_found(key))?;
        let mut node = entry.snapshot(key, now);
        if entry.dir {
            node.nodes = self.children(key, recursive, now);
        }
        Ok(Response {
            action: Action::Get,
            node,
            prev_node: None,
            index: self.index,
        })
    }
}

/// In-process watchable store
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct MemoryStore {
    state: Mutex<State>,
    notify: Notify,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store retaining the default number of events
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create an empty store retaining at most `capacity` events for watches
    pub fn with_history_capacity(capacity: usize) -> Self {
        debug!(capacity, "MemoryStore::with_history_capacity: called");
        Self {
            state: Mutex::new(State::new(capacity)),
            notify: Notify::new(),
        }
    }

    /// Make the next `count` calls of `op` fail with `Unavailable`
    pub fn fail_next(&self, op: Operation, count: u32) {
        debug!(%op, count, "MemoryStore::fail_next: called");
        *self.lock().faults.entry(op).or_insert(0) += count;
    }

    /// Simulate losing (or regaining) the connection to the store
    ///
    /// While unavailable every operation fails with `Unavailable`, including
    /// watches that are already blocked.
    pub fn set_available(&self, available: bool) {
        debug!(available, "MemoryStore::set_available: called");
        self.lock().available = available;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one operation atomically and wake watchers if anything changed
    fn apply<F>(&self, op: Operation, f: F) -> StoreResult<Response>
    where
        F: FnOnce(&mut State, Instant) -> StoreResult<Response>,
    {
        let now = Instant::now();
        let (result, changed) = {
            let mut state = self.lock();
            let expired = state.expire(now);
            let result = match state.check(op) {
                Ok(()) => f(&mut state, now),
                Err(e) => Err(e),
            };
            let changed = expired || result.as_ref().is_ok_and(|r| r.action != Action::Get);
            (result, changed)
        };
        if changed {
            self.notify.notify_waiters();
        }
        result
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response> {
        debug!(%key, ?ttl, "create: called");
        let key = normalize_key(key)?;
        self.apply(Operation::Create, |state, now| {
            state.create(&key, Some(value.to_string()), ttl, now)
        })
    }

    async fn create_dir(&self, key: &str, ttl: Option<Duration>) -> StoreResult<Response> {
        debug!(%key, ?ttl, "create_dir: called");
        let key = normalize_key(key)?;
        self.apply(Operation::CreateDir, |state, now| state.create(&key, None, ttl, now))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<Response> {
        debug!(%key, ?ttl, "set: called");
        let key = normalize_key(key)?;
        self.apply(Operation::Set, |state, now| state.set(&key, value, ttl, now))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        precondition: Precondition,
        ttl: Option<Duration>,
    ) -> StoreResult<Response> {
        debug!(%key, ?precondition, ?ttl, "compare_and_swap: called");
        let key = normalize_key(key)?;
        self.apply(Operation::CompareAndSwap, |state, now| {
            state.compare_and_swap(&key, value, &precondition, ttl, now)
        })
    }

    async fn compare_and_delete(&self, key: &str, precondition: Precondition) -> StoreResult<Response> {
        debug!(%key, ?precondition, "compare_and_delete: called");
        let key = normalize_key(key)?;
        self.apply(Operation::CompareAndDelete, |state, now| {
            state.compare_and_delete(&key, &precondition, now)
        })
    }

    async fn delete(&self, key: &str, recursive: bool) -> StoreResult<Response> {
        debug!(%key, recursive, "delete: called");
        let key = normalize_key(key)?;
        self.apply(Operation::Delete, |state, now| state.delete(&key, recursive, now))
    }

    async fn get(&self, key: &str, recursive: bool) -> StoreResult<Response> {
        debug!(%key, recursive, "get: called");
        let key = normalize_key(key)?;
        self.apply(Operation::Get, |state, now| state.get(&key, recursive, now))
    }

    async fn watch_prefix(&self, prefix: &str, wait_index: u64) -> StoreResult<Response> {
        debug!(%prefix, wait_index, "watch_prefix: called");
        let prefix = normalize_key(prefix)?;
        let mut wait_index = wait_index;

        loop {
            // Register interest before inspecting state so no wake-up is missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let (outcome, next_deadline, expired) = {
                let mut state = self.lock();
                state.check(Operation::Watch)?;
                let expired = state.expire(now);
                if wait_index == 0 {
                    wait_index = state.index + 1;
                }
                (
                    state.find_event(&prefix, wait_index),
                    state.next_deadline(),
                    expired,
                )
            };
            if expired {
                self.notify.notify_waiters();
            }
            if let Some(event) = outcome? {
                debug!(%prefix, action = %event.action, key = %event.node.key, index = event.index, "watch_prefix: event");
                return Ok(event);
            }

            match next_deadline {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn current_index(&self) -> StoreResult<u64> {
        debug!("current_index: called");
        let now = Instant::now();
        let expired;
        let result = {
            let mut state = self.lock();
            expired = state.expire(now);
            state.check(Operation::CurrentIndex).map(|_| state.index)
        };
        if expired {
            self.notify.notify_waiters();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn store_with_dirs(dirs: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for dir in dirs {
            store.create_dir(dir, None).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store_with_dirs(&["/ns"]).await;

        let created = store.create("/ns/key", "value", None).await.unwrap();
        assert_eq!(created.action, Action::Create);
        assert_eq!(created.index, 2);

        let got = store.get("/ns/key", false).await.unwrap();
        assert_eq!(got.node.value.as_deref(), Some("value"));
        assert_eq!(got.node.created_index, 2);
        assert!(!got.node.dir);
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let store = store_with_dirs(&["/ns"]).await;
        store.create("/ns/key", "first", None).await.unwrap();

        let err = store.create("/ns/key", "second", None).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let got = store.get("/ns/key", false).await.unwrap();
        assert_eq!(got.node.value.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let err = store.create("/missing/key", "v", None).await.unwrap_err();
        match err {
            StoreError::NotFound { key, .. } => assert_eq!(key, "/missing"),
            other => panic!("Expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_under_file_fails() {
        let store = MemoryStore::new();
        store.create("/file", "v", None).await.unwrap();
        let err = store.create("/file/child", "v", None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotADirectory { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_create_has_single_winner() {
        let store = Arc::new(store_with_dirs(&["/ns"]).await);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create("/ns/lock", &format!("node-{}", i), None).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_get_lists_children_in_insertion_order() {
        let store = store_with_dirs(&["/ns", "/ns/tasks"]).await;
        store.create_dir("/ns/tasks/zeta", None).await.unwrap();
        store.create_dir("/ns/tasks/alpha", None).await.unwrap();
        store.create("/ns/tasks/alpha/owner", "node-1", None).await.unwrap();

        let shallow = store.get("/ns/tasks", false).await.unwrap();
        let names: Vec<&str> = shallow.node.nodes.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert!(shallow.node.nodes[1].nodes.is_empty());

        let deep = store.get("/ns/tasks", true).await.unwrap();
        let alpha = deep.node.child("alpha").unwrap();
        assert_eq!(
            alpha.child("owner").and_then(|n| n.value.as_deref()),
            Some("node-1")
        );
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        store.create("/lease", "node-1", None).await.unwrap();

        let err = store
            .compare_and_swap("/lease", "node-2", Precondition::PrevValue("node-2".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));

        let swapped = store
            .compare_and_swap(
                "/lease",
                "node-1",
                Precondition::PrevValue("node-1".to_string()),
                Some(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        assert_eq!(swapped.action, Action::CompareAndSwap);
        assert!(swapped.node.ttl.is_some());
        assert_eq!(swapped.prev_node.unwrap().ttl, None);

        let err = store
            .compare_and_swap("/missing", "x", Precondition::PrevIndex(1), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStore::new();
        store.create("/claim", "node-1", None).await.unwrap();

        let err = store
            .compare_and_delete("/claim", Precondition::PrevValue("node-2".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));

        store
            .compare_and_delete("/claim", Precondition::PrevValue("node-1".to_string()))
            .await
            .unwrap();
        assert!(store.get("/claim", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let store = store_with_dirs(&["/ns"]).await;
        store.create("/ns/child", "v", None).await.unwrap();

        let err = store.delete("/ns", false).await.unwrap_err();
        assert!(matches!(err, StoreError::DirectoryNotEmpty { .. }));

        store.delete("/ns", true).await.unwrap();
        assert!(store.get("/ns/child", false).await.unwrap_err().is_not_found());
        assert!(store.get("/ns", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_ttl_expiry_removes_subtree() {
        let store = MemoryStore::new();
        store.create_dir("/task", Some(Duration::from_millis(50))).await.unwrap();
        store.create("/task/owner", "node-1", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(store.get("/task", false).await.unwrap_err().is_not_found());
        assert!(store.get("/task/owner", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watch_blocks_until_change() {
        let store = Arc::new(store_with_dirs(&["/ns", "/ns/tasks"]).await);
        let index = store.current_index().await.unwrap();

        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch_prefix("/ns/tasks", index + 1).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!watcher.is_finished());

        store.create("/ns/other", "ignored", None).await.unwrap();
        store.create_dir("/ns/tasks/t1", None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.action, Action::Create);
        assert_eq!(event.node.key, "/ns/tasks/t1");
    }

    #[tokio::test]
    async fn test_watch_returns_past_events() {
        let store = store_with_dirs(&["/ns"]).await;
        let first = store.create("/ns/a", "1", None).await.unwrap();
        store.create("/ns/b", "2", None).await.unwrap();

        let event = store.watch_prefix("/ns", first.index).await.unwrap();
        assert_eq!(event.node.key, "/ns/a");

        let event = store.watch_prefix("/ns", first.index + 1).await.unwrap();
        assert_eq!(event.node.key, "/ns/b");
    }

    #[tokio::test]
    async fn test_watch_reports_expiry() {
        let store = Arc::new(store_with_dirs(&["/ns"]).await);
        let created = store
            .create("/ns/owner", "node-1", Some(Duration::from_millis(50)))
            .await
            .unwrap();

        let event = tokio::time::timeout(
            Duration::from_secs(1),
            store.watch_prefix("/ns", created.index + 1),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(event.action, Action::Expire);
        assert_eq!(event.node.key, "/ns/owner");
        assert_eq!(
            event.prev_node.and_then(|n| n.value),
            Some("node-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_watch_reports_ancestor_removal() {
        let store = store_with_dirs(&["/ns", "/ns/tasks"]).await;
        let deleted = store.delete("/ns", true).await.unwrap();

        let event = store.watch_prefix("/ns/tasks", deleted.index).await.unwrap();
        assert_eq!(event.action, Action::Delete);
        assert_eq!(event.node.key, "/ns");
    }

    #[tokio::test]
    async fn test_watch_history_compacted() {
        let store = MemoryStore::with_history_capacity(2);
        for i in 0..5 {
            store.create(&format!("/k{}", i), "v", None).await.unwrap();
        }

        let err = store.watch_prefix("/", 1).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::HistoryCompacted {
                wait_index: 1,
                oldest: 4
            }
        );

        let event = store.watch_prefix("/", 4).await.unwrap();
        assert_eq!(event.node.key, "/k3");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next(Operation::Create, 1);

        let err = store.create("/a", "v", None).await.unwrap_err();
        assert!(err.is_transient());
        store.create("/a", "v", None).await.unwrap();

        store.set_available(false);
        assert!(store.get("/a", false).await.unwrap_err().is_transient());
        assert!(store.watch_prefix("/", 0).await.unwrap_err().is_transient());

        store.set_available(true);
        assert!(store.get("/a", false).await.is_ok());
    }

    #[tokio::test]
    async fn test_blocked_watch_fails_when_store_goes_away() {
        let store = Arc::new(MemoryStore::new());
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch_prefix("/", 0).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set_available(false);

        let result = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_transient());
    }
}
