//! Node, response, and precondition types shared by all stores

use std::fmt;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Kind of operation that produced a [`Response`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Get,
    Create,
    Set,
    CompareAndSwap,
    CompareAndDelete,
    Delete,
    Expire,
}

impl Action {
    /// True for actions that remove a key from the store
    pub fn is_removal(&self) -> bool {
        matches!(self, Action::Delete | Action::CompareAndDelete | Action::Expire)
    }

    /// True for actions that leave a key with a (new) value
    pub fn is_write(&self) -> bool {
        matches!(self, Action::Create | Action::Set | Action::CompareAndSwap)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Get => "get",
            Action::Create => "create",
            Action::Set => "set",
            Action::CompareAndSwap => "compareAndSwap",
            Action::CompareAndDelete => "compareAndDelete",
            Action::Delete => "delete",
            Action::Expire => "expire",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of a key (file or directory)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    /// File value; always None for directories
    pub value: Option<String>,
    pub dir: bool,
    /// Time left before expiry, None for keys without a TTL
    pub ttl: Option<Duration>,
    pub created_index: u64,
    pub modified_index: u64,
    /// Children of a directory in insertion order (filled by `get`)
    pub nodes: Vec<Node>,
}

impl Node {
    /// Last path segment of the key
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }

    /// Find a direct child by name
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }
}

/// Result of a store operation or a watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub action: Action,
    pub node: Node,
    /// Previous state of the key for overwrites, deletes, and expiries
    pub prev_node: Option<Node>,
    /// Store index after the operation
    pub index: u64,
}

/// Condition that must hold for a conditional write or delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    PrevValue(String),
    PrevIndex(u64),
}

impl Precondition {
    /// Check the condition against the current value and modified index
    pub fn check(&self, value: Option<&str>, modified_index: u64) -> Result<(), String> {
        match self {
            Precondition::PrevValue(expected) => {
                if value == Some(expected.as_str()) {
                    Ok(())
                } else {
                    Err(format!("[{} != {}]", expected, value.unwrap_or("")))
                }
            }
            Precondition::PrevIndex(expected) => {
                if *expected == modified_index {
                    Ok(())
                } else {
                    Err(format!("[{} != {}]", expected, modified_index))
                }
            }
        }
    }
}

/// Normalize a key to its canonical form
///
/// Keys must be absolute; trailing slashes are dropped and empty, `.` or `..`
/// segments are rejected.
pub fn normalize_key(key: &str) -> StoreResult<String> {
    if !key.starts_with('/') {
        return Err(StoreError::InvalidKey { key: key.to_string() });
    }
    let trimmed = key.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    let valid = trimmed[1..]
        .split('/')
        .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if !valid {
        return Err(StoreError::InvalidKey { key: key.to_string() });
    }
    Ok(trimmed.to_string())
}

/// Parent directory of a normalized key (`/` has no parent)
pub fn parent_key(key: &str) -> Option<&str> {
    if key == "/" {
        return None;
    }
    match key.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&key[..idx]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("/testcluster/").unwrap(), "/testcluster");
        assert_eq!(normalize_key("/").unwrap(), "/");
        assert_eq!(normalize_key("/a/b").unwrap(), "/a/b");
        assert!(normalize_key("a/b").is_err());
        assert!(normalize_key("/a//b").is_err());
        assert!(normalize_key("/a/../b").is_err());
    }

    #[test]
    fn test_parent_key() {
        assert_eq!(parent_key("/a/b"), Some("/a"));
        assert_eq!(parent_key("/a"), Some("/"));
        assert_eq!(parent_key("/"), None);
    }

    #[test]
    fn test_precondition_check() {
        let cond = Precondition::PrevValue("node-1".to_string());
        assert!(cond.check(Some("node-1"), 7).is_ok());
        assert!(cond.check(Some("node-2"), 7).is_err());
        assert!(cond.check(None, 7).is_err());

        let cond = Precondition::PrevIndex(7);
        assert!(cond.check(Some("x"), 7).is_ok());
        assert!(cond.check(Some("x"), 8).is_err());
    }

    #[test]
    fn test_node_child_lookup() {
        let owner = Node {
            key: "/ns/tasks/t1/owner".to_string(),
            value: Some("node-1".to_string()),
            dir: false,
            ttl: None,
            created_index: 4,
            modified_index: 4,
            nodes: vec![],
        };
        let task = Node {
            key: "/ns/tasks/t1".to_string(),
            value: None,
            dir: true,
            ttl: None,
            created_index: 3,
            modified_index: 3,
            nodes: vec![owner],
        };
        assert_eq!(task.name(), "t1");
        assert_eq!(task.child("owner").and_then(|n| n.value.as_deref()), Some("node-1"));
        assert!(task.child("missing").is_none());
    }
}
