//! Namespace layout
//!
//! Every key a coordinator touches is derived here:
//!
//! ```text
//! <root>/tasks/<task-id>          task announcement (directory)
//! <root>/tasks/<task-id>/owner    claim key, value = owning node id
//! <root>/commands/<node-id>       command inbox
//! ```

use kvstore::{Store, StoreError, normalize_key};
use tracing::debug;

use crate::coordinator::RetryConfig;
use crate::error::CoordError;
use crate::retry::with_retry;

pub const TASKS_DIR: &str = "tasks";
pub const COMMANDS_DIR: &str = "commands";
pub const CLAIM_KEY: &str = "owner";

/// Check that a task or node id is usable as a single path segment
pub fn validate_segment(kind: &'static str, value: &str) -> Result<(), CoordError> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.contains('/') {
        Some("must not contain '/'")
    } else if value == "." || value == ".." {
        Some("must not be '.' or '..'")
    } else if value.trim().is_empty() {
        Some("must not be blank")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(CoordError::InvalidPath {
            kind,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Where a key sits relative to the tasks directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKey {
    /// The tasks directory itself
    Root,
    /// A task announcement
    Task(String),
    /// The claim key of a task
    Claim(String),
    /// Anything else below a task
    Nested(String),
}

/// Immutable namespace root with derived paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
}

impl Namespace {
    /// Parse and normalize a namespace root such as `/testcluster/`
    pub fn new(root: &str) -> Result<Self, CoordError> {
        debug!(%root, "Namespace::new: called");
        let normalized = normalize_key(root).map_err(|_| CoordError::InvalidPath {
            kind: "namespace",
            value: root.to_string(),
            reason: "must be an absolute path without empty, '.' or '..' segments",
        })?;
        if normalized == "/" {
            return Err(CoordError::InvalidPath {
                kind: "namespace",
                value: root.to_string(),
                reason: "must not be the store root",
            });
        }
        Ok(Self { root: normalized })
    }

    /// Normalized root, without trailing slash
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn tasks_path(&self) -> String {
        format!("{}/{}", self.root, TASKS_DIR)
    }

    pub fn task_path(&self, task_id: &str) -> String {
        format!("{}/{}/{}", self.root, TASKS_DIR, task_id)
    }

    pub fn claim_path(&self, task_id: &str) -> String {
        format!("{}/{}/{}/{}", self.root, TASKS_DIR, task_id, CLAIM_KEY)
    }

    pub fn commands_path(&self) -> String {
        format!("{}/{}", self.root, COMMANDS_DIR)
    }

    pub fn command_path(&self, node_id: &str) -> String {
        format!("{}/{}/{}", self.root, COMMANDS_DIR, node_id)
    }

    /// Classify a key under the tasks directory; None for keys outside it
    pub fn task_key(&self, key: &str) -> Option<TaskKey> {
        let tasks = self.tasks_path();
        let rest = key.strip_prefix(&tasks)?;
        if rest.is_empty() {
            return Some(TaskKey::Root);
        }
        let rest = rest.strip_prefix('/')?;
        let mut parts = rest.splitn(2, '/');
        let task_id = parts.next()?.to_string();
        match parts.next() {
            None => Some(TaskKey::Task(task_id)),
            Some(CLAIM_KEY) => Some(TaskKey::Claim(task_id)),
            Some(_) => Some(TaskKey::Nested(task_id)),
        }
    }

    /// True if removing `key` would remove the tasks directory
    pub fn covers_tasks(&self, key: &str) -> bool {
        let tasks = self.tasks_path();
        key == "/" || key == tasks || tasks.starts_with(&format!("{}/", key))
    }

    /// Create the root, tasks and commands directories if missing
    pub async fn ensure_layout(&self, store: &dyn Store, retry: &RetryConfig) -> Result<(), CoordError> {
        debug!(root = %self.root, "Namespace::ensure_layout: called");
        for dir in self.layout_dirs() {
            match with_retry(retry, "create namespace dir", || store.create_dir(&dir, None)).await {
                Ok(_) => debug!(%dir, "Namespace::ensure_layout: created"),
                Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(CoordError::init(format!("cannot create {}", dir), e)),
            }
        }
        Ok(())
    }

    /// Ancestors of the root (outermost first) followed by the fixed sub-directories
    fn layout_dirs(&self) -> Vec<String> {
        let mut dirs = Vec::new();
        let mut current = String::new();
        for segment in self.root[1..].split('/') {
            current.push('/');
            current.push_str(segment);
            dirs.push(current.clone());
        }
        dirs.push(self.tasks_path());
        dirs.push(self.commands_path());
        dirs
    }
}
