//! Claim and lease management
//!
//! A claim is the `owner` key under a task directory, created only if absent
//! so that the store alone decides which node wins. The LeaseManager keeps each
//! claim alive by refreshing its TTL until it is released or lost.

mod lease;
mod manager;

pub use lease::LeaseManager;
pub use manager::ClaimManager;

/// Ownership changes observed by one coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEvent {
    /// This node now owns the task
    Claimed { task_id: String },

    /// This node gave the task up
    Released { task_id: String },

    /// The lease could not be renewed; another node may now own the task
    Lost { task_id: String, reason: String },
}

impl ClaimEvent {
    pub fn task_id(&self) -> &str {
        match self {
            ClaimEvent::Claimed { task_id } | ClaimEvent::Released { task_id } | ClaimEvent::Lost { task_id, .. } => {
                task_id
            }
        }
    }
}
