//! Coordinator - task discovery, claiming and release for one node
//!
//! The Coordinator owns a TaskWatcher, a CommandListener, a ClaimManager and
//! a LeaseManager. Callers pull claimed tasks with `watch()`, hand them back
//! with `release()`, and receive fleet commands with `command()`.

mod config;
mod core;

pub use config::{CoordinatorConfig, RetryConfig};
pub use core::Coordinator;

pub use crate::claim::ClaimEvent;
