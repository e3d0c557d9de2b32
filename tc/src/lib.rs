//! taskcoord - distributed task claiming over a watchable key-value store
//!
//! Worker processes publish tasks as directories in a shared store and use a
//! [`Coordinator`] to discover, exclusively claim and release them. The store
//! is the only channel between workers: claims are atomic create-if-absent
//! writes, kept alive by TTL renewal, and reclaimed by other nodes once a
//! holder stops renewing.
//!
//! # Modules
//!
//! - [`coordinator`] - the per-node coordinator and its configuration
//! - [`claim`] - claim creation, release and lease renewal
//! - [`watcher`] - task discovery
//! - [`command`] - per-node command inboxes
//! - [`namespace`] - key layout
//! - [`config`] - configuration file loading
//! - [`simulate`] - in-process fleet simulation
//! - [`cli`] - command-line interface

pub mod claim;
pub mod cli;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod namespace;
pub mod retry;
pub mod simulate;
pub mod watcher;

pub use claim::{ClaimEvent, ClaimManager, LeaseManager};
pub use command::{Command, CommandListener, CommandMessage, send_command};
pub use config::{Config, StoreConfig};
pub use coordinator::{Coordinator, CoordinatorConfig, RetryConfig};
pub use error::CoordError;
pub use namespace::Namespace;
pub use retry::{Backoff, with_retry};
pub use simulate::{SimulationConfig, SimulationReport, simulate};
pub use watcher::{TaskWatcher, list_pending};
