//! KvStore - hierarchical watchable key-value store
//!
//! Defines the [`Store`] capability consumed by coordination code and ships
//! [`MemoryStore`], an in-process implementation with the same semantics as a
//! networked store: directories, TTL expiry, atomic create-if-absent,
//! compare-and-swap, and blocking prefix watches over a bounded change history.
//!
//! # Keys
//!
//! Keys are absolute slash-separated paths (`/cluster/tasks/t1`). A trailing
//! slash is ignored. Every key except `/` has a parent directory that must
//! exist before the key can be created.
//!
//! # Indexes
//!
//! Every mutation (including TTL expiry) advances a single store-wide index.
//! Watches are expressed as "the first change at or after index N".

mod error;
mod memory;
mod store;
mod types;

pub use error::{StoreError, StoreResult};
pub use memory::{DEFAULT_HISTORY_CAPACITY, MemoryStore, Operation};
pub use store::Store;
pub use types::{Action, Node, Precondition, Response, normalize_key, parent_key};
