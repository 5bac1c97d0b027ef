//! State management module.
//!
//! This module persists the last-applied state of every resource, guards it
//! with an exclusive lock per key, and commits changes one resource at a
//! time during an apply.

mod envelope;
mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use envelope::{decode, encode, STATE_FORMAT};
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, StateLock, LOCK_EXPIRY_SECS, LOCK_REFRESH_INTERVAL};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{ResourceState, StateDocument, StateUpdate, STATE_VERSION};
