//! State management module for Keystone.
//!
//! This module provides persistent storage for the model and resource
//! documents and the transaction journal, plus the app lock that keeps
//! transactions from overlapping.

mod local;
mod lock;
mod memory;
mod s3;
mod store;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{open, StateStore};

#[cfg(test)]
pub use store::MockStateStore;
