//! In-memory state store for tests and embedding.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{KeystoneError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo};
use super::store::StateStore;

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<String, Vec<u8>>,
    lock: Option<LockInfo>,
}

/// State store keeping documents in process memory.
#[derive(Debug)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    holder: String,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            holder: generate_holder_id(),
        }
    }

    fn inner(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| KeystoneError::State(StateError::backend("memory store mutex poisoned")))
    }

    /// Names of the stored documents, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store mutex is poisoned.
    pub fn document_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.inner()?.documents.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_state(&self, name: &str) -> Result<Vec<u8>> {
        self.inner()?.documents.get(name).cloned().ok_or_else(|| {
            KeystoneError::State(StateError::NoState {
                name: name.to_string(),
            })
        })
    }

    async fn save_state(&self, name: &str, bytes: &[u8]) -> Result<()> {
        debug!("Saving {} bytes to memory document {name}", bytes.len());
        self.inner()?.documents.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn lock_app(&self) -> Result<LockInfo> {
        let mut inner = self.inner()?;
        if let Some(existing) = inner.lock.as_ref().filter(|lock| !lock.is_expired()) {
            return Err(existing.conflict());
        }
        let lock = LockInfo::new(&self.holder);
        inner.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn unlock_app(&self, lock_id: &str) -> Result<()> {
        let mut inner = self.inner()?;
        if inner.lock.as_ref().is_some_and(|lock| lock.lock_id == lock_id) {
            inner.lock = None;
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut inner = self.inner()?;
        let lock = inner
            .lock
            .as_mut()
            .filter(|lock| lock.is_held_by(lock_id))
            .ok_or_else(|| StateError::LockNotHeld {
                lock_id: lock_id.to_string(),
            })?;
        lock.refresh();
        Ok(lock.clone())
    }

    async fn is_app_locked(&self, lock_id: &str) -> Result<bool> {
        Ok(self
            .inner()?
            .lock
            .as_ref()
            .is_some_and(|lock| lock.is_held_by(lock_id)))
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner()?.lock.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
