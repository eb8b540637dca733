//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Documents are opaque bytes addressed by name; the app lock serializes
//! transactions across processes.

use async_trait::async_trait;

use crate::config::{StateBackend, StateConfig};
use crate::error::{ConfigError, Result};

use super::lock::LockInfo;
use super::{LocalStateStore, MemoryStateStore, S3StateStore};

/// Trait for state storage backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads a document.
    ///
    /// Returns `StateError::NoState` if nothing was saved under `name`.
    async fn get_state(&self, name: &str) -> Result<Vec<u8>>;

    /// Saves a document, replacing any previous content.
    async fn save_state(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Acquires the app lock.
    ///
    /// Returns `StateError::LockedByOther` while another holder's lock is
    /// still valid.
    async fn lock_app(&self) -> Result<LockInfo>;

    /// Releases the app lock if `lock_id` still holds it.
    async fn unlock_app(&self, lock_id: &str) -> Result<()>;

    /// Extends the app lock held by `lock_id` and returns the refreshed lock.
    ///
    /// Returns `StateError::LockNotHeld` if `lock_id` no longer holds a
    /// valid lock.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Checks whether `lock_id` currently holds a valid app lock.
    async fn is_app_locked(&self, lock_id: &str) -> Result<bool>;

    /// Gets current lock information if locked.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn get_state(&self, name: &str) -> Result<Vec<u8>> {
        (**self).get_state(name).await
    }

    async fn save_state(&self, name: &str, bytes: &[u8]) -> Result<()> {
        (**self).save_state(name, bytes).await
    }

    async fn lock_app(&self) -> Result<LockInfo> {
        (**self).lock_app().await
    }

    async fn unlock_app(&self, lock_id: &str) -> Result<()> {
        (**self).unlock_app(lock_id).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).refresh_lock(lock_id).await
    }

    async fn is_app_locked(&self, lock_id: &str) -> Result<bool> {
        (**self).is_app_locked(lock_id).await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Opens the backend selected by the configuration.
///
/// # Errors
///
/// Returns an error if the backend settings are incomplete or the backend
/// cannot be initialized.
pub async fn open(config: &StateConfig, app_name: &str) -> Result<Box<dyn StateStore>> {
    match config.backend {
        StateBackend::Local => {
            let store = match &config.path {
                Some(path) => LocalStateStore::with_base_dir(path),
                None => LocalStateStore::for_app(app_name)?,
            };
            Ok(Box::new(store))
        }
        StateBackend::Memory => Ok(Box::new(MemoryStateStore::new())),
        StateBackend::S3 => {
            let bucket = config
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 backend requires a bucket", "state.bucket"))?;
            let prefix = config
                .prefix
                .clone()
                .unwrap_or_else(|| app_name.to_string());
            let store = S3StateStore::new(bucket, Some(&prefix), config.region.as_deref()).await?;
            Ok(Box::new(store))
        }
    }
}
