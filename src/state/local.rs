//! Local file-based state storage backend.
//!
//! This module provides a directory-based state store for local development
//! and single-machine use. Documents are written atomically through a
//! temporary file and a rename.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{KeystoneError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;

/// Default state directory name.
pub const STATE_DIR: &str = ".keystone";

/// Lock file name.
const LOCK_FILE: &str = "app.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Holder recorded in locks taken by this store.
    holder: String,
}

impl LocalStateStore {
    /// Creates a new local state store under `.keystone` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| KeystoneError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store in the user data directory, one directory per app.
    ///
    /// # Errors
    ///
    /// Returns an error if no data directory is available on this platform.
    pub fn for_app(app_name: &str) -> Result<Self> {
        let base_dir = dirs::data_local_dir()
            .ok_or_else(|| KeystoneError::internal("Cannot determine local data directory"))?
            .join("keystone")
            .join(app_name);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            lock_path,
            holder: generate_holder_id(),
        }
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn document_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::io("create state directory", &self.base_dir, &e))?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a temporary file.
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.ensure_dir().await?;

        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::io("create", &temp_path, &e))?;

        file.write_all(content)
            .await
            .map_err(|e| StateError::io("write", &temp_path, &e))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::io("sync", &temp_path, &e))?;

        // Atomic rename
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::io("rename", path, &e))?;

        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            KeystoneError::State(StateError::corrupted(format!("Failed to read lock file: {e}")))
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            KeystoneError::State(StateError::corrupted(format!("Failed to parse lock file: {e}")))
        })?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                KeystoneError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get_state(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.document_path(name);
        if !path.exists() {
            debug!("State file does not exist: {}", path.display());
            return Err(KeystoneError::State(StateError::NoState {
                name: name.to_string(),
            }));
        }

        info!("Loading state from: {}", path.display());

        fs::read(&path).await.map_err(|e| {
            KeystoneError::State(StateError::corrupted(format!("Failed to read {name}: {e}")))
        })
    }

    async fn save_state(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.document_path(name);
        info!("Saving state to: {}", path.display());
        self.write_atomic(&path, bytes).await?;
        debug!("State saved successfully");
        Ok(())
    }

    async fn lock_app(&self) -> Result<LockInfo> {
        // Check for existing lock
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(existing.conflict());
            }
            // Lock is expired, we can take it
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(&self.holder);
        let content = serde_json::to_vec_pretty(&lock_info).map_err(|e| {
            KeystoneError::State(StateError::LockFailed {
                message: format!("Failed to serialize lock: {e}"),
            })
        })?;
        let lock_path = self.lock_path.clone();
        self.write_atomic(&lock_path, &content).await?;

        info!(
            "Acquired app lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn unlock_app(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released app lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = self
            .read_lock_file()
            .await?
            .filter(|lock| lock.is_held_by(lock_id))
            .ok_or_else(|| StateError::LockNotHeld {
                lock_id: lock_id.to_string(),
            })?;
        lock.refresh();

        let content = serde_json::to_vec_pretty(&lock).map_err(|e| {
            KeystoneError::State(StateError::LockFailed {
                message: format!("Failed to serialize lock: {e}"),
            })
        })?;
        let lock_path = self.lock_path.clone();
        self.write_atomic(&lock_path, &content).await?;
        debug!("Refreshed app lock {lock_id} until {}", lock.expires_at);
        Ok(lock)
    }

    async fn is_app_locked(&self, lock_id: &str) -> Result<bool> {
        Ok(self
            .read_lock_file()
            .await?
            .is_some_and(|lock| lock.is_held_by(lock_id)))
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
