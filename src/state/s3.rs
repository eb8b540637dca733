//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) so several operators can share one app's documents.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{KeystoneError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;

/// Lock object key suffix.
const LOCK_KEY: &str = "app.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Holder recorded in locks taken by this store.
    holder: String,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            holder: generate_holder_id(),
        }
    }

    /// Gets the full S3 key for a document.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    KeystoneError::State(StateError::backend(format!("Failed to read S3 object: {e}")))
                })?;
                Ok(Some(bytes.to_vec()))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(KeystoneError::State(StateError::backend(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| KeystoneError::State(StateError::backend(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                KeystoneError::State(StateError::backend(format!("S3 delete error: {e}")))
            })?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock_info: LockInfo = serde_json::from_slice(&content).map_err(|e| {
            KeystoneError::State(StateError::corrupted(format!("Failed to parse lock: {e}")))
        })?;
        Ok(Some(lock_info))
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn get_state(&self, name: &str) -> Result<Vec<u8>> {
        let key = self.key(name);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(bytes) => {
                info!("Loaded {name} ({} bytes)", bytes.len());
                Ok(bytes)
            }
            None => {
                debug!("No state found in S3");
                Err(KeystoneError::State(StateError::NoState {
                    name: name.to_string(),
                }))
            }
        }
    }

    async fn save_state(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let key = self.key(name);
        info!("Saving state to s3://{}/{key}", self.bucket);
        self.put_object(&key, bytes).await?;
        debug!("State saved successfully to S3");
        Ok(())
    }

    async fn lock_app(&self) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock().await? {
            if !existing.is_expired() {
                return Err(existing.conflict());
            }
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(&self.holder);
        let content = serde_json::to_vec_pretty(&lock_info).map_err(|e| {
            KeystoneError::State(StateError::LockFailed {
                message: format!("Failed to serialize lock: {e}"),
            })
        })?;

        self.put_object(&self.key(LOCK_KEY), &content).await?;

        info!(
            "Acquired app lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn unlock_app(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
            .read_lock()
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
        self.put_object(&self.key(LOCK_KEY), &content).await?;
        debug!("Refreshed app lock {lock_id} until {}", lock.expires_at);
        Ok(lock)
    }

    async fn is_app_locked(&self, lock_id: &str) -> Result<bool> {
        Ok(self
            .read_lock()
            .await?
            .is_some_and(|lock| lock.is_held_by(lock_id)))
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("apps/t/")), "apps/t/");
        assert_eq!(normalize_prefix(Some("/apps/t")), "apps/t/");
    }
}
