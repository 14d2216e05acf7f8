use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::error::{BackendError, Result};
use super::types::{BackendCapabilities, BackendHealth, ByteRange, HealthStatus, ObjectInfo};
use super::StorageBackend;

struct StoredObject {
    data: Bytes,
    modified_at: i64,
}

/// In-memory backend for tests and demos.
///
/// `set_failing(true)` makes every operation and health probe fail, which is
/// how manager tests drive backends unhealthy.
pub struct MemoryBackend {
    name: String,
    objects: RwLock<HashMap<String, StoredObject>>,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.objects.write().clear();
        Ok(())
    }

    async fn store(&self, key: &str, data: Bytes) -> Result<()> {
        self.check_available()?;
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                data,
                modified_at: chrono::Utc::now().timestamp_millis(),
            },
        );
        Ok(())
    }

    async fn retrieve(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        self.check_available()?;
        let objects = self.objects.read();
        let object = objects
            .get(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;

        Ok(match range {
            Some(range) => range.apply(&object.data),
            None => object.data.clone(),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.objects.read().contains_key(key))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.check_available()?;
        let data = {
            let objects = self.objects.read();
            objects
                .get(from)
                .ok_or_else(|| BackendError::NotFound(from.to_string()))?
                .data
                .clone()
        };
        self.store(to, data).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    async fn metadata(&self, key: &str) -> Result<ObjectInfo> {
        self.check_available()?;
        let objects = self.objects.read();
        let object = objects
            .get(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;

        Ok(ObjectInfo {
            key: key.to_string(),
            size: object.data.len() as u64,
            modified_at: object.modified_at,
        })
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.check_available()?;
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                modified_at: object.modified_at,
            })
            .collect())
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_ranges: true,
            supports_signed_urls: false,
            supports_copy: true,
            max_file_size: None,
        }
    }

    async fn health(&self) -> BackendHealth {
        if self.failing.load(Ordering::SeqCst) {
            return BackendHealth::unhealthy(0);
        }
        BackendHealth {
            status: HealthStatus::Healthy,
            latency_ms: 0,
            error_rate: 0.0,
            last_checked: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_retrieve_delete() {
        let backend = MemoryBackend::new("mem");

        backend.store("k", Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(&backend.retrieve("k", None).await.unwrap()[..], b"abc");

        backend.delete("k").await.unwrap();
        assert!(matches!(
            backend.retrieve("k", None).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = MemoryBackend::new("mem");
        backend.set_failing(true);

        assert!(backend.store("k", Bytes::new()).await.is_err());
        assert_eq!(backend.health().await.status, HealthStatus::Unhealthy);

        backend.set_failing(false);
        assert!(backend.store("k", Bytes::new()).await.is_ok());
    }
}
