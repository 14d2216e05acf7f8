use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::error::{BackendError, Result};
use super::types::{BackendCapabilities, BackendHealth, ByteRange, HealthStatus, ObjectInfo, OpStats};
use super::StorageBackend;

/// Local filesystem backend.
///
/// Stores commit through a temp file plus atomic rename; a reader never sees a
/// partially written object under its final key.
pub struct LocalBackend {
    name: String,
    base_path: PathBuf,
    stats: OpStats,
}

impl LocalBackend {
    pub fn new(name: impl Into<String>, base_path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.as_ref().to_path_buf(),
            stats: OpStats::default(),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(key))
    }

    async fn store_inner(&self, key: &str, data: &Bytes) -> Result<()> {
        let final_path = self.object_path(key)?;
        let tmp_path = self
            .base_path
            .join(format!("{key}.tmp-{:08x}", rand::random::<u32>()));

        let declared = data.len() as u64;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let written = file.metadata().await?.len();
        if written != declared {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(BackendError::SizeMismatch {
                expected: declared,
                actual: written,
            });
        }

        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| BackendError::from(e).in_operation(&self.name, "initialize"))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn store(&self, key: &str, data: Bytes) -> Result<()> {
        let result = self.store_inner(key, &data).await;
        self.stats.record(result.is_ok());
        result.map_err(|e| e.in_operation(&self.name, "store"))
    }

    async fn retrieve(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let path = self.object_path(key)?;
        if !path.exists() {
            self.stats.record(false);
            return Err(BackendError::NotFound(key.to_string()));
        }

        let result = tokio::fs::read(&path).await.map(Bytes::from);
        self.stats.record(result.is_ok());

        let data = result.map_err(|e| BackendError::from(e).in_operation(&self.name, "retrieve"))?;
        Ok(match range {
            Some(range) => range.apply(&data),
            None => data,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if !path.exists() {
            return Err(BackendError::NotFound(key.to_string()));
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| BackendError::from(e).in_operation(&self.name, "delete"))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key)?.exists())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.object_path(from)?;
        let dst = self.object_path(to)?;
        if !src.exists() {
            return Err(BackendError::NotFound(from.to_string()));
        }
        tokio::fs::copy(&src, &dst)
            .await
            .map(|_| ())
            .map_err(|e| BackendError::from(e).in_operation(&self.name, "copy"))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.object_path(from)?;
        let dst = self.object_path(to)?;
        if !src.exists() {
            return Err(BackendError::NotFound(from.to_string()));
        }
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| BackendError::from(e).in_operation(&self.name, "rename"))
    }

    async fn metadata(&self, key: &str) -> Result<ObjectInfo> {
        let path = self.object_path(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| BackendError::NotFound(key.to_string()))?;

        let modified_at = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Ok(ObjectInfo {
            key: key.to_string(),
            size: meta.len(),
            modified_at,
        })
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .map_err(|e| BackendError::from(e).in_operation(&self.name, "list_files"))?;

        let mut objects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackendError::from(e).in_operation(&self.name, "list_files"))?
        {
            let key = entry.file_name().to_string_lossy().to_string();
            // Uncommitted temp artifacts are not objects.
            if key.contains(".tmp-") || !key.starts_with(prefix) {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                if meta.is_file() {
                    objects.push(ObjectInfo {
                        key,
                        size: meta.len(),
                        modified_at: meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_millis() as i64)
                            .unwrap_or_default(),
                    });
                }
            }
        }

        Ok(objects)
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
        let start = Instant::now();
        let ok = tokio::fs::metadata(&self.base_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let latency_ms = start.elapsed().as_millis() as u64;

        if !ok {
            return BackendHealth::unhealthy(latency_ms);
        }

        let error_rate = self.stats.error_rate();
        let status = if error_rate > 0.5 {
            HealthStatus::Unhealthy
        } else if error_rate > 0.1 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        BackendHealth {
            status,
            latency_ms,
            error_rate,
            last_checked: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_backend() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new("local-test", dir.path());
        backend.initialize().await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let (_dir, backend) = create_backend().await;

        backend
            .store("file-1", Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let data = backend.retrieve("file-1", None).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn test_retrieve_range() {
        let (_dir, backend) = create_backend().await;

        backend
            .store("file-1", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let data = backend
            .retrieve("file-1", Some(ByteRange::new(3, Some(7))))
            .await
            .unwrap();
        assert_eq!(&data[..], b"3456");
    }

    #[tokio::test]
    async fn test_store_leaves_no_temp_artifacts() {
        let (dir, backend) = create_backend().await;

        backend
            .store("file-1", Bytes::from_static(b"payload"))
            .await
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_missing() {
        let (_dir, backend) = create_backend().await;

        let result = backend.retrieve("absent", None).await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, backend) = create_backend().await;

        backend
            .store("file-1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(backend.exists("file-1").await.unwrap());

        backend.delete("file-1").await.unwrap();
        assert!(!backend.exists("file-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_and_rename() {
        let (_dir, backend) = create_backend().await;

        backend
            .store("file-1", Bytes::from_static(b"data"))
            .await
            .unwrap();

        backend.copy("file-1", "file-2").await.unwrap();
        assert!(backend.exists("file-1").await.unwrap());
        assert!(backend.exists("file-2").await.unwrap());

        backend.rename("file-2", "file-3").await.unwrap();
        assert!(!backend.exists("file-2").await.unwrap());
        assert_eq!(
            &backend.retrieve("file-3", None).await.unwrap()[..],
            b"data"
        );
    }

    #[tokio::test]
    async fn test_list_files_with_prefix() {
        let (_dir, backend) = create_backend().await;

        backend.store("a-1", Bytes::from_static(b"1")).await.unwrap();
        backend.store("a-2", Bytes::from_static(b"22")).await.unwrap();
        backend.store("b-1", Bytes::from_static(b"3")).await.unwrap();

        let listed = backend.list_files("a-").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|o| o.key.starts_with("a-")));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let (_dir, backend) = create_backend().await;

        let result = backend
            .store("../escape", Bytes::from_static(b"x"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_health_reports_healthy() {
        let (_dir, backend) = create_backend().await;

        let health = backend.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_base_missing() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        let backend = LocalBackend::new("local-test", &missing);

        let health = backend.health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }
}
