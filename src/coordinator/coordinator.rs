use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tracing::{info, warn};

use super::error::{CoordinatorError, Result};
use super::types::{CoordinatorConfig, UploadOutcome, UploadRequest};
use crate::backend::{BackendManager, ByteRange};
use crate::id::FileIdGenerator;
use crate::metadata::{AccessLevel, FileMetadata, MetadataStore, ReplicationState};
use crate::replication::ReplicationEngine;
use crate::stream::{ChunkStream, StreamingEngine};

/// Composition root: wires uploads and downloads through backend selection,
/// the streaming engine, the replication engine and the metadata store.
pub struct StorageCoordinator {
    config: CoordinatorConfig,
    ids: Arc<FileIdGenerator>,
    backends: Arc<BackendManager>,
    streaming: Arc<StreamingEngine>,
    replication: Arc<ReplicationEngine>,
    metadata: Arc<dyn MetadataStore>,
}

impl StorageCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        ids: Arc<FileIdGenerator>,
        backends: Arc<BackendManager>,
        streaming: Arc<StreamingEngine>,
        replication: Arc<ReplicationEngine>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            config,
            ids,
            backends,
            streaming,
            replication,
            metadata,
        }
    }

    /// Accept an upload: chunk the source through the streaming engine,
    /// commit it atomically to a load-balanced backend, create metadata and
    /// optionally kick off replication.
    ///
    /// A replication kickoff failure does not fail the upload; the file stays
    /// `Pending` for a later sweep or manual retry.
    pub async fn upload<R>(&self, source: R, request: UploadRequest) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stream = self.streaming.open_upload_stream(source, None, None)?;
        let data = stream.collect_bytes().await?;
        let size = data.len() as u64;

        if let Some(limit) = self.config.max_file_size {
            if size > limit {
                return Err(CoordinatorError::QuotaExceeded { size, limit });
            }
        }

        let file_id = self.ids.generate()?;
        let checksum = blake3::hash(&data).to_hex().to_string();

        let backend = self.backends.select_for_upload()?;
        backend.store(&file_id, data.clone()).await?;

        let mut metadata = FileMetadata::new(
            &file_id,
            backend.name(),
            size,
            &checksum,
            &request.mime_type,
            &request.owner,
        );
        metadata.access_level = request.access_level;
        metadata.expires_at = request.expires_at;
        if !request.replicate {
            // Nothing to replicate; a pending marker would read as an orphan.
            metadata.replication = ReplicationState::Completed;
        }
        self.metadata.create(metadata.clone()).await?;

        let replication_job = if request.replicate {
            match self.replication.replicate(&metadata, data, None).await {
                Ok(job_id) => Some(job_id),
                Err(e) => {
                    warn!(file = %file_id, error = %e, "replication kickoff failed, leaving file pending");
                    None
                }
            }
        } else {
            None
        };

        info!(file = %file_id, backend = %metadata.backend, size, "upload accepted");
        metrics::counter!("filegrid_uploads").increment(1);

        Ok(UploadOutcome {
            file_id,
            backend: metadata.backend,
            size,
            checksum,
            replication_job,
        })
    }

    /// Stream a file back out, optionally restricted to a byte range.
    ///
    /// The backend is resolved from the file's recorded backend name, never
    /// through load balancing.
    pub async fn download(
        &self,
        file_id: &str,
        range: Option<ByteRange>,
        requester: Option<&str>,
    ) -> Result<ChunkStream> {
        let metadata = self.lookup(file_id).await?;
        self.check_access(&metadata, requester)?;

        if metadata.is_expired(chrono::Utc::now().timestamp_millis()) {
            return Err(CoordinatorError::Expired(file_id.to_string()));
        }

        let backend = self.backends.backend_for_download(&metadata.backend)?;
        let data = backend.retrieve(&metadata.storage_path, range).await?;

        metrics::counter!("filegrid_downloads").increment(1);
        Ok(self.streaming.open_download_stream(data, None, None)?)
    }

    /// Convenience wrapper collecting the whole download.
    pub async fn download_bytes(
        &self,
        file_id: &str,
        range: Option<ByteRange>,
        requester: Option<&str>,
    ) -> Result<Bytes> {
        Ok(self.download(file_id, range, requester).await?.collect_bytes().await?)
    }

    pub async fn delete(&self, file_id: &str, requester: Option<&str>) -> Result<()> {
        let metadata = self.lookup(file_id).await?;
        self.check_access(&metadata, requester)?;

        let backend = self.backends.backend_for_download(&metadata.backend)?;
        backend.delete(&metadata.storage_path).await?;
        self.metadata.remove_with_id(file_id).await?;

        info!(file = %file_id, "file deleted");
        Ok(())
    }

    pub async fn file_metadata(&self, file_id: &str) -> Result<FileMetadata> {
        self.lookup(file_id).await
    }

    pub async fn shutdown(&self) {
        self.replication.shutdown().await;
        self.streaming.cancel_all();
        self.backends.shutdown().await;
    }

    async fn lookup(&self, file_id: &str) -> Result<FileMetadata> {
        self.metadata
            .find_by_id(file_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(file_id.to_string()))
    }

    /// Authorization proper lives in a separate subsystem; this boundary only
    /// enforces the recorded access level against the claimed requester.
    fn check_access(&self, metadata: &FileMetadata, requester: Option<&str>) -> Result<()> {
        let allowed = match metadata.access_level {
            AccessLevel::Public => true,
            AccessLevel::Internal => requester.is_some(),
            AccessLevel::Private => requester == Some(metadata.owner.as_str()),
        };

        if allowed {
            Ok(())
        } else {
            Err(CoordinatorError::AccessDenied(metadata.id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, SelectionPolicy};
    use crate::id::{FileIdGenerator, IdStrategy};
    use crate::metadata::MemoryMetadataStore;
    use crate::replication::{
        MemoryNodeTransport, NodeInfo, ReplicationConfig,
    };
    use crate::stream::StreamingConfig;
    use std::io::Cursor;
    use std::time::Duration;

    async fn coordinator() -> (StorageCoordinator, Arc<MemoryMetadataStore>) {
        let backends = Arc::new(BackendManager::new(
            SelectionPolicy::RoundRobin,
            Duration::from_millis(100),
            Duration::from_millis(200),
        ));
        backends
            .register(Arc::new(MemoryBackend::new("mem-a")))
            .await
            .unwrap();

        let metadata = Arc::new(MemoryMetadataStore::new());
        let transport = Arc::new(MemoryNodeTransport::new());
        let replication = Arc::new(
            ReplicationEngine::new(
                ReplicationConfig {
                    cluster_nodes: vec![NodeInfo::new("node-1", "mem://node-1")],
                    retry_delay: Duration::from_millis(10),
                    ..Default::default()
                },
                transport,
                metadata.clone(),
            )
            .unwrap(),
        );

        let coordinator = StorageCoordinator::new(
            CoordinatorConfig {
                max_file_size: Some(1024 * 1024),
            },
            Arc::new(FileIdGenerator::new(IdStrategy::Hybrid, 1)),
            backends,
            Arc::new(StreamingEngine::new(StreamingConfig::default()).unwrap()),
            replication,
            metadata.clone(),
        );
        (coordinator, metadata)
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let (coordinator, _metadata) = coordinator().await;
        let payload: Vec<u8> = (0..5000).map(|i| (i % 256) as u8).collect();

        let outcome = coordinator
            .upload(
                Cursor::new(payload.clone()),
                UploadRequest::new("application/octet-stream", "alice"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.size, 5000);
        assert_eq!(outcome.backend, "mem-a");

        let restored = coordinator
            .download_bytes(&outcome.file_id, None, Some("alice"))
            .await
            .unwrap();
        assert_eq!(&restored[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_download_range() {
        let (coordinator, _metadata) = coordinator().await;
        let payload: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();

        let outcome = coordinator
            .upload(
                Cursor::new(payload.clone()),
                UploadRequest::new("text/plain", "alice"),
            )
            .await
            .unwrap();

        let part = coordinator
            .download_bytes(
                &outcome.file_id,
                Some(ByteRange::new(100, Some(200))),
                Some("alice"),
            )
            .await
            .unwrap();
        assert_eq!(&part[..], &payload[100..200]);
    }

    #[tokio::test]
    async fn test_access_levels() {
        let (coordinator, _metadata) = coordinator().await;

        let outcome = coordinator
            .upload(
                Cursor::new(b"secret".to_vec()),
                UploadRequest::new("text/plain", "alice"),
            )
            .await
            .unwrap();

        // Private: owner only.
        assert!(matches!(
            coordinator
                .download_bytes(&outcome.file_id, None, Some("bob"))
                .await,
            Err(CoordinatorError::AccessDenied(_))
        ));
        assert!(matches!(
            coordinator.download_bytes(&outcome.file_id, None, None).await,
            Err(CoordinatorError::AccessDenied(_))
        ));
        assert!(coordinator
            .download_bytes(&outcome.file_id, None, Some("alice"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_quota() {
        let (coordinator, _metadata) = coordinator().await;
        let oversized = vec![0u8; 2 * 1024 * 1024];

        let result = coordinator
            .upload(Cursor::new(oversized), UploadRequest::new("text/plain", "a"))
            .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_file() {
        let (coordinator, _metadata) = coordinator().await;

        let mut request = UploadRequest::new("text/plain", "alice");
        request.expires_at = Some(chrono::Utc::now().timestamp_millis() - 1000);

        let outcome = coordinator
            .upload(Cursor::new(b"old".to_vec()), request)
            .await
            .unwrap();

        assert!(matches!(
            coordinator
                .download_bytes(&outcome.file_id, None, Some("alice"))
                .await,
            Err(CoordinatorError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let (coordinator, metadata) = coordinator().await;

        let outcome = coordinator
            .upload(
                Cursor::new(b"gone soon".to_vec()),
                UploadRequest::new("text/plain", "alice"),
            )
            .await
            .unwrap();

        coordinator.delete(&outcome.file_id, Some("alice")).await.unwrap();

        assert!(metadata.find_by_id(&outcome.file_id).await.unwrap().is_none());
        assert!(matches!(
            coordinator
                .download_bytes(&outcome.file_id, None, Some("alice"))
                .await,
            Err(CoordinatorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unreplicated_upload_not_marked_pending() {
        let (coordinator, metadata) = coordinator().await;

        let outcome = coordinator
            .upload(
                Cursor::new(b"local only".to_vec()),
                UploadRequest::new("text/plain", "alice"),
            )
            .await
            .unwrap();

        let stored = metadata.find_by_id(&outcome.file_id).await.unwrap().unwrap();
        assert_eq!(stored.replication, ReplicationState::Completed);
    }
}
