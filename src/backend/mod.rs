pub mod error;
pub mod local;
pub mod manager;
pub mod memory;
pub mod object;
pub mod types;

pub use error::{BackendError, Result};
pub use local::LocalBackend;
pub use manager::{BackendEvent, BackendManager};
pub use memory::MemoryBackend;
pub use object::HttpObjectBackend;
pub use types::{
    BackendCapabilities, BackendConfig, BackendHealth, BackendKind, ByteRange, EncryptionConfig,
    HealthStatus, ObjectInfo, OpStats, RetryPolicy, SelectionPolicy,
};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Capability interface for a pluggable byte-storage target.
///
/// Keys are file identifiers; the raw blobs are meaningless without the
/// metadata store. `store` must be atomic from the caller's point of view:
/// either the full payload is committed under `key` or nothing is.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn store(&self, key: &str, data: Bytes) -> Result<()>;

    /// Retrieve the payload, optionally restricted to a byte range.
    async fn retrieve(&self, key: &str, range: Option<ByteRange>) -> Result<Bytes>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn metadata(&self, key: &str) -> Result<ObjectInfo>;

    async fn list_files(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    fn capabilities(&self) -> BackendCapabilities;

    /// Probe the backend and report a freshly computed health snapshot.
    async fn health(&self) -> BackendHealth;

    async fn signed_url(&self, _key: &str, _expires_in: Duration) -> Result<String> {
        Err(BackendError::Unsupported("signed_url"))
    }
}
