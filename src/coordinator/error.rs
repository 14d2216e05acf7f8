use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Access denied for file {0}")]
    AccessDenied(String),

    #[error("Quota exceeded: {size} bytes over the {limit}-byte limit")]
    QuotaExceeded { size: u64, limit: u64 },

    #[error("File expired: {0}")]
    Expired(String),

    #[error("Id error: {0}")]
    Id(#[from] crate::id::IdError),

    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] crate::stream::StreamingError),

    #[error("Replication error: {0}")]
    Replication(#[from] crate::replication::ReplicationError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] crate::metadata::MetadataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
