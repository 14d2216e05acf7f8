use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Metadata not found: {0}")]
    NotFound(String),

    #[error("Metadata already exists: {0}")]
    AlreadyExists(String),

    #[error("Metadata store failure: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, MetadataError>;
