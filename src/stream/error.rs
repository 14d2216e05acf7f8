use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamingError {
    #[error("Too many open streams (limit {0})")]
    TooManyStreams(usize),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    #[error("Invalid split size: {0}")]
    InvalidSplitSize(usize),

    #[error("Transform {name} failed: {reason}")]
    TransformFailed { name: String, reason: String },

    #[error("Chunk {index} checksum mismatch")]
    ChecksumMismatch { index: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamingError>;
