use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdError {
    #[error("Custom strategy selected but no generator function supplied")]
    MissingCustomGenerator,

    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(usize),
}

pub type Result<T> = std::result::Result<T, IdError>;
