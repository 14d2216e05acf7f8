use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid backend config: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Size mismatch: declared {expected} bytes, wrote {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("No healthy backend available")]
    NoHealthyBackend,

    #[error("Backend already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Backend not registered: {0}")]
    NotRegistered(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend {backend} failed during {operation}: {source}")]
    OperationFailed {
        backend: String,
        operation: &'static str,
        #[source]
        source: Box<BackendError>,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Wrap a backend-local failure with the backend and operation name so it
    /// is never surfaced bare.
    pub fn in_operation(self, backend: &str, operation: &'static str) -> Self {
        BackendError::OperationFailed {
            backend: backend.to_string(),
            operation,
            source: Box::new(self),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Http(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
