pub mod coordinator;
pub mod error;
pub mod types;

pub use coordinator::StorageCoordinator;
pub use error::{CoordinatorError, Result};
pub use types::{CoordinatorConfig, UploadOutcome, UploadRequest};
