pub mod engine;
pub mod error;
pub mod throttle;
pub mod transform;
pub mod types;

pub use engine::{ChunkStream, StreamingEngine};
pub use error::{Result, StreamingError};
pub use throttle::{StreamThrottle, ThrottleConfig};
pub use transform::{Lz4Compress, Lz4Decompress, StreamTransform};
pub use types::{ProgressCallback, StreamChunk, StreamEvent, StreamProgress, StreamingConfig};
