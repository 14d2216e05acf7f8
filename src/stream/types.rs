use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::throttle::ThrottleConfig;

/// A bounded, checksummed slice of a byte stream.
///
/// Chunks for a given stream are emitted in strictly increasing index order;
/// the checksum covers this chunk's own bytes so a consumer can verify each
/// chunk independently.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub data: Bytes,
    pub index: u64,
    pub is_last: bool,
    pub checksum: [u8; 32],
}

impl StreamChunk {
    pub fn new(data: Bytes, index: u64, is_last: bool) -> Self {
        let checksum = *blake3::hash(&data).as_bytes();
        Self {
            data,
            index,
            is_last,
            checksum,
        }
    }

    /// Verify the chunk's payload against its checksum.
    pub fn verify(&self) -> bool {
        *blake3::hash(&self.data).as_bytes() == self.checksum
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Progress snapshot, recomputed after every chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProgress {
    pub stream_id: String,
    pub bytes_processed: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<f32>,
    pub speed_bps: u64,
    pub eta: Option<Duration>,
}

impl StreamProgress {
    pub fn compute(
        stream_id: &str,
        bytes_processed: u64,
        total_bytes: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        let elapsed_ms = elapsed.as_millis().max(1) as u64;
        let speed_bps = bytes_processed * 1000 / elapsed_ms;

        let percent = total_bytes.filter(|t| *t > 0).map(|total| {
            (bytes_processed as f32 / total as f32 * 100.0).min(100.0)
        });

        let eta = match (total_bytes, speed_bps) {
            (Some(total), speed) if speed > 0 && total > bytes_processed => {
                Some(Duration::from_secs((total - bytes_processed) / speed))
            }
            _ => None,
        };

        Self {
            stream_id: stream_id.to_string(),
            bytes_processed,
            total_bytes,
            percent,
            speed_bps,
            eta,
        }
    }
}

/// Callback invoked with a fresh progress snapshot after every chunk.
pub type ProgressCallback = Arc<dyn Fn(&StreamProgress) + Send + Sync>;

/// Events emitted by the streaming engine for operational tooling.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Started {
        stream_id: String,
        total_bytes: Option<u64>,
    },
    Progress {
        stream_id: String,
        progress: StreamProgress,
    },
    Completed {
        stream_id: String,
    },
    Cancelled {
        stream_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub chunk_size: usize,
    pub max_open_streams: usize,
    pub throttle: Option<ThrottleConfig>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            max_open_streams: num_cpus::get() * 4,
            throttle: None,
        }
    }
}
