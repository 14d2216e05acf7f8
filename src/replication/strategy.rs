//! Replication strategies.
//!
//! A strategy copies a file's bytes to a set of target nodes. Selection is
//! deterministic from file characteristics: media streams fan out in
//! parallel, large files go chunk-by-chunk, everything else in one shot.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::time::Duration;

use super::error::Result;
use super::transport::NodeTransport;
use super::types::{NodeInfo, ReplicationConfig, StrategyKind};
use crate::metadata::FileMetadata;
use crate::stream::StreamChunk;

/// How many targets the streaming strategy serves concurrently.
const STREAMING_FANOUT: usize = 8;

/// Everything a strategy needs for one replication attempt.
pub struct ReplicationContext {
    pub file_id: String,
    pub data: Bytes,
    pub targets: Vec<NodeInfo>,
    pub transport: Arc<dyn NodeTransport>,
    pub chunk_size: usize,
    /// Invoked with 0.0..=100.0 as the attempt makes progress.
    pub progress: Arc<dyn Fn(f32) + Send + Sync>,
}

impl ReplicationContext {
    fn chunks(&self) -> Vec<StreamChunk> {
        let total = self.data.len();
        if total == 0 {
            return vec![StreamChunk::new(Bytes::new(), 0, true)];
        }

        let mut chunks = Vec::new();
        let mut offset = 0;
        let mut index = 0u64;
        while offset < total {
            let end = (offset + self.chunk_size).min(total);
            chunks.push(StreamChunk::new(
                self.data.slice(offset..end),
                index,
                end == total,
            ));
            offset = end;
            index += 1;
        }
        chunks
    }
}

#[async_trait]
pub trait ReplicationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Whether this strategy is suited to the file.
    fn can_handle(&self, metadata: &FileMetadata) -> bool;

    /// Rough duration estimate so a caller can reason about suitability
    /// before committing.
    fn estimated_time(&self, metadata: &FileMetadata) -> Duration;

    async fn replicate(&self, ctx: &ReplicationContext) -> Result<()>;
}

/// Single-shot copy to each target in turn.
pub struct DirectStrategy {
    large_file_threshold: u64,
}

impl DirectStrategy {
    pub fn new(large_file_threshold: u64) -> Self {
        Self {
            large_file_threshold,
        }
    }
}

#[async_trait]
impl ReplicationStrategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    fn can_handle(&self, metadata: &FileMetadata) -> bool {
        !metadata.is_media() && metadata.size < self.large_file_threshold
    }

    fn estimated_time(&self, metadata: &FileMetadata) -> Duration {
        // Assume ~10 MB/s per target.
        Duration::from_millis(metadata.size / 10_000 + 50)
    }

    async fn replicate(&self, ctx: &ReplicationContext) -> Result<()> {
        let chunk = StreamChunk::new(ctx.data.clone(), 0, true);
        let total = ctx.targets.len().max(1);

        for (done, node) in ctx.targets.iter().enumerate() {
            ctx.transport
                .replicate_chunk(node, &ctx.file_id, &chunk)
                .await?;
            (ctx.progress)((done + 1) as f32 / total as f32 * 100.0);
        }
        Ok(())
    }
}

/// Chunk-by-chunk copy for large files, target by target.
pub struct ChunkedStrategy {
    large_file_threshold: u64,
}

impl ChunkedStrategy {
    pub fn new(large_file_threshold: u64) -> Self {
        Self {
            large_file_threshold,
        }
    }
}

#[async_trait]
impl ReplicationStrategy for ChunkedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Chunked
    }

    fn can_handle(&self, metadata: &FileMetadata) -> bool {
        metadata.size >= self.large_file_threshold
    }

    fn estimated_time(&self, metadata: &FileMetadata) -> Duration {
        // Chunking adds a round trip per chunk; assume ~5 MB/s per target.
        Duration::from_millis(metadata.size / 5_000 + 100)
    }

    async fn replicate(&self, ctx: &ReplicationContext) -> Result<()> {
        let chunks = ctx.chunks();
        let total_units = (chunks.len() * ctx.targets.len()).max(1);
        let mut done = 0usize;

        for node in &ctx.targets {
            for chunk in &chunks {
                ctx.transport
                    .replicate_chunk(node, &ctx.file_id, chunk)
                    .await?;
                done += 1;
                (ctx.progress)(done as f32 / total_units as f32 * 100.0);
            }
        }
        Ok(())
    }
}

/// Parallel fan-out for audio/video: every target receives the chunk
/// sequence concurrently.
pub struct StreamingStrategy;

#[async_trait]
impl ReplicationStrategy for StreamingStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Streaming
    }

    fn can_handle(&self, metadata: &FileMetadata) -> bool {
        metadata.is_media()
    }

    fn estimated_time(&self, metadata: &FileMetadata) -> Duration {
        // Targets run concurrently; assume ~8 MB/s for the slowest.
        Duration::from_millis(metadata.size / 8_000 + 50)
    }

    async fn replicate(&self, ctx: &ReplicationContext) -> Result<()> {
        let chunks = Arc::new(ctx.chunks());
        let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let total = ctx.targets.len().max(1);

        let results: Vec<Result<()>> = stream::iter(ctx.targets.clone())
            .map(|node| {
                let chunks = chunks.clone();
                let transport = ctx.transport.clone();
                let file_id = ctx.file_id.clone();
                let done = done.clone();
                let progress = ctx.progress.clone();
                async move {
                    for chunk in chunks.iter() {
                        transport.replicate_chunk(&node, &file_id, chunk).await?;
                    }
                    let finished = done.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    progress(finished as f32 / total as f32 * 100.0);
                    Ok(())
                }
            })
            .buffer_unordered(STREAMING_FANOUT)
            .collect()
            .await;

        for result in results {
            result?;
        }
        Ok(())
    }
}

/// Deterministic strategy selection from file characteristics.
///
/// Media streams, large files chunk, everything else goes direct.
pub fn select_strategy(metadata: &FileMetadata, config: &ReplicationConfig) -> StrategyKind {
    if metadata.is_media() {
        StrategyKind::Streaming
    } else if metadata.size >= config.large_file_threshold {
        StrategyKind::Chunked
    } else {
        StrategyKind::Direct
    }
}

/// Build the full strategy set for a config.
pub fn strategy_set(config: &ReplicationConfig) -> Vec<Arc<dyn ReplicationStrategy>> {
    vec![
        Arc::new(DirectStrategy::new(config.large_file_threshold)),
        Arc::new(ChunkedStrategy::new(config.large_file_threshold)),
        Arc::new(StreamingStrategy),
    ]
}
