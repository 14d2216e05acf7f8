use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, warn};

use super::error::{Result, StreamingError};
use super::throttle::StreamThrottle;
use super::transform::{apply_all, finalize_all, StreamTransform};
use super::types::{
    ProgressCallback, StreamChunk, StreamEvent, StreamProgress, StreamingConfig,
};
use crate::backend::ByteRange;

const CHANNEL_DEPTH: usize = 4;

/// A consumer handle for an open chunk stream.
///
/// Chunks arrive in strictly increasing index order through a bounded channel,
/// so a slow consumer backpressures the producer instead of buffering the
/// whole payload.
pub struct ChunkStream {
    id: String,
    rx: mpsc::Receiver<Result<StreamChunk>>,
}

impl ChunkStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next chunk, or `None` once the stream has terminated (completed or
    /// cancelled — cancellation is a normal terminal state, not an error).
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk>> {
        self.rx.recv().await
    }

    /// Drain the stream and concatenate every chunk payload.
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?.data);
        }
        Ok(out.freeze())
    }

    /// Drain the stream into a chunk list.
    pub async fn collect_chunks(mut self) -> Result<Vec<StreamChunk>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }
}

struct StreamHandle {
    cancel_tx: watch::Sender<bool>,
}

/// Turns arbitrary byte sources into bounded, progress-reporting, cancellable
/// chunk sequences.
pub struct StreamingEngine {
    config: StreamingConfig,
    registry: Arc<DashMap<String, StreamHandle>>,
    semaphore: Arc<Semaphore>,
    throttle: Arc<StreamThrottle>,
    event_tx: Option<mpsc::Sender<StreamEvent>>,
}

impl StreamingEngine {
    pub fn new(config: StreamingConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(StreamingError::InvalidChunkSize(0));
        }

        let throttle = match config.throttle {
            Some(tc) => StreamThrottle::new(tc),
            None => StreamThrottle::unlimited(),
        };

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_open_streams)),
            registry: Arc::new(DashMap::new()),
            throttle: Arc::new(throttle),
            event_tx: None,
            config,
        })
    }

    /// Attach an event channel for monitoring.
    pub fn with_events(mut self, tx: mpsc::Sender<StreamEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    pub fn active_streams(&self) -> usize {
        self.registry.len()
    }

    /// Open an upload stream over an arbitrary byte source.
    ///
    /// Source reads are buffered until at least one chunk's worth is
    /// available, then exactly `chunk_size` bytes are sliced off per chunk;
    /// the chunk draining the final remainder is tagged `is_last`. Progress
    /// is recomputed after every chunk.
    pub fn open_upload_stream<R>(
        &self,
        source: R,
        total_bytes: Option<u64>,
        progress: Option<ProgressCallback>,
    ) -> Result<ChunkStream>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| StreamingError::TooManyStreams(self.config.max_open_streams))?;

        let stream_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.registry
            .insert(stream_id.clone(), StreamHandle { cancel_tx });

        metrics::counter!("filegrid_streams_opened").increment(1);
        self.try_emit(StreamEvent::Started {
            stream_id: stream_id.clone(),
            total_bytes,
        });

        let worker = StreamWorker {
            stream_id: stream_id.clone(),
            chunk_size: self.config.chunk_size,
            total_bytes,
            progress,
            registry: self.registry.clone(),
            throttle: self.throttle.clone(),
            event_tx: self.event_tx.clone(),
        };

        tokio::spawn(async move {
            worker.run(source, tx, cancel_rx).await;
            drop(permit);
        });

        Ok(ChunkStream { id: stream_id, rx })
    }

    /// Open a download stream over an in-memory payload, optionally
    /// restricted to a byte range, chunked identically to uploads.
    pub fn open_download_stream(
        &self,
        data: Bytes,
        range: Option<ByteRange>,
        progress: Option<ProgressCallback>,
    ) -> Result<ChunkStream> {
        let ranged = match range {
            Some(range) => range.apply(&data),
            None => data,
        };
        let total = ranged.len() as u64;
        self.open_upload_stream(Cursor::new(ranged), Some(total), progress)
    }

    /// Pass a stream through an ordered transform pipeline.
    ///
    /// Each transform's `finalize` runs exactly once after the source is
    /// exhausted, in transform order, with non-empty outputs appended to the
    /// outgoing stream. Chunks are re-indexed; empty transform outputs are
    /// dropped. The derived stream shares the source stream's cancellation.
    pub fn transform_stream(
        &self,
        mut input: ChunkStream,
        mut transforms: Vec<Box<dyn StreamTransform>>,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let id = format!("{}-transformed", input.id);

        tokio::spawn(async move {
            let mut index = 0u64;
            let mut pending: Option<Bytes> = None;

            while let Some(item) = input.next_chunk().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let out = match apply_all(&mut transforms, chunk.data) {
                    Ok(out) => out,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                if out.is_empty() {
                    continue;
                }

                if let Some(prev) = pending.take() {
                    if tx
                        .send(Ok(StreamChunk::new(prev, index, false)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    index += 1;
                }
                pending = Some(out);
            }

            let tails = match finalize_all(&mut transforms) {
                Ok(tails) => tails,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            for tail in tails {
                if let Some(prev) = pending.take() {
                    if tx
                        .send(Ok(StreamChunk::new(prev, index, false)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    index += 1;
                }
                pending = Some(tail);
            }

            if let Some(last) = pending.take() {
                let _ = tx.send(Ok(StreamChunk::new(last, index, true))).await;
            }
        });

        ChunkStream { id, rx }
    }

    /// Concatenate N streams in declaration order.
    ///
    /// Stream `i + 1` is not touched until stream `i` is fully drained; the
    /// merged stream completes only when every source has completed.
    pub fn merge_streams(&self, sources: Vec<ChunkStream>) -> ChunkStream {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let id = uuid::Uuid::new_v4().to_string();

        tokio::spawn(async move {
            let mut index = 0u64;
            let mut pending: Option<Bytes> = None;

            for mut source in sources {
                while let Some(item) = source.next_chunk().await {
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    if chunk.is_empty() {
                        continue;
                    }

                    if let Some(prev) = pending.take() {
                        if tx
                            .send(Ok(StreamChunk::new(prev, index, false)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        index += 1;
                    }
                    pending = Some(chunk.data);
                }
            }

            if let Some(last) = pending.take() {
                let _ = tx.send(Ok(StreamChunk::new(last, index, true))).await;
            }
        });

        ChunkStream { id, rx }
    }

    /// Partition a payload into `ceil(len / max_size_per_stream)` sub-streams
    /// of at most `max_size_per_stream` bytes each; the last may be smaller.
    pub fn split_stream(
        &self,
        data: Bytes,
        max_size_per_stream: usize,
    ) -> Result<Vec<ChunkStream>> {
        if max_size_per_stream == 0 {
            return Err(StreamingError::InvalidSplitSize(0));
        }

        let mut streams = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + max_size_per_stream).min(data.len());
            let part = data.slice(offset..end);
            streams.push(self.open_download_stream(part, None, None)?);
            offset = end;
        }
        Ok(streams)
    }

    /// Cancel an open stream: the underlying reader is released, the stream
    /// is removed from the registry, and a cancellation event is emitted.
    pub fn cancel_stream(&self, stream_id: &str) -> Result<()> {
        let handle = self
            .registry
            .get(stream_id)
            .ok_or_else(|| StreamingError::StreamNotFound(stream_id.to_string()))?;

        let _ = handle.cancel_tx.send(true);
        Ok(())
    }

    /// Cancel every open stream (used on shutdown).
    pub fn cancel_all(&self) {
        for entry in self.registry.iter() {
            let _ = entry.value().cancel_tx.send(true);
        }
    }

    fn try_emit(&self, event: StreamEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.try_send(event);
        }
    }
}

struct StreamWorker {
    stream_id: String,
    chunk_size: usize,
    total_bytes: Option<u64>,
    progress: Option<ProgressCallback>,
    registry: Arc<DashMap<String, StreamHandle>>,
    throttle: Arc<StreamThrottle>,
    event_tx: Option<mpsc::Sender<StreamEvent>>,
}

impl StreamWorker {
    async fn run<R>(
        self,
        mut source: R,
        tx: mpsc::Sender<Result<StreamChunk>>,
        mut cancel_rx: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let mut buf = BytesMut::with_capacity(self.chunk_size * 2);
        let mut index = 0u64;
        let mut bytes_processed = 0u64;
        let mut eof = false;
        let mut cancelled = false;

        'stream: loop {
            // Buffer until more than one chunk is available or the source is
            // exhausted, so the final full-size chunk still gets tagged.
            while !eof && buf.len() <= self.chunk_size {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        cancelled = true;
                        break 'stream;
                    }
                    read = source.read_buf(&mut buf) => match read {
                        Ok(0) => eof = true,
                        Ok(_) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e.into())).await;
                            self.finish(false, started);
                            return;
                        }
                    }
                }
            }

            if buf.is_empty() && eof {
                break;
            }

            let take = self.chunk_size.min(buf.len());
            let data = buf.split_to(take).freeze();
            let is_last = eof && buf.is_empty();

            self.throttle.acquire(data.len()).await;
            bytes_processed += data.len() as u64;

            let chunk = StreamChunk::new(data, index, is_last);
            index += 1;

            tokio::select! {
                _ = cancel_rx.changed() => {
                    cancelled = true;
                    break 'stream;
                }
                sent = tx.send(Ok(chunk)) => {
                    // Receiver dropped: nobody is listening anymore.
                    if sent.is_err() {
                        cancelled = true;
                        break 'stream;
                    }
                }
            }

            let progress = StreamProgress::compute(
                &self.stream_id,
                bytes_processed,
                self.total_bytes,
                started.elapsed(),
            );
            if let Some(ref callback) = self.progress {
                callback(&progress);
            }
            if let Some(ref events) = self.event_tx {
                let _ = events.try_send(StreamEvent::Progress {
                    stream_id: self.stream_id.clone(),
                    progress,
                });
            }

            if is_last {
                break;
            }
        }

        self.finish(!cancelled, started);
    }

    fn finish(&self, completed: bool, started: Instant) {
        self.registry.remove(&self.stream_id);

        if completed {
            debug!(stream = %self.stream_id, elapsed_ms = started.elapsed().as_millis() as u64, "stream completed");
            metrics::counter!("filegrid_streams_completed").increment(1);
            if let Some(ref events) = self.event_tx {
                let _ = events.try_send(StreamEvent::Completed {
                    stream_id: self.stream_id.clone(),
                });
            }
        } else {
            warn!(stream = %self.stream_id, "stream terminated before completion");
            metrics::counter!("filegrid_streams_cancelled").increment(1);
            if let Some(ref events) = self.event_tx {
                let _ = events.try_send(StreamEvent::Cancelled {
                    stream_id: self.stream_id.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::transform::{Lz4Compress, Lz4Decompress};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn engine() -> StreamingEngine {
        StreamingEngine::new(StreamingConfig {
            chunk_size: 1024,
            max_open_streams: 8,
            throttle: None,
        })
        .unwrap()
    }

    fn pattern(size: usize) -> Bytes {
        Bytes::from((0..size).map(|i| (i % 256) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_chunk_sizes_and_last_tag() {
        let engine = engine();
        let data = pattern(2560);

        let stream = engine.open_download_stream(data, None, None).unwrap();
        let chunks = stream.collect_chunks().await.unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1024);
        assert_eq!(chunks[1].len(), 1024);
        assert_eq!(chunks[2].len(), 512);

        assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
        assert!(chunks[2].is_last);
        assert!(chunks.iter().all(|c| c.verify()));
    }

    #[tokio::test]
    async fn test_single_small_chunk() {
        let engine = engine();
        let stream = engine
            .open_download_stream(pattern(13), None, None)
            .unwrap();
        let chunks = stream.collect_chunks().await.unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 13);
        assert!(chunks[0].is_last);
    }

    #[tokio::test]
    async fn test_exact_multiple_of_chunk_size() {
        let engine = engine();
        let stream = engine
            .open_download_stream(pattern(2048), None, None)
            .unwrap();
        let chunks = stream.collect_chunks().await.unwrap();

        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_last);
        assert!(!chunks[0].is_last);
    }

    #[tokio::test]
    async fn test_empty_source_emits_no_chunks() {
        let engine = engine();
        let stream = engine
            .open_download_stream(Bytes::new(), None, None)
            .unwrap();
        let chunks = stream.collect_chunks().await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_indices_strictly_increasing() {
        let engine = engine();
        let stream = engine
            .open_download_stream(pattern(10_000), None, None)
            .unwrap();
        let chunks = stream.collect_chunks().await.unwrap();

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as u64);
        }
    }

    #[tokio::test]
    async fn test_download_range() {
        let engine = engine();
        let data = pattern(5000);
        let expected = data.slice(100..2100);

        let stream = engine
            .open_download_stream(data, Some(ByteRange::new(100, Some(2100))), None)
            .unwrap();
        let out = stream.collect_bytes().await.unwrap();

        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_concatenation_matches_source() {
        let engine = engine();
        let data = pattern(7777);

        let stream = engine.open_download_stream(data.clone(), None, None).unwrap();
        let out = stream.collect_bytes().await.unwrap();

        assert_eq!(blake3::hash(&out), blake3::hash(&data));
    }

    #[tokio::test]
    async fn test_progress_invoked_per_chunk() {
        let engine = engine();
        let calls = Arc::new(AtomicU64::new(0));
        let last_seen = Arc::new(AtomicU64::new(0));

        let calls_cb = calls.clone();
        let last_cb = last_seen.clone();
        let stream = engine
            .open_download_stream(
                pattern(2560),
                None,
                Some(Arc::new(move |p: &StreamProgress| {
                    calls_cb.fetch_add(1, Ordering::SeqCst);
                    last_cb.store(p.bytes_processed, Ordering::SeqCst);
                })),
            )
            .unwrap();

        stream.collect_bytes().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(last_seen.load(Ordering::SeqCst), 2560);
    }

    #[tokio::test]
    async fn test_stream_ceiling() {
        let engine = StreamingEngine::new(StreamingConfig {
            chunk_size: 1024,
            max_open_streams: 1,
            throttle: None,
        })
        .unwrap();

        let first = engine
            .open_download_stream(pattern(64 * 1024), None, None)
            .unwrap();

        let second = engine.open_download_stream(pattern(10), None, None);
        assert!(matches!(second, Err(StreamingError::TooManyStreams(1))));

        first.collect_bytes().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (tx, mut rx) = mpsc::channel(64);
        let engine = StreamingEngine::new(StreamingConfig {
            chunk_size: 16,
            max_open_streams: 4,
            throttle: None,
        })
        .unwrap()
        .with_events(tx);

        // Channel depth is tiny, so the worker stalls mid-stream waiting on
        // the consumer and stays cancellable.
        let mut stream = engine
            .open_download_stream(pattern(16 * 1024), None, None)
            .unwrap();
        let id = stream.id().to_string();

        let first = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.index, 0);

        engine.cancel_stream(&id).unwrap();

        // Drain whatever was already buffered; the stream must end without
        // an error and without ever emitting is_last.
        let mut saw_last = false;
        while let Some(chunk) = stream.next_chunk().await {
            saw_last |= chunk.unwrap().is_last;
        }
        assert!(!saw_last);

        // Worker has deregistered the stream.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(engine.active_streams(), 0);
        assert!(matches!(
            engine.cancel_stream(&id),
            Err(StreamingError::StreamNotFound(_))
        ));

        let mut cancelled_seen = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, StreamEvent::Cancelled { .. }) {
                cancelled_seen = true;
            }
        }
        assert!(cancelled_seen);
    }

    #[tokio::test]
    async fn test_transform_pipeline_round_trip() {
        let engine = engine();
        let data = pattern(5000);

        let upload = engine.open_download_stream(data.clone(), None, None).unwrap();
        let compressed = engine.transform_stream(upload, vec![Box::new(Lz4Compress)]);
        let restored = engine.transform_stream(compressed, vec![Box::new(Lz4Decompress)]);

        let out = restored.collect_bytes().await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_transform_finalize_appended() {
        struct Trailer;
        impl StreamTransform for Trailer {
            fn name(&self) -> &str {
                "trailer"
            }
            fn apply(&mut self, data: Bytes) -> Result<Bytes> {
                Ok(data)
            }
            fn finalize(&mut self) -> Result<Option<Bytes>> {
                Ok(Some(Bytes::from_static(b"TRAILER")))
            }
        }

        let engine = engine();
        let stream = engine
            .open_download_stream(pattern(100), None, None)
            .unwrap();
        let transformed = engine.transform_stream(stream, vec![Box::new(Trailer)]);
        let chunks = transformed.collect_chunks().await.unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[1].data[..], b"TRAILER");
        assert!(chunks[1].is_last);
        assert!(!chunks[0].is_last);
    }

    #[tokio::test]
    async fn test_merge_preserves_order() {
        let engine = engine();
        let a = pattern(1500);
        let b = pattern(700);
        let c = pattern(3000);

        let streams = vec![
            engine.open_download_stream(a.clone(), None, None).unwrap(),
            engine.open_download_stream(b.clone(), None, None).unwrap(),
            engine.open_download_stream(c.clone(), None, None).unwrap(),
        ];

        let merged = engine.merge_streams(streams);
        let chunks = merged.collect_chunks().await.unwrap();

        let mut expected = BytesMut::new();
        expected.extend_from_slice(&a);
        expected.extend_from_slice(&b);
        expected.extend_from_slice(&c);

        let mut out = BytesMut::new();
        for chunk in &chunks {
            out.extend_from_slice(&chunk.data);
        }
        assert_eq!(out.freeze(), expected.freeze());

        assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
        assert!(chunks.last().unwrap().is_last);
    }

    #[tokio::test]
    async fn test_split_round_trip() {
        let engine = engine();
        let data = pattern(10_000);

        let streams = engine.split_stream(data.clone(), 3000).unwrap();
        assert_eq!(streams.len(), 4); // ceil(10000 / 3000)

        let mut out = BytesMut::new();
        for stream in streams {
            out.extend_from_slice(&stream.collect_bytes().await.unwrap());
        }
        assert_eq!(out.freeze(), data);
    }

    #[tokio::test]
    async fn test_split_then_merge_identity() {
        let engine = engine();
        let data = pattern(9999);

        let streams = engine.split_stream(data.clone(), 2500).unwrap();
        let merged = engine.merge_streams(streams);

        assert_eq!(merged.collect_bytes().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_invalid_chunk_size_rejected() {
        let result = StreamingEngine::new(StreamingConfig {
            chunk_size: 0,
            max_open_streams: 4,
            throttle: None,
        });
        assert!(matches!(result, Err(StreamingError::InvalidChunkSize(0))));
    }
}
