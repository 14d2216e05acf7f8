//! Node-to-node replication transport.
//!
//! The production transport speaks HTTP: chunk pushes are POSTs against the
//! peer's replication service and probes are GETs against its health route.
//! `MemoryNodeTransport` backs unit tests and single-process clusters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::error::{ReplicationError, Result};
use super::types::NodeInfo;
use crate::stream::StreamChunk;

#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Push one chunk of `file_id` to `node`.
    async fn replicate_chunk(&self, node: &NodeInfo, file_id: &str, chunk: &StreamChunk)
        -> Result<()>;

    /// Probe the node, returning the round-trip latency.
    async fn probe(&self, node: &NodeInfo) -> Result<Duration>;
}

/// HTTP transport against peers serving [`replication_router`].
pub struct HttpNodeTransport {
    client: reqwest::Client,
}

impl HttpNodeTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReplicationError::NodeUnreachable {
                node: "-".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn replicate_chunk(
        &self,
        node: &NodeInfo,
        file_id: &str,
        chunk: &StreamChunk,
    ) -> Result<()> {
        let url = format!(
            "{}/replicate/{}/{}?last={}",
            node.address, file_id, chunk.index, chunk.is_last
        );

        let resp = self
            .client
            .post(&url)
            .header("x-chunk-checksum", hex_checksum(&chunk.checksum))
            .body(chunk.data.clone())
            .send()
            .await
            .map_err(|e| ReplicationError::NodeUnreachable {
                node: node.node_id.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ReplicationError::NodeUnreachable {
                node: node.node_id.clone(),
                reason: format!("chunk push returned {}", resp.status()),
            });
        }

        Ok(())
    }

    async fn probe(&self, node: &NodeInfo) -> Result<Duration> {
        let start = Instant::now();
        let resp = self
            .client
            .get(format!("{}/health", node.address))
            .send()
            .await
            .map_err(|e| ReplicationError::NodeUnreachable {
                node: node.node_id.clone(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ReplicationError::NodeUnreachable {
                node: node.node_id.clone(),
                reason: format!("health probe returned {}", resp.status()),
            });
        }

        Ok(start.elapsed())
    }
}

/// Chunk assembly buffer on the receiving node.
#[derive(Default)]
pub struct ReplicaStore {
    files: DashMap<String, BTreeMap<u64, Bytes>>,
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_chunk(&self, file_id: &str, index: u64, data: Bytes) {
        self.files
            .entry(file_id.to_string())
            .or_default()
            .insert(index, data);
    }

    /// Concatenate the received chunks for `file_id` in index order.
    pub fn assembled(&self, file_id: &str) -> Option<Bytes> {
        self.files.get(file_id).map(|chunks| {
            let mut out = Vec::new();
            for data in chunks.values() {
                out.extend_from_slice(data);
            }
            Bytes::from(out)
        })
    }

    pub fn chunk_count(&self, file_id: &str) -> usize {
        self.files.get(file_id).map(|c| c.len()).unwrap_or(0)
    }
}

/// Router a node mounts so peers can push replicas and probe health.
pub fn replication_router(store: Arc<ReplicaStore>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/replicate/:file_id/:index", post(receive_chunk))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn receive_chunk(
    State(store): State<Arc<ReplicaStore>>,
    Path((file_id, index)): Path<(String, u64)>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(expected) = headers.get("x-chunk-checksum").and_then(|v| v.to_str().ok()) {
        let actual = hex_checksum(blake3::hash(&body).as_bytes());
        if expected != actual {
            return StatusCode::BAD_REQUEST;
        }
    }

    store.put_chunk(&file_id, index, body);
    StatusCode::OK
}

fn hex_checksum(checksum: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in checksum {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// In-memory transport for tests: records every chunk per (node, file) and
/// supports failure injection.
#[derive(Default)]
pub struct MemoryNodeTransport {
    received: DashMap<String, BTreeMap<u64, Bytes>>,
    /// Nodes whose every call fails.
    dead_nodes: DashMap<String, ()>,
    /// Number of upcoming `replicate_chunk` calls that fail regardless of node.
    failures_remaining: AtomicU32,
}

impl MemoryNodeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_node_dead(&self, node_id: &str, dead: bool) {
        if dead {
            self.dead_nodes.insert(node_id.to_string(), ());
        } else {
            self.dead_nodes.remove(node_id);
        }
    }

    pub fn fail_next(&self, calls: u32) {
        self.failures_remaining.store(calls, Ordering::SeqCst);
    }

    pub fn assembled(&self, node_id: &str, file_id: &str) -> Option<Bytes> {
        self.received.get(&key(node_id, file_id)).map(|chunks| {
            let mut out = Vec::new();
            for data in chunks.values() {
                out.extend_from_slice(data);
            }
            Bytes::from(out)
        })
    }

    pub fn chunk_count(&self, node_id: &str, file_id: &str) -> usize {
        self.received
            .get(&key(node_id, file_id))
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn key(node_id: &str, file_id: &str) -> String {
    format!("{node_id}/{file_id}")
}

#[async_trait]
impl NodeTransport for MemoryNodeTransport {
    async fn replicate_chunk(
        &self,
        node: &NodeInfo,
        file_id: &str,
        chunk: &StreamChunk,
    ) -> Result<()> {
        if self.dead_nodes.contains_key(&node.node_id) {
            return Err(ReplicationError::NodeUnreachable {
                node: node.node_id.clone(),
                reason: "node down".to_string(),
            });
        }
        if self.take_failure() {
            return Err(ReplicationError::NodeUnreachable {
                node: node.node_id.clone(),
                reason: "injected failure".to_string(),
            });
        }

        self.received
            .entry(key(&node.node_id, file_id))
            .or_default()
            .insert(chunk.index, chunk.data.clone());
        Ok(())
    }

    async fn probe(&self, node: &NodeInfo) -> Result<Duration> {
        if self.dead_nodes.contains_key(&node.node_id) {
            return Err(ReplicationError::NodeUnreachable {
                node: node.node_id.clone(),
                reason: "node down".to_string(),
            });
        }
        Ok(Duration::from_millis(1))
    }
}
