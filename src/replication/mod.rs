pub mod engine;
pub mod error;
pub mod health;
pub mod strategy;
pub mod transport;
pub mod types;
pub mod wal;

pub use engine::ReplicationEngine;
pub use error::{ReplicationError, Result};
pub use health::NodeHealthMonitor;
pub use strategy::{
    select_strategy, strategy_set, ChunkedStrategy, DirectStrategy, ReplicationContext,
    ReplicationStrategy, StreamingStrategy,
};
pub use transport::{replication_router, HttpNodeTransport, MemoryNodeTransport, NodeTransport, ReplicaStore};
pub use types::{
    JobStatus, NodeInfo, NodeStatus, ReplicationConfig, ReplicationEvent, ReplicationJob,
    StrategyKind,
};
pub use wal::{ReplicationWal, WalEntry, WalRecord};
