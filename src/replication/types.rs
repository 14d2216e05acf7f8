use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Degraded,
}

/// A cluster peer as seen by this node.
///
/// Refreshed by periodic health probes; transitions to `Offline` after the
/// node timeout passes with no successful probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    /// Base address of the node's replication service, e.g. `http://10.0.0.2:7400`.
    pub address: String,
    pub status: NodeStatus,
    pub capabilities: Vec<String>,
    pub last_seen: i64,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            status: NodeStatus::Online,
            capabilities: Vec::new(),
            last_seen: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status != NodeStatus::Offline
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Direct,
    Chunked,
    Streaming,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running | JobStatus::Retrying)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition. Transitions are strictly
    /// monotonic per job; nothing returns to `Pending` once running.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Retrying)
                | (JobStatus::Retrying, JobStatus::Running)
                | (JobStatus::Retrying, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Cancelled)
                | (JobStatus::Retrying, JobStatus::Cancelled)
        )
    }
}

/// One replication job. At most one active job exists per file id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub job_id: String,
    pub file_id: String,
    pub source_node: String,
    pub target_nodes: Vec<String>,
    pub strategy: StrategyKind,
    pub status: JobStatus,
    pub progress_percent: f32,
    pub retry_count: u32,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
}

impl ReplicationJob {
    pub fn new(
        file_id: impl Into<String>,
        source_node: impl Into<String>,
        target_nodes: Vec<String>,
        strategy: StrategyKind,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            file_id: file_id.into(),
            source_node: source_node.into(),
            target_nodes,
            strategy,
            status: JobStatus::Pending,
            progress_percent: 0.0,
            retry_count: 0,
            started_at: chrono::Utc::now().timestamp_millis(),
            completed_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub node_id: String,
    pub cluster_nodes: Vec<NodeInfo>,
    pub default_strategy: StrategyKind,
    pub large_file_threshold: u64,
    pub chunk_size: usize,
    pub max_concurrent_replications: usize,
    pub health_check_interval: Duration,
    pub node_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub orphaned_check_interval: Duration,
    pub orphaned_retention: Duration,
    pub wal_enabled: bool,
    pub wal_path: Option<PathBuf>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            cluster_nodes: Vec::new(),
            default_strategy: StrategyKind::Direct,
            large_file_threshold: 100 * 1024 * 1024,
            chunk_size: 1024 * 1024,
            max_concurrent_replications: num_cpus::get(),
            health_check_interval: Duration::from_secs(30),
            node_timeout: Duration::from_secs(90),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
            orphaned_check_interval: Duration::from_secs(3600),
            orphaned_retention: Duration::from_secs(24 * 3600),
            wal_enabled: false,
            wal_path: None,
        }
    }
}

/// Events emitted by the replication engine for operational tooling.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    JobStarted {
        job_id: String,
        file_id: String,
        strategy: StrategyKind,
    },
    JobCompleted {
        job_id: String,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
    JobCancelled {
        job_id: String,
    },
    JobRetrying {
        job_id: String,
        retry_count: u32,
        delay: Duration,
    },
    NodeHealthChanged {
        node_id: String,
        status: NodeStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Retrying));
        assert!(JobStatus::Retrying.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Completed));

        // Nothing returns to pending, terminal states are final.
        assert!(!JobStatus::Running.can_transition(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition(JobStatus::Retrying));
        assert!(!JobStatus::Cancelled.can_transition(JobStatus::Running));
    }

    #[test]
    fn test_cancel_reachable_from_non_terminal() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Retrying] {
            assert!(status.can_transition(JobStatus::Cancelled));
        }
    }

    #[test]
    fn test_active_and_terminal_predicates() {
        assert!(JobStatus::Retrying.is_active());
        assert!(!JobStatus::Failed.is_active());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
