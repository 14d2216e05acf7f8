use thiserror::Error;

use super::types::JobStatus;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Replication already active for file {0}")]
    AlreadyReplicating(String),

    #[error("Too many concurrent replication jobs (limit {0})")]
    TooManyJobs(usize),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("No reachable replication targets")]
    NoTargets,

    #[error("Invalid job transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Strategy {strategy} failed: {reason}")]
    StrategyFailed { strategy: String, reason: String },

    #[error("Node {node} unreachable: {reason}")]
    NodeUnreachable { node: String, reason: String },

    #[error("Job {job_id} terminally failed after {attempts} retries")]
    Terminal { job_id: String, attempts: u32 },

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] crate::metadata::MetadataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
