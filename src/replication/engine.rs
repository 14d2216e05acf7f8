use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use super::error::{ReplicationError, Result};
use super::health::NodeHealthMonitor;
use super::strategy::{
    select_strategy, strategy_set, ReplicationContext, ReplicationStrategy,
};
use super::transport::NodeTransport;
use super::types::{
    JobStatus, NodeInfo, ReplicationConfig, ReplicationEvent, ReplicationJob, StrategyKind,
};
use super::wal::{ReplicationWal, WalEntry};
use crate::backend::BackendManager;
use crate::metadata::{FileMetadata, MetadataStore, ReplicationState};

/// Replicates stored files to cluster peers.
///
/// Per-job state machine: `pending -> running -> completed`, or
/// `running -> retrying -> running` up to the retry ceiling, after which the
/// job is terminally failed and surfaced. At most one active job exists per
/// file id; a second request while one is active is rejected, not queued.
#[derive(Clone)]
pub struct ReplicationEngine {
    config: ReplicationConfig,
    strategies: Vec<Arc<dyn ReplicationStrategy>>,
    transport: Arc<dyn NodeTransport>,
    health: Arc<NodeHealthMonitor>,
    metadata: Arc<dyn MetadataStore>,
    backends: Option<Arc<BackendManager>>,
    wal: Option<Arc<ReplicationWal>>,
    jobs: Arc<DashMap<String, ReplicationJob>>,
    active_files: Arc<DashMap<String, String>>,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    event_tx: Option<mpsc::Sender<ReplicationEvent>>,
}

impl ReplicationEngine {
    pub fn new(
        config: ReplicationConfig,
        transport: Arc<dyn NodeTransport>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self> {
        let wal = if config.wal_enabled {
            let path = config
                .wal_path
                .clone()
                .ok_or_else(|| ReplicationError::Wal("wal_path is required".to_string()))?;
            Some(Arc::new(ReplicationWal::open(path)?))
        } else {
            None
        };

        let health = Arc::new(NodeHealthMonitor::new(
            config.cluster_nodes.clone(),
            transport.clone(),
            config.health_check_interval,
            config.node_timeout,
        ));

        Ok(Self {
            strategies: strategy_set(&config),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_replications)),
            jobs: Arc::new(DashMap::new()),
            active_files: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            event_tx: None,
            transport,
            health,
            metadata,
            backends: None,
            wal,
            config,
        })
    }

    /// Attach an event channel; also routes node health transitions to it.
    pub fn with_events(mut self, tx: mpsc::Sender<ReplicationEvent>) -> Self {
        self.health = Arc::new(
            NodeHealthMonitor::new(
                self.config.cluster_nodes.clone(),
                self.transport.clone(),
                self.config.health_check_interval,
                self.config.node_timeout,
            )
            .with_events(tx.clone()),
        );
        self.event_tx = Some(tx);
        self
    }

    /// Attach the backend registry so orphan cleanup can delete stored bytes.
    pub fn with_backends(mut self, backends: Arc<BackendManager>) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn health_monitor(&self) -> Arc<NodeHealthMonitor> {
        self.health.clone()
    }

    pub fn job(&self, job_id: &str) -> Option<ReplicationJob> {
        self.jobs.get(job_id).map(|j| j.value().clone())
    }

    pub fn active_job_count(&self) -> usize {
        self.active_files.len()
    }

    /// Estimate duration for the strategy that would be selected.
    pub fn estimate(&self, metadata: &FileMetadata) -> Option<(StrategyKind, Duration)> {
        let kind = select_strategy(metadata, &self.config);
        self.strategies
            .iter()
            .find(|s| s.kind() == kind)
            .map(|s| (kind, s.estimated_time(metadata)))
    }

    /// Entries for jobs interrupted before reaching a terminal state.
    pub fn replay_wal(&self) -> Result<Vec<WalEntry>> {
        match &self.wal {
            Some(wal) => wal.replay(),
            None => Ok(Vec::new()),
        }
    }

    /// Start replicating `data` for `metadata.id` to the reachable peers.
    ///
    /// Returns the job id immediately; the work runs on a spawned task.
    pub async fn replicate(
        &self,
        metadata: &FileMetadata,
        data: Bytes,
        strategy_override: Option<StrategyKind>,
    ) -> Result<String> {
        let targets: Vec<NodeInfo> = self
            .health
            .reachable_nodes()
            .into_iter()
            .filter(|n| n.node_id != self.config.node_id)
            .collect();
        if targets.is_empty() {
            return Err(ReplicationError::NoTargets);
        }

        let kind = strategy_override.unwrap_or_else(|| select_strategy(metadata, &self.config));
        let strategy = self
            .strategies
            .iter()
            .find(|s| s.kind() == kind)
            .cloned()
            .ok_or_else(|| ReplicationError::StrategyFailed {
                strategy: format!("{kind:?}"),
                reason: "not registered".to_string(),
            })?;

        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| ReplicationError::TooManyJobs(self.config.max_concurrent_replications))?;

        let job = ReplicationJob::new(
            &metadata.id,
            &self.config.node_id,
            targets.iter().map(|n| n.node_id.clone()).collect(),
            kind,
        );
        let job_id = job.job_id.clone();

        match self.active_files.entry(metadata.id.clone()) {
            Entry::Occupied(_) => {
                return Err(ReplicationError::AlreadyReplicating(metadata.id.clone()));
            }
            Entry::Vacant(slot) => {
                slot.insert(job_id.clone());
            }
        }

        // Durability first: the WAL entry must be on disk before any chunk
        // moves, so a crash mid-replication can be replayed by job id.
        if let Some(ref wal) = self.wal {
            let entry = WalEntry {
                job_id: job_id.clone(),
                file_id: metadata.id.clone(),
                source_node: self.config.node_id.clone(),
                target_nodes: job.target_nodes.clone(),
                strategy: kind,
                created_at: chrono::Utc::now().timestamp_millis(),
            };
            if let Err(e) = wal.append_begin(entry) {
                self.active_files
                    .remove_if(&metadata.id, |_, v| v == &job_id);
                return Err(e);
            }
        }

        self.jobs.insert(job_id.clone(), job);
        metrics::counter!("filegrid_replication_jobs_started").increment(1);

        let engine = self.clone();
        let file_id = metadata.id.clone();
        let worker_job_id = job_id.clone();
        tokio::spawn(async move {
            engine
                .run_job(worker_job_id, file_id, data, targets, strategy)
                .await;
            drop(permit);
        });

        Ok(job_id)
    }

    async fn run_job(
        &self,
        job_id: String,
        file_id: String,
        data: Bytes,
        targets: Vec<NodeInfo>,
        strategy: Arc<dyn ReplicationStrategy>,
    ) {
        if !self.try_transition(&job_id, JobStatus::Running) {
            // Cancelled before it ever ran.
            self.finish_job(&job_id, &file_id).await;
            return;
        }

        self.emit(ReplicationEvent::JobStarted {
            job_id: job_id.clone(),
            file_id: file_id.clone(),
            strategy: strategy.kind(),
        })
        .await;

        let progress_jobs = self.jobs.clone();
        let progress_job_id = job_id.clone();
        let ctx = ReplicationContext {
            file_id: file_id.clone(),
            data,
            targets,
            transport: self.transport.clone(),
            chunk_size: self.config.chunk_size,
            progress: Arc::new(move |percent| {
                if let Some(mut job) = progress_jobs.get_mut(&progress_job_id) {
                    job.progress_percent = percent;
                }
            }),
        };

        loop {
            let result = strategy.replicate(&ctx).await;

            if self.job_status(&job_id) == Some(JobStatus::Cancelled) {
                break;
            }

            match result {
                Ok(()) => {
                    if self.try_transition(&job_id, JobStatus::Completed) {
                        if let Some(mut job) = self.jobs.get_mut(&job_id) {
                            job.progress_percent = 100.0;
                            job.completed_at = Some(chrono::Utc::now().timestamp_millis());
                        }
                        info!(job = %job_id, file = %file_id, "replication completed");
                        metrics::counter!("filegrid_replication_jobs_completed").increment(1);
                        self.update_replication_state(&file_id, ReplicationState::Completed)
                            .await;
                        self.emit(ReplicationEvent::JobCompleted {
                            job_id: job_id.clone(),
                        })
                        .await;
                    }
                    break;
                }
                Err(e) => {
                    let retry_count = {
                        let mut job = match self.jobs.get_mut(&job_id) {
                            Some(job) => job,
                            None => break,
                        };
                        job.last_error = Some(e.to_string());
                        job.retry_count
                    };

                    if retry_count >= self.config.retry_attempts {
                        if self.try_transition(&job_id, JobStatus::Failed) {
                            if let Some(mut job) = self.jobs.get_mut(&job_id) {
                                job.completed_at = Some(chrono::Utc::now().timestamp_millis());
                            }
                            warn!(job = %job_id, file = %file_id, error = %e, "replication terminally failed");
                            metrics::counter!("filegrid_replication_jobs_failed").increment(1);
                            self.update_replication_state(&file_id, ReplicationState::Failed)
                                .await;
                            self.emit(ReplicationEvent::JobFailed {
                                job_id: job_id.clone(),
                                error: e.to_string(),
                            })
                            .await;
                        }
                        break;
                    }

                    let retry_count = retry_count + 1;
                    if let Some(mut job) = self.jobs.get_mut(&job_id) {
                        job.retry_count = retry_count;
                    }
                    if !self.try_transition(&job_id, JobStatus::Retrying) {
                        break;
                    }

                    let delay = backoff_delay(
                        retry_count,
                        self.config.retry_delay,
                        self.config.max_retry_delay,
                    );
                    warn!(job = %job_id, retry = retry_count, delay_ms = delay.as_millis() as u64, error = %e, "replication attempt failed, backing off");
                    self.emit(ReplicationEvent::JobRetrying {
                        job_id: job_id.clone(),
                        retry_count,
                        delay,
                    })
                    .await;

                    tokio::time::sleep(delay).await;

                    if !self.try_transition(&job_id, JobStatus::Running) {
                        // Cancelled during backoff.
                        break;
                    }
                }
            }
        }

        self.finish_job(&job_id, &file_id).await;
    }

    async fn finish_job(&self, job_id: &str, file_id: &str) {
        self.active_files
            .remove_if(file_id, |_, active| active == job_id);

        // Every terminal outcome resolves the WAL entry; replay only surfaces
        // jobs interrupted by a crash.
        if let Some(ref wal) = self.wal {
            if let Err(e) = wal.mark_complete(job_id) {
                warn!(job = %job_id, error = %e, "failed to resolve WAL entry");
            }
        }
    }

    fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|j| j.status)
    }

    /// Apply a state transition if it is legal; the entry lock covers the
    /// whole read-modify-write so racing transitions cannot be lost.
    fn try_transition(&self, job_id: &str, to: JobStatus) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(mut job) => {
                if job.status.can_transition(to) {
                    job.status = to;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Cancel a job from any non-terminal state.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let (from, file_id) = {
            let job = self
                .jobs
                .get(job_id)
                .ok_or_else(|| ReplicationError::JobNotFound(job_id.to_string()))?;
            (job.status, job.file_id.clone())
        };

        if !self.try_transition(job_id, JobStatus::Cancelled) {
            return Err(ReplicationError::InvalidTransition {
                from,
                to: JobStatus::Cancelled,
            });
        }

        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.completed_at = Some(chrono::Utc::now().timestamp_millis());
        }
        self.active_files
            .remove_if(&file_id, |_, active| active == job_id);

        metrics::counter!("filegrid_replication_jobs_cancelled").increment(1);
        self.emit(ReplicationEvent::JobCancelled {
            job_id: job_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Remove files whose replication bookkeeping went stale beyond the
    /// retention window. Per-file failures are logged and skipped; the scan
    /// always runs to the end. Returns the number of files removed.
    pub async fn sweep_orphans_once(&self) -> usize {
        let cutoff =
            chrono::Utc::now().timestamp_millis() - self.config.orphaned_retention.as_millis() as i64;

        let stale = match self
            .metadata
            .find(Box::new(move |m| {
                matches!(
                    m.replication,
                    ReplicationState::Pending | ReplicationState::Failed
                ) && m.updated_at < cutoff
            }))
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "orphan scan failed");
                return 0;
            }
        };

        let mut removed = 0;
        for file in stale {
            if self.active_files.contains_key(&file.id) {
                continue;
            }

            if let Some(ref backends) = self.backends {
                let deleted = match backends.backend_for_download(&file.backend) {
                    Ok(backend) => backend.delete(&file.id).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = deleted {
                    warn!(file = %file.id, error = %e, "orphan cleanup: byte deletion failed, skipping");
                    continue;
                }
            }

            if let Err(e) = self.metadata.remove_with_id(&file.id).await {
                warn!(file = %file.id, error = %e, "orphan cleanup: metadata removal failed, skipping");
                continue;
            }

            info!(file = %file.id, "orphaned file removed");
            metrics::counter!("filegrid_orphans_removed").increment(1);
            removed += 1;
        }
        removed
    }

    /// Start the health-probe and orphan-sweep loops.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.running.store(true, Ordering::SeqCst);

        let health_handle = self.health.start();

        let engine = self.clone();
        let orphan_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.orphaned_check_interval);
            while engine.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                engine.sweep_orphans_once().await;
            }
        });

        vec![health_handle, orphan_handle]
    }

    /// Stop loops and cancel every active job.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.health.stop();

        let active: Vec<String> = self
            .jobs
            .iter()
            .filter(|j| j.status.is_active())
            .map(|j| j.job_id.clone())
            .collect();

        for job_id in active {
            if let Err(e) = self.cancel_job(&job_id).await {
                warn!(job = %job_id, error = %e, "shutdown: cancel failed");
            }
        }
    }

    async fn update_replication_state(&self, file_id: &str, state: ReplicationState) {
        let current = match self.metadata.find_by_id(file_id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                warn!(file = %file_id, error = %e, "metadata lookup failed");
                return;
            }
        };

        let mut updated = current;
        updated.replication = state;
        if let Err(e) = self.metadata.update_with_id(file_id, updated).await {
            warn!(file = %file_id, error = %e, "metadata replication-state update failed");
        }
    }

    async fn emit(&self, event: ReplicationEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}

/// `delay = base * 2^(retry_count - 1)`, capped at `max`.
fn backoff_delay(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let shift = retry_count.saturating_sub(1).min(20);
    base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
}
