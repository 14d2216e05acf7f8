use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::{BackendError, Result};
use super::types::{BackendHealth, HealthStatus, SelectionPolicy};
use super::StorageBackend;

/// Events emitted by the backend manager for operational tooling.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Registered { name: String },
    Unregistered { name: String },
    HealthChanged {
        name: String,
        status: HealthStatus,
    },
}

/// Registry of storage backends with periodic health polling and
/// load-balanced upload selection.
pub struct BackendManager {
    backends: DashMap<String, Arc<dyn StorageBackend>>,
    health: DashMap<String, BackendHealth>,
    policy: SelectionPolicy,
    poll_interval: Duration,
    probe_timeout: Duration,
    rr_cursor: AtomicUsize,
    running: AtomicBool,
    event_tx: Option<mpsc::Sender<BackendEvent>>,
}

impl BackendManager {
    pub fn new(policy: SelectionPolicy, poll_interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            backends: DashMap::new(),
            health: DashMap::new(),
            policy,
            poll_interval,
            probe_timeout,
            rr_cursor: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            event_tx: None,
        }
    }

    /// Attach an event channel for monitoring.
    pub fn with_events(mut self, tx: mpsc::Sender<BackendEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Register and initialize a backend. The backend is considered healthy
    /// until the first poll says otherwise.
    pub async fn register(&self, backend: Arc<dyn StorageBackend>) -> Result<()> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(BackendError::AlreadyRegistered(name));
        }

        backend.initialize().await?;

        let initial = backend.health().await;
        self.health.insert(name.clone(), initial);
        self.backends.insert(name.clone(), backend);

        info!(backend = %name, "backend registered");
        self.emit(BackendEvent::Registered { name }).await;
        Ok(())
    }

    /// Unregister a backend, shutting it down.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let (_, backend) = self
            .backends
            .remove(name)
            .ok_or_else(|| BackendError::NotRegistered(name.to_string()))?;
        self.health.remove(name);

        if let Err(e) = backend.shutdown().await {
            warn!(backend = %name, error = %e, "backend shutdown failed");
        }

        info!(backend = %name, "backend unregistered");
        self.emit(BackendEvent::Unregistered {
            name: name.to_string(),
        })
        .await;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageBackend>> {
        self.backends
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::NotRegistered(name.to_string()))
    }

    /// Resolve the backend holding an already-stored file. Downloads go to the
    /// recorded backend, never through load balancing.
    pub fn backend_for_download(&self, recorded_backend: &str) -> Result<Arc<dyn StorageBackend>> {
        self.get(recorded_backend)
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn health_of(&self, name: &str) -> Option<BackendHealth> {
        self.health.get(name).map(|h| h.value().clone())
    }

    /// Poll every registered backend once. A failed or timed-out probe marks
    /// that backend unhealthy; it never aborts the remaining probes.
    pub async fn poll_health_once(&self) {
        let backends: Vec<(String, Arc<dyn StorageBackend>)> = self
            .backends
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (name, backend) in backends {
            let health = match tokio::time::timeout(self.probe_timeout, backend.health()).await {
                Ok(health) => health,
                Err(_) => {
                    warn!(backend = %name, "health probe timed out");
                    BackendHealth::unhealthy(self.probe_timeout.as_millis() as u64)
                }
            };

            let previous = self.health.insert(name.clone(), health.clone());
            let changed = previous.map(|p| p.status != health.status).unwrap_or(true);

            if changed {
                debug!(backend = %name, status = ?health.status, "backend health changed");
                metrics::counter!("filegrid_backend_health_transitions").increment(1);
                self.emit(BackendEvent::HealthChanged {
                    name,
                    status: health.status,
                })
                .await;
            }
        }
    }

    /// Spawn the polling loop. Returns after `stop()`.
    pub fn start_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.poll_interval);
            while manager.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                manager.poll_health_once().await;
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Aggregate cluster health: healthy only with zero unhealthy backends,
    /// degraded when some but not all are unhealthy.
    pub fn aggregate_health(&self) -> HealthStatus {
        let total = self.health.len();
        if total == 0 {
            return HealthStatus::Unhealthy;
        }

        let unhealthy = self
            .health
            .iter()
            .filter(|h| h.value().status == HealthStatus::Unhealthy)
            .count();

        if unhealthy == 0 {
            HealthStatus::Healthy
        } else if unhealthy < total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }

    fn healthy_backends(&self) -> Vec<(String, Arc<dyn StorageBackend>)> {
        let mut healthy: Vec<(String, Arc<dyn StorageBackend>)> = self
            .backends
            .iter()
            .filter(|entry| {
                self.health
                    .get(entry.key())
                    .map(|h| h.value().status == HealthStatus::Healthy)
                    .unwrap_or(false)
            })
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        // Stable order so the round-robin cursor cycles deterministically.
        healthy.sort_by(|a, b| a.0.cmp(&b.0));
        healthy
    }

    /// Select a backend for an upload according to the configured policy.
    /// Only backends currently reporting healthy are candidates.
    pub fn select_for_upload(&self) -> Result<Arc<dyn StorageBackend>> {
        let healthy = self.healthy_backends();
        if healthy.is_empty() {
            return Err(BackendError::NoHealthyBackend);
        }

        let selected = match self.policy {
            SelectionPolicy::RoundRobin => {
                let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
                healthy[idx].1.clone()
            }
            SelectionPolicy::LeastLoaded => healthy
                .iter()
                .min_by_key(|(name, _)| {
                    self.health
                        .get(name)
                        .map(|h| h.value().latency_ms)
                        .unwrap_or(u64::MAX)
                })
                .map(|(_, backend)| backend.clone())
                .unwrap(),
            // Capability-aware sizing is an extension point; fall back to the
            // first healthy backend.
            SelectionPolicy::SizeBased => healthy[0].1.clone(),
            SelectionPolicy::Random => {
                let idx = rand::thread_rng().gen_range(0..healthy.len());
                healthy[idx].1.clone()
            }
        };

        Ok(selected)
    }

    /// Shut down every backend and stop polling.
    pub async fn shutdown(&self) {
        self.stop();
        let names = self.backend_names();
        for name in names {
            if let Err(e) = self.unregister(&name).await {
                warn!(backend = %name, error = %e, "shutdown: unregister failed");
            }
        }
    }

    async fn emit(&self, event: BackendEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use std::collections::HashSet;

    fn manager() -> BackendManager {
        BackendManager::new(
            SelectionPolicy::RoundRobin,
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
    }

    async fn register_three(manager: &BackendManager) -> Vec<Arc<MemoryBackend>> {
        let mut backends = Vec::new();
        for name in ["mem-a", "mem-b", "mem-c"] {
            let backend = Arc::new(MemoryBackend::new(name));
            manager.register(backend.clone()).await.unwrap();
            backends.push(backend);
        }
        backends
    }

    #[tokio::test]
    async fn test_register_and_duplicate() {
        let manager = manager();
        let backend = Arc::new(MemoryBackend::new("mem-a"));

        manager.register(backend.clone()).await.unwrap();
        let result = manager.register(backend).await;
        assert!(matches!(result, Err(BackendError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn test_unregister_unknown() {
        let manager = manager();
        assert!(matches!(
            manager.unregister("nope").await,
            Err(BackendError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_aggregate_health_transitions() {
        let manager = manager();
        let backends = register_three(&manager).await;

        manager.poll_health_once().await;
        assert_eq!(manager.aggregate_health(), HealthStatus::Healthy);

        backends[0].set_failing(true);
        manager.poll_health_once().await;
        assert_eq!(manager.aggregate_health(), HealthStatus::Degraded);

        for backend in &backends {
            backend.set_failing(true);
        }
        manager.poll_health_once().await;
        assert_eq!(manager.aggregate_health(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_aggregate_health_empty_registry() {
        let manager = manager();
        assert_eq!(manager.aggregate_health(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_round_robin_skips_unhealthy() {
        let manager = manager();
        let backends = register_three(&manager).await;

        backends[1].set_failing(true);
        manager.poll_health_once().await;

        let mut seen = HashSet::new();
        for _ in 0..20 {
            let backend = manager.select_for_upload().unwrap();
            seen.insert(backend.name().to_string());
        }

        assert_eq!(seen.len(), 2);
        assert!(!seen.contains("mem-b"));
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let manager = manager();
        register_three(&manager).await;
        manager.poll_health_once().await;

        let first = manager.select_for_upload().unwrap().name().to_string();
        let second = manager.select_for_upload().unwrap().name().to_string();
        let third = manager.select_for_upload().unwrap().name().to_string();
        let fourth = manager.select_for_upload().unwrap().name().to_string();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, fourth);
    }

    #[tokio::test]
    async fn test_no_healthy_backend() {
        let manager = manager();
        let backends = register_three(&manager).await;

        for backend in &backends {
            backend.set_failing(true);
        }
        manager.poll_health_once().await;

        assert!(matches!(
            manager.select_for_upload(),
            Err(BackendError::NoHealthyBackend)
        ));
    }

    #[tokio::test]
    async fn test_download_resolves_by_name_regardless_of_health() {
        let manager = manager();
        let backends = register_three(&manager).await;

        backends[1].set_failing(true);
        manager.poll_health_once().await;

        // Still resolvable; the caller decides how to handle its errors.
        let backend = manager.backend_for_download("mem-b").unwrap();
        assert_eq!(backend.name(), "mem-b");

        assert!(matches!(
            manager.backend_for_download("mem-z"),
            Err(BackendError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_least_loaded_policy() {
        let manager = BackendManager::new(
            SelectionPolicy::LeastLoaded,
            Duration::from_millis(50),
            Duration::from_millis(200),
        );
        register_three(&manager).await;
        manager.poll_health_once().await;

        // MemoryBackend reports 0ms latency for all; the policy must still
        // deterministically pick a healthy one.
        let backend = manager.select_for_upload().unwrap();
        assert!(manager.backend_names().contains(&backend.name().to_string()));
    }

    #[tokio::test]
    async fn test_health_events_emitted() {
        let (tx, mut rx) = mpsc::channel(16);
        let manager = BackendManager::new(
            SelectionPolicy::RoundRobin,
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
        .with_events(tx);

        let backend = Arc::new(MemoryBackend::new("mem-a"));
        manager.register(backend.clone()).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(BackendEvent::Registered { .. })
        ));

        backend.set_failing(true);
        manager.poll_health_once().await;

        assert!(matches!(
            rx.recv().await,
            Some(BackendEvent::HealthChanged {
                status: HealthStatus::Unhealthy,
                ..
            })
        ));
    }
}
