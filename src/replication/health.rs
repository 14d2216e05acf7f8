use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::transport::NodeTransport;
use super::types::{NodeInfo, NodeStatus, ReplicationEvent};

/// Polls cluster nodes and publishes health transitions.
///
/// A node with no successful probe inside the node timeout goes `Offline`;
/// a failed probe inside the window only degrades it. One slow or dead node
/// never stalls the probe cycle for the others.
pub struct NodeHealthMonitor {
    nodes: DashMap<String, NodeInfo>,
    transport: Arc<dyn NodeTransport>,
    interval: Duration,
    probe_timeout: Duration,
    node_timeout: Duration,
    running: AtomicBool,
    event_tx: Option<mpsc::Sender<ReplicationEvent>>,
}

impl NodeHealthMonitor {
    pub fn new(
        cluster_nodes: Vec<NodeInfo>,
        transport: Arc<dyn NodeTransport>,
        interval: Duration,
        node_timeout: Duration,
    ) -> Self {
        let nodes = DashMap::new();
        for node in cluster_nodes {
            nodes.insert(node.node_id.clone(), node);
        }

        Self {
            nodes,
            transport,
            interval,
            // A probe that outlives the node timeout tells us nothing extra.
            probe_timeout: node_timeout.min(Duration::from_secs(10)),
            node_timeout,
            running: AtomicBool::new(false),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<ReplicationEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn add_node(&self, node: NodeInfo) {
        self.nodes.insert(node.node_id.clone(), node);
    }

    pub fn remove_node(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.remove(node_id).map(|(_, node)| node)
    }

    pub fn node(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.get(node_id).map(|n| n.value().clone())
    }

    pub fn all_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Nodes currently usable as replication targets.
    pub fn reachable_nodes(&self) -> Vec<NodeInfo> {
        self.all_nodes()
            .into_iter()
            .filter(|n| n.is_reachable())
            .collect()
    }

    /// Probe every node once. Failures are isolated per node.
    pub async fn probe_all_once(&self) {
        let nodes: Vec<NodeInfo> = self.nodes.iter().map(|n| n.value().clone()).collect();
        let now = chrono::Utc::now().timestamp_millis();

        for node in nodes {
            let probe = tokio::time::timeout(self.probe_timeout, self.transport.probe(&node)).await;

            let new_status = match probe {
                Ok(Ok(latency)) => {
                    debug!(node = %node.node_id, latency_ms = latency.as_millis() as u64, "node probe ok");
                    NodeStatus::Online
                }
                Ok(Err(e)) => {
                    warn!(node = %node.node_id, error = %e, "node probe failed");
                    self.status_after_failure(&node, now)
                }
                Err(_) => {
                    warn!(node = %node.node_id, "node probe timed out");
                    self.status_after_failure(&node, now)
                }
            };

            let probe_ok = new_status == NodeStatus::Online;
            let mut changed = false;
            if let Some(mut entry) = self.nodes.get_mut(&node.node_id) {
                changed = entry.status != new_status;
                entry.status = new_status;
                if probe_ok {
                    entry.last_seen = now;
                }
            }

            if changed {
                metrics::counter!("filegrid_node_health_transitions").increment(1);
                if let Some(ref tx) = self.event_tx {
                    let _ = tx
                        .send(ReplicationEvent::NodeHealthChanged {
                            node_id: node.node_id.clone(),
                            status: new_status,
                        })
                        .await;
                }
            }
        }
    }

    fn status_after_failure(&self, node: &NodeInfo, now: i64) -> NodeStatus {
        if now - node.last_seen >= self.node_timeout.as_millis() as i64 {
            NodeStatus::Offline
        } else {
            NodeStatus::Degraded
        }
    }

    /// Spawn the probe loop. Returns after `stop()`.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            while monitor.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                monitor.probe_all_once().await;
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
