use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use filegrid::backend::{BackendManager, MemoryBackend, SelectionPolicy};
use filegrid::coordinator::{CoordinatorConfig, StorageCoordinator, UploadRequest};
use filegrid::id::{FileIdGenerator, IdStrategy};
use filegrid::metadata::MemoryMetadataStore;
use filegrid::replication::{MemoryNodeTransport, NodeInfo, ReplicationConfig, ReplicationEngine};
use filegrid::stream::{StreamingConfig, StreamingEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "filegrid=info".into()),
        )
        .init();

    println!("filegrid - Distributed File Storage Engine");
    println!("==========================================\n");

    // Wire a single-process deployment: two in-memory backends, one cluster
    // peer, default streaming parameters.
    let backends = Arc::new(BackendManager::new(
        SelectionPolicy::RoundRobin,
        Duration::from_secs(5),
        Duration::from_secs(1),
    ));
    backends.register(Arc::new(MemoryBackend::new("mem-a"))).await?;
    backends.register(Arc::new(MemoryBackend::new("mem-b"))).await?;
    println!("✓ Registered backends: {:?}", backends.backend_names());
    println!("  Aggregate health: {:?}\n", backends.aggregate_health());

    let metadata = Arc::new(MemoryMetadataStore::new());
    let replication = Arc::new(ReplicationEngine::new(
        ReplicationConfig {
            cluster_nodes: vec![NodeInfo::new("node-1", "mem://node-1")],
            ..Default::default()
        },
        Arc::new(MemoryNodeTransport::new()),
        metadata.clone(),
    )?);

    let coordinator = StorageCoordinator::new(
        CoordinatorConfig::default(),
        Arc::new(FileIdGenerator::new(IdStrategy::Hybrid, 1)),
        backends,
        Arc::new(StreamingEngine::new(StreamingConfig::default())?),
        replication,
        metadata,
    );

    // Upload, then stream it back.
    let payload: Vec<u8> = (0..2560).map(|i| (i % 256) as u8).collect();
    let outcome = coordinator
        .upload(
            Cursor::new(payload.clone()),
            UploadRequest::new("application/octet-stream", "demo").replicated(),
        )
        .await?;

    println!("✓ Uploaded {} bytes", outcome.size);
    println!("  File id:  {}", outcome.file_id);
    println!("  Backend:  {}", outcome.backend);
    println!("  Checksum: {}", &outcome.checksum[..16]);
    if let Some(job) = &outcome.replication_job {
        println!("  Replication job: {job}");
    }

    let restored = coordinator
        .download_bytes(&outcome.file_id, None, Some("demo"))
        .await?;
    println!("\n✓ Downloaded {} bytes, content matches: {}", restored.len(), restored == payload);

    coordinator.shutdown().await;
    println!("\n✓ Engine shut down cleanly");
    Ok(())
}
