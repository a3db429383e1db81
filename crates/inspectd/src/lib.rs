//! inspectd - Kubernetes inspection service daemon.
//!
//! Library components for the daemon process: storage, the run scheduler
//! and worker, the agent lease protocol, and the HTTP surface.

pub mod agent_api;
pub mod config;
pub mod control;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod worker;

use std::sync::Arc;

use chrono::Utc;
use inspect_core::{CheckSpec, Id, InspectionItem};
use tracing::{info, warn};

pub use config::DaemonConfig;
use scheduler::RunScheduler;
use storage::Storage;

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    scheduler: Arc<RunScheduler>,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let scheduler = Arc::new(RunScheduler::new(
            Arc::clone(&storage),
            config.max_concurrent_runs,
        ));

        Ok(Self {
            config,
            storage,
            scheduler,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn scheduler(&self) -> &Arc<RunScheduler> {
        &self.scheduler
    }

    /// Run the daemon: seed the catalog, recover interrupted runs, serve
    /// HTTP until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("inspectd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!("max concurrent runs: {}", self.config.max_concurrent_runs);

        if self.config.seed_default_items {
            match seed_default_items(&self.storage).await {
                Ok(0) => {}
                Ok(count) => info!("seeded {count} default inspection item(s)"),
                Err(e) => warn!("failed to seed default items: {e}"),
            }
        }

        // Server-executed runs interrupted by the previous shutdown resume
        // from their persisted checkpoints.
        match self.scheduler.recover().await {
            Ok(0) => {}
            Ok(count) => info!("resumed {count} interrupted run(s)"),
            Err(e) => warn!("failed to resume interrupted runs: {e}"),
        }

        server::start_server(
            Arc::clone(&self.storage),
            Arc::clone(&self.scheduler),
            self.config.port,
        )
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })
    }
}

/// The built-in default check catalog.
fn default_items() -> Vec<(&'static str, &'static str, CheckSpec)> {
    vec![
        (
            "Cluster Version",
            "Collects the Kubernetes API server version.",
            CheckSpec::ClusterVersion,
        ),
        (
            "Node Health",
            "Verifies all nodes are Ready.",
            CheckSpec::NodesStatus,
        ),
        (
            "Pod Status",
            "Checks for non-running pods cluster-wide.",
            CheckSpec::PodsStatus,
        ),
        (
            "Recent Events",
            "Fetches latest cluster events ordered by timestamp.",
            CheckSpec::EventsRecent,
        ),
        (
            "Cluster CPU Usage",
            "Aggregated CPU utilisation via Prometheus metrics.",
            CheckSpec::ClusterCpuUsage,
        ),
        (
            "Cluster Memory Usage",
            "Overall memory utilisation from Prometheus.",
            CheckSpec::ClusterMemoryUsage,
        ),
        (
            "Node CPU Hotspots",
            "Highlights nodes with highest CPU usage.",
            CheckSpec::NodeCpuHotspots,
        ),
        (
            "Node Memory Pressure",
            "Highlights nodes with highest memory usage.",
            CheckSpec::NodeMemoryPressure,
        ),
        (
            "Cluster Disk IO",
            "Monitors node disk IO time ratio.",
            CheckSpec::ClusterDiskIo,
        ),
    ]
}

/// Seed the built-in checks into the catalog, skipping names that already
/// exist. Returns the number of items created.
pub async fn seed_default_items(storage: &Storage) -> Result<usize, storage::StorageError> {
    let mut created = 0;
    for (name, description, check) in default_items() {
        if storage.get_item_by_name(name).await?.is_some() {
            continue;
        }
        let now = Utc::now();
        storage
            .insert_item(&InspectionItem {
                id: Id::new(),
                name: name.to_string(),
                description: Some(description.to_string()),
                check,
                is_archived: false,
                created_at: now,
                updated_at: now,
            })
            .await?;
        created += 1;
    }
    Ok(created)
}
