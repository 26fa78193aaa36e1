//! Scanner module - deadline-aware visiting of spawn points.
//!
//! The overseer schedules visits, workers carry them out with identities
//! borrowed from the resource pool, and the write buffer persists what they
//! see. `ScannerBuilder` wires the pieces together from one `ScanConfig`.

pub mod cache;
pub mod config;
pub mod egress;
pub mod estimator;
pub mod geo;
pub mod identity;
pub mod metrics;
pub mod overseer;
pub mod pool;
pub mod protocol;
pub mod spawns;
pub mod sqlite_store;
pub mod storage;
pub mod timing;
pub mod worker;
pub mod write_buffer;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use cache::DedupCaches;
pub use config::{ItemLimit, ScanConfig};
pub use egress::EgressPool;
pub use estimator::DeadlineEstimator;
pub use identity::Identity;
pub use metrics::StatusReport;
pub use overseer::{Overseer, Point, PointKind};
pub use pool::{Census, PoolError, ResourcePool};
pub use protocol::{ChallengeSolver, ProtocolClient, ProtocolError};
pub use spawns::SpawnRegistry;
pub use sqlite_store::SqliteStore;
pub use storage::{MemoryStore, SightingStore, SnapshotStore};
pub use worker::{Worker, WorkerError, WorkerStatus};
pub use write_buffer::{WriteBuffer, WriteHandle, WriteRequest};

use crate::types::Coordinates;
use cache::{FeatureEntry, FeatureKey};
use geo::Bounds;
use overseer::{FEATURES_SNAPSHOT, IDENTITIES_SNAPSHOT, SPAWNS_SNAPSHOT};
use spawns::SpawnState;

/// Shared collaborators of the overseer and every worker.
pub struct ScanContext {
    pub config: Arc<ScanConfig>,
    pub protocol: Arc<dyn ProtocolClient>,
    pub solver: Option<Arc<dyn ChallengeSolver>>,
    pub pool: Arc<ResourcePool>,
    pub egress: Arc<EgressPool>,
    pub spawns: Arc<SpawnRegistry>,
    pub estimator: Arc<DeadlineEstimator>,
    pub caches: Arc<DedupCaches>,
    pub writes: WriteHandle,
    /// Process-wide kill signal
    pub cancel: CancellationToken,
}

/// Scanner builder for convenient construction with sensible defaults.
pub struct ScannerBuilder {
    config: ScanConfig,
    solver: Option<Arc<dyn ChallengeSolver>>,
    cancel: Option<CancellationToken>,
}

impl ScannerBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ScanConfig::default(),
            solver: None,
            cancel: None,
        }
    }

    /// Start from an existing configuration.
    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the scan area corners.
    pub fn with_area(mut self, start: Coordinates, end: Coordinates) -> Self {
        self.config.map_start = start;
        self.config.map_end = end;
        self
    }

    /// Set the worker grid (rows, columns).
    pub fn with_grid(mut self, rows: usize, columns: usize) -> Self {
        self.config.grid = (rows, columns);
        self
    }

    pub fn with_scan_delay(mut self, seconds: f64) -> Self {
        self.config.scan_delay = seconds;
        self
    }

    /// Set the travel speed limit in km/h.
    pub fn with_speed_limit(mut self, kmh: f64) -> Self {
        self.config.speed_limit = kmh;
        self
    }

    pub fn with_identities(mut self, identities: Vec<Identity>) -> Self {
        self.config.identities = identities;
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.config.proxies = proxies;
        self
    }

    /// Cap the number of in-flight visits.
    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.config.max_in_flight = Some(limit);
        self
    }

    /// Set the manual-solve backlog that pauses dispatch.
    pub fn with_max_captchas(mut self, limit: usize) -> Self {
        self.config.max_captchas = limit;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Enable spinning nearby features.
    pub fn with_spin_features(mut self, enabled: bool) -> Self {
        self.config.spin_features = enabled;
        self
    }

    /// Use an automatic challenge solver.
    pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Use an externally owned kill signal.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Build the scanner configuration.
    pub fn build_config(self) -> ScanConfig {
        self.config
    }

    /// Build the overseer: restore persisted state, hand one identity to every
    /// slot and start the write buffer.
    pub async fn build(
        self,
        protocol: Arc<dyn ProtocolClient>,
        store: Arc<dyn SightingStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Result<Arc<Overseer>> {
        let config = self.config;
        config.validate()?;

        // 1. Spawn registry: snapshot first, then everything the store knows
        let bounds = Bounds::from_corners(config.map_start, config.map_end);
        let spawns = Arc::new(SpawnRegistry::new(bounds));
        if let Some(state) = load_snapshot::<SpawnState>(snapshots.as_ref(), SPAWNS_SNAPSHOT).await {
            if !spawns.restore(state) {
                info!("Area changed, rebuilding the spawn registry from the store");
            }
        }
        let records = store.load_spawns().await.context("Failed to load spawn points")?;
        spawns.load_records(records);

        // 2. Deadline estimator
        let estimator = Arc::new(DeadlineEstimator::new(config.last_migration));
        estimator.load(store.all_samples().await.context("Failed to load seen samples")?);

        // 3. Identities, with learned state from the last run
        let mut identities = config.identities.clone();
        if let Some(stored) = load_snapshot::<Vec<Identity>>(snapshots.as_ref(), IDENTITIES_SNAPSHOT).await {
            for persisted in stored {
                if let Some(identity) = identities.iter_mut().find(|i| i.username == persisted.username) {
                    identity.merge_persisted(persisted);
                }
            }
        }
        let pool = Arc::new(ResourcePool::new(identities, &config, self.solver.is_some()));
        let initial = pool.bootstrap(config.worker_count())?;

        // 4. Dedup caches and the write buffer
        let (corrections_tx, corrections_rx) = mpsc::unbounded_channel();
        let caches = Arc::new(DedupCaches::new(config.feature_cache_ttl, corrections_tx));
        if let Some(entries) =
            load_snapshot::<Vec<(FeatureKey, FeatureEntry)>>(snapshots.as_ref(), FEATURES_SNAPSHOT).await
        {
            caches.features.restore(entries).await;
        }
        let flush = CancellationToken::new();
        let (buffer, writes) = WriteBuffer::new(
            store,
            caches.clone(),
            spawns.clone(),
            estimator.clone(),
            corrections_rx,
            &config,
            flush.clone(),
        );
        let write_task = tokio::spawn(buffer.run());

        let egress = Arc::new(EgressPool::new(
            config.proxies.clone(),
            timing::secs(config.egress_cooldown),
            timing::secs(config.egress_wait),
        ));

        let ctx = Arc::new(ScanContext {
            config: Arc::new(config),
            protocol,
            solver: self.solver,
            pool,
            egress,
            spawns,
            estimator,
            caches,
            writes,
            cancel: self.cancel.unwrap_or_default(),
        });
        Ok(Arc::new(Overseer::new(ctx, initial, snapshots, write_task, flush)))
    }
}

impl Default for ScannerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Load and decode a snapshot. A missing or unreadable snapshot is not an error.
async fn load_snapshot<T: DeserializeOwned>(snapshots: &dyn SnapshotStore, key: &str) -> Option<T> {
    let blob = match snapshots.load_snapshot(key).await {
        Ok(blob) => blob?,
        Err(e) => {
            warn!("Failed to read {} snapshot: {:?}", key, e);
            return None;
        }
    };
    match serde_json::from_value(blob) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unreadable {} snapshot: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_builder() {
        let config = ScannerBuilder::new()
            .with_grid(2, 3)
            .with_scan_delay(12.0)
            .with_max_in_flight(4)
            .with_proxies(vec!["socks5://127.0.0.1:9050".to_string()])
            .build_config();

        assert_eq!(config.worker_count(), 6);
        assert_eq!(config.scan_delay, 12.0);
        assert_eq!(config.in_flight_limit(), 4);
        assert_eq!(config.proxies.len(), 1);
    }

    #[test]
    fn test_scanner_builder_defaults() {
        let config = ScannerBuilder::new().build_config();

        assert_eq!(config.grid, (4, 4));
        assert_eq!(config.scan_delay, 10.0);
        assert_eq!(config.speed_limit, 30.58);
        assert_eq!(config.max_captchas, 0);
        assert!(config.identities.is_empty());
    }

    #[tokio::test]
    async fn test_load_snapshot_ignores_garbage() {
        let store = MemoryStore::new();
        store
            .save_snapshot(SPAWNS_SNAPSHOT, &serde_json::json!("not a registry"))
            .await
            .unwrap();
        assert!(load_snapshot::<SpawnState>(&store, SPAWNS_SNAPSHOT).await.is_none());
        assert!(load_snapshot::<SpawnState>(&store, "missing").await.is_none());
    }
}
