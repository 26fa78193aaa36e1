//! Storage abstraction layer for the scanner.
//!
//! Two contracts are defined here: the sighting store, which receives
//! committed write batches and answers the startup queries of the spawn
//! registry and the deadline estimator, and the snapshot store, which keeps
//! opaque JSON blobs of in-memory state between runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::scanner::timing;
use crate::scanner::write_buffer::WriteRequest;
use crate::types::{
    Coordinates, EncounterId, FeatureSighting, Mystery, SeenSample, Sighting, SpawnId, SpawnPointRecord,
};

/// Formal contract for the persistent record store.
/// Every write is an idempotent upsert on the record's natural key.
#[async_trait]
pub trait SightingStore: Send + Sync {
    /// Applies a batch of writes atomically.
    async fn commit(&self, batch: &[WriteRequest]) -> Result<()>;

    /// Reads every persisted spawn point.
    async fn load_spawns(&self) -> Result<Vec<SpawnPointRecord>>;

    /// Reads the seen-range samples of one spawn point.
    async fn historical_samples(&self, spawn_id: SpawnId) -> Result<Vec<SeenSample>>;

    /// Reads the seen-range samples of every spawn point.
    async fn all_samples(&self) -> Result<Vec<(SpawnId, SeenSample)>>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool>;
}

/// Durable key/value snapshots of in-memory state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(&self, key: &str, blob: &serde_json::Value) -> Result<()>;

    async fn load_snapshot(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

#[derive(Debug, Clone)]
struct MysteryRow {
    mystery: Mystery,
    sample: SeenSample,
}

#[derive(Debug, Default)]
struct MemoryTables {
    sightings: BTreeMap<(EncounterId, i64), Sighting>,
    mysteries: BTreeMap<(EncounterId, SpawnId), MysteryRow>,
    spawnpoints: BTreeMap<SpawnId, SpawnPointRecord>,
    features: BTreeMap<String, Coordinates>,
    feature_sightings: BTreeMap<(String, i64), FeatureSighting>,
    throttle_failures: BTreeMap<String, u32>,
    snapshots: HashMap<String, serde_json::Value>,
}

impl MemoryTables {
    fn apply(&mut self, request: &WriteRequest) {
        match request {
            WriteRequest::Sighting(s) => {
                self.sightings
                    .entry((s.encounter_id, s.expire_timestamp))
                    .or_insert_with(|| s.clone());
            }
            WriteRequest::Mystery(m) => {
                self.mysteries
                    .entry((m.encounter_id, m.spawn_id))
                    .or_insert_with(|| MysteryRow {
                        mystery: m.clone(),
                        sample: SeenSample::from_observations(m.seen, m.seen),
                    });
            }
            WriteRequest::FeatureSighting(f) => {
                self.features.entry(f.feature_id.clone()).or_insert(f.coords);
                self.feature_sightings
                    .entry((f.feature_id.clone(), f.last_modified))
                    .or_insert_with(|| f.clone());
            }
            WriteRequest::FeatureLocation(l) => {
                self.features.entry(l.feature_id.clone()).or_insert(l.coords);
            }
            WriteRequest::ThrottleFailures { username, failures } => {
                self.throttle_failures.insert(username.clone(), *failures);
            }
            WriteRequest::DeadlineCorrection(c) => {
                if let Some(row) = self.mysteries.get_mut(&(c.encounter_id, c.spawn_id)) {
                    row.sample = SeenSample::from_observations(row.sample.first_seen, c.last_seen);
                }
            }
            WriteRequest::SpawnPoint(p) => match p.despawn_offset {
                Some(_) => {
                    self.spawnpoints.insert(p.spawn_id, p.clone());
                }
                None => {
                    self.spawnpoints.entry(p.spawn_id).or_insert_with(|| p.clone());
                }
            },
        }
    }
}

/// In-memory store used by tests and dry runs. Commits can be slowed down
/// or made to fail to exercise the write path.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    commits: AtomicUsize,
    fail_next_commit: AtomicBool,
    commit_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every following commit wait this long before applying.
    pub fn set_commit_delay(&self, delay: Duration) {
        *self.commit_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Make the next commit fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn sightings(&self) -> Vec<Sighting> {
        self.tables().sightings.values().cloned().collect()
    }

    pub fn mysteries(&self) -> Vec<Mystery> {
        self.tables().mysteries.values().map(|r| r.mystery.clone()).collect()
    }

    pub fn feature_sighting_count(&self) -> usize {
        self.tables().feature_sightings.len()
    }

    pub fn feature_count(&self) -> usize {
        self.tables().features.len()
    }

    pub fn spawn_point(&self, spawn_id: SpawnId) -> Option<SpawnPointRecord> {
        self.tables().spawnpoints.get(&spawn_id).cloned()
    }

    pub fn throttle_failures(&self, username: &str) -> Option<u32> {
        self.tables().throttle_failures.get(username).copied()
    }

    /// Seed a spawn point directly, bypassing the write path.
    pub fn insert_spawn(&self, record: SpawnPointRecord) {
        self.tables().spawnpoints.insert(record.spawn_id, record);
    }

    /// Seed a seen-range sample directly, bypassing the write path.
    pub fn insert_sample(&self, mystery: Mystery, last_seen: i64) {
        let sample = SeenSample::from_observations(mystery.seen, last_seen);
        self.tables()
            .mysteries
            .insert((mystery.encounter_id, mystery.spawn_id), MysteryRow { mystery, sample });
    }
}

#[async_trait]
impl SightingStore for MemoryStore {
    async fn commit(&self, batch: &[WriteRequest]) -> Result<()> {
        let delay = *self.commit_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            bail!("simulated commit failure");
        }
        let mut tables = self.tables();
        for request in batch {
            tables.apply(request);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        debug!("Committed {} writes to memory store", batch.len());
        Ok(())
    }

    async fn load_spawns(&self) -> Result<Vec<SpawnPointRecord>> {
        Ok(self.tables().spawnpoints.values().cloned().collect())
    }

    async fn historical_samples(&self, spawn_id: SpawnId) -> Result<Vec<SeenSample>> {
        Ok(self
            .tables()
            .mysteries
            .iter()
            .filter(|((_, s), _)| *s == spawn_id)
            .map(|(_, row)| row.sample)
            .collect())
    }

    async fn all_samples(&self) -> Result<Vec<(SpawnId, SeenSample)>> {
        Ok(self
            .tables()
            .mysteries
            .iter()
            .map(|((_, s), row)| (*s, row.sample))
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save_snapshot(&self, key: &str, blob: &serde_json::Value) -> Result<()> {
        self.tables().snapshots.insert(key.to_string(), blob.clone());
        Ok(())
    }

    async fn load_snapshot(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.tables().snapshots.get(key).cloned())
    }
}

/// Build the spawn point write that accompanies an authoritative sighting.
pub fn spawn_point_for(sighting: &Sighting) -> SpawnPointRecord {
    SpawnPointRecord {
        spawn_id: sighting.spawn_id,
        coords: sighting.coords,
        despawn_offset: Some(timing::hour_offset(sighting.expire_timestamp)),
        updated: timing::now_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeadlineCorrection;

    fn sighting(encounter_id: EncounterId, expire: i64) -> Sighting {
        Sighting {
            encounter_id,
            spawn_id: 5,
            species_id: 16,
            coords: Coordinates::new(1.0, 2.0),
            seen: expire - 900,
            expire_timestamp: expire,
            inferred: false,
            detail: None,
        }
    }

    #[tokio::test]
    async fn test_sighting_upsert_is_idempotent() -> Result<()> {
        let store = MemoryStore::new();
        let s = sighting(1, 10_000);
        store
            .commit(&[WriteRequest::Sighting(s.clone()), WriteRequest::Sighting(s.clone())])
            .await?;
        store.commit(&[WriteRequest::Sighting(s)]).await?;
        assert_eq!(store.sightings().len(), 1);
        assert_eq!(store.commit_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_correction_updates_sample() -> Result<()> {
        let store = MemoryStore::new();
        let m = Mystery {
            encounter_id: 3,
            spawn_id: 8,
            species_id: 1,
            coords: Coordinates::new(1.0, 2.0),
            seen: 7200 + 100,
            detail: None,
        };
        store.commit(&[WriteRequest::Mystery(m)]).await?;
        store
            .commit(&[WriteRequest::DeadlineCorrection(DeadlineCorrection {
                encounter_id: 3,
                spawn_id: 8,
                first_seen: 7300,
                last_seen: 7900,
            })])
            .await?;
        let samples = store.historical_samples(8).await?;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].first_seconds, 100);
        assert_eq!(samples[0].last_seconds, 700);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() -> Result<()> {
        let store = MemoryStore::new();
        store.fail_next_commit();
        assert!(store.commit(&[WriteRequest::Sighting(sighting(1, 10))]).await.is_err());
        assert!(store.sightings().is_empty());
        store.commit(&[WriteRequest::Sighting(sighting(1, 10))]).await?;
        assert_eq!(store.sightings().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_offset_does_not_overwrite_known() -> Result<()> {
        let store = MemoryStore::new();
        let known = spawn_point_for(&sighting(1, 7200 + 1234));
        store.commit(&[WriteRequest::SpawnPoint(known)]).await?;
        store
            .commit(&[WriteRequest::SpawnPoint(SpawnPointRecord {
                spawn_id: 5,
                coords: Coordinates::new(1.0, 2.0),
                despawn_offset: None,
                updated: 0,
            })])
            .await?;
        assert_eq!(store.spawn_point(5).and_then(|p| p.despawn_offset), Some(1234));
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshots_round_trip() -> Result<()> {
        let store = MemoryStore::new();
        assert!(store.load_snapshot("spawns").await?.is_none());
        store.save_snapshot("spawns", &serde_json::json!({"a": 1})).await?;
        assert_eq!(store.load_snapshot("spawns").await?, Some(serde_json::json!({"a": 1})));
        Ok(())
    }
}
