//! Self-expiring dedup caches.
//!
//! Every entry carries its own deadline and is dropped by moka's timer wheel
//! once that deadline passes, so memory stays proportional to the records
//! that can still be observed. Three instances exist: timed sightings,
//! untimed mysteries and area features.

use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::scanner::timing;
use crate::types::{
    DeadlineCorrection, EncounterId, FeatureLocation, FeatureSighting, Mystery, Sighting, SpawnId,
};

/// Sightings of the same spawn whose expiry differs by less than this are duplicates.
pub const SIGHTING_TOLERANCE: i64 = 2;
/// Untimed records are remembered this long after first being seen.
pub const MYSTERY_LIFETIME: i64 = 3510;

const SIGHTING_CAPACITY: u64 = 200_000;
const MYSTERY_CAPACITY: u64 = 200_000;
const FEATURE_CAPACITY: u64 = 100_000;

/// Cache values that know when they stop being relevant.
pub trait Expiring {
    /// Unix timestamp (seconds) after which the entry must be gone.
    fn expires_at(&self) -> f64;
}

struct DeadlineExpiry;

impl<K, V: Expiring> Expiry<K, V> for DeadlineExpiry {
    fn expire_after_create(&self, _key: &K, value: &V, _created_at: Instant) -> Option<Duration> {
        Some(timing::until(value.expires_at()))
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &V,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(timing::until(value.expires_at()))
    }
}

/// Generic cache whose entries expire at a deadline taken from the value.
pub struct DedupCache<K, V> {
    inner: Cache<K, V>,
}

impl<K, V> DedupCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Expiring + Clone + Send + Sync + 'static,
{
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .expire_after(DeadlineExpiry)
            .build();
        Self { inner }
    }

    /// Create a cache that hands every expired or size-evicted entry to `listener`.
    pub fn with_eviction_listener<F>(capacity: u64, listener: F) -> Self
    where
        F: Fn(Arc<K>, V) + Send + Sync + 'static,
    {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .expire_after(DeadlineExpiry)
            .eviction_listener(move |key: Arc<K>, value: V, cause: RemovalCause| {
                if cause.was_evicted() {
                    listener(key, value);
                }
            })
            .build();
        Self { inner }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value).await;
    }

    pub async fn invalidate(&self, key: &K) {
        self.inner.invalidate(key).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Process expirations and pending evictions now.
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Copy of every live entry.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        let now = timing::now();
        self.inner
            .iter()
            .filter(|(_, v)| v.expires_at() > now)
            .map(|(k, v)| (K::clone(&k), v))
            .collect()
    }
}

/// Expiry of a cached timed sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SightingEntry {
    pub encounter_id: EncounterId,
    pub expire_timestamp: i64,
}

impl Expiring for SightingEntry {
    fn expires_at(&self) -> f64 {
        self.expire_timestamp as f64
    }
}

/// Timed sightings keyed by spawn point.
pub struct SightingCache {
    inner: DedupCache<SpawnId, SightingEntry>,
}

impl SightingCache {
    pub fn new() -> Self {
        Self {
            inner: DedupCache::new(SIGHTING_CAPACITY),
        }
    }

    /// True when the same spawn is cached with an expiry within the tolerance.
    pub async fn contains(&self, sighting: &Sighting) -> bool {
        match self.inner.get(&sighting.spawn_id).await {
            Some(entry) => (entry.expire_timestamp - sighting.expire_timestamp).abs() < SIGHTING_TOLERANCE,
            None => false,
        }
    }

    /// True when any live sighting is cached for the spawn.
    pub async fn contains_spawn(&self, spawn_id: SpawnId) -> bool {
        self.inner.get(&spawn_id).await.is_some()
    }

    pub async fn add(&self, sighting: &Sighting) {
        self.inner
            .insert(
                sighting.spawn_id,
                SightingEntry {
                    encounter_id: sighting.encounter_id,
                    expire_timestamp: sighting.expire_timestamp,
                },
            )
            .await;
    }

    /// Forget a sighting, only if the cached entry is the one given.
    pub async fn remove(&self, sighting: &Sighting) {
        if self.contains(sighting).await {
            self.inner.invalidate(&sighting.spawn_id).await;
        }
    }

    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SightingCache {
    fn default() -> Self {
        Self::new()
    }
}

/// First and last observation of an untimed record. `last` is shared so
/// that later observations update the live entry in place.
#[derive(Debug, Clone)]
pub struct MysteryEntry {
    pub first: i64,
    last: Arc<AtomicI64>,
}

impl MysteryEntry {
    fn new(first: i64) -> Self {
        Self {
            first,
            last: Arc::new(AtomicI64::new(first)),
        }
    }

    pub fn last(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }
}

impl Expiring for MysteryEntry {
    fn expires_at(&self) -> f64 {
        (self.first + MYSTERY_LIFETIME) as f64
    }
}

pub type MysteryKey = (EncounterId, SpawnId);

/// Untimed records keyed by (encounter, spawn). When an entry expires after
/// having been re-observed, a deadline correction is emitted.
pub struct MysteryCache {
    inner: DedupCache<MysteryKey, MysteryEntry>,
}

impl MysteryCache {
    pub fn new(corrections: mpsc::UnboundedSender<DeadlineCorrection>) -> Self {
        let inner = DedupCache::with_eviction_listener(MYSTERY_CAPACITY, move |key: Arc<MysteryKey>, entry: MysteryEntry| {
            if let Some(correction) = correction_for(*key, &entry) {
                if corrections.send(correction).is_err() {
                    warn!("Dropped deadline correction for spawn {}: buffer closed", key.1);
                }
            }
        });
        Self { inner }
    }

    /// True when the record is cached; a hit also advances the last-seen time.
    pub async fn contains(&self, mystery: &Mystery) -> bool {
        match self.inner.get(&(mystery.encounter_id, mystery.spawn_id)).await {
            Some(entry) => {
                entry.last.fetch_max(mystery.seen, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    pub async fn add(&self, mystery: &Mystery) {
        self.inner
            .insert((mystery.encounter_id, mystery.spawn_id), MysteryEntry::new(mystery.seen))
            .await;
    }

    pub async fn remove(&self, mystery: &Mystery) {
        self.inner.invalidate(&(mystery.encounter_id, mystery.spawn_id)).await;
    }

    /// Corrections for every live entry that was seen more than once.
    pub fn pending_corrections(&self) -> Vec<DeadlineCorrection> {
        self.inner
            .entries()
            .into_iter()
            .filter_map(|(key, entry)| correction_for(key, &entry))
            .collect()
    }

    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }
}

fn correction_for(key: MysteryKey, entry: &MysteryEntry) -> Option<DeadlineCorrection> {
    let last = entry.last();
    (last != entry.first).then_some(DeadlineCorrection {
        encounter_id: key.0,
        spawn_id: key.1,
        first_seen: entry.first,
        last_seen: last,
    })
}

/// Area feature cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKey {
    Structure(String),
    Location(String),
}

/// Cached feature state. Locations carry no modification time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEntry {
    pub last_modified: Option<i64>,
    pub expires_at: f64,
}

impl Expiring for FeatureEntry {
    fn expires_at(&self) -> f64 {
        self.expires_at
    }
}

/// Structure states and feature locations already written to the store.
pub struct FeatureCache {
    inner: DedupCache<FeatureKey, FeatureEntry>,
    ttl: f64,
}

impl FeatureCache {
    /// Create a cache whose entries live `ttl` seconds.
    pub fn new(ttl: f64) -> Self {
        Self {
            inner: DedupCache::new(FEATURE_CAPACITY),
            ttl,
        }
    }

    pub async fn contains_sighting(&self, sighting: &FeatureSighting) -> bool {
        let key = FeatureKey::Structure(sighting.feature_id.clone());
        matches!(self.inner.get(&key).await, Some(e) if e.last_modified == Some(sighting.last_modified))
    }

    pub async fn contains_location(&self, location: &FeatureLocation) -> bool {
        let key = FeatureKey::Location(location.feature_id.clone());
        self.inner.get(&key).await.is_some()
    }

    pub async fn add_sighting(&self, sighting: &FeatureSighting) {
        let entry = FeatureEntry {
            last_modified: Some(sighting.last_modified),
            expires_at: timing::now() + self.ttl,
        };
        self.inner.insert(FeatureKey::Structure(sighting.feature_id.clone()), entry).await;
    }

    pub async fn add_location(&self, location: &FeatureLocation) {
        let entry = FeatureEntry {
            last_modified: None,
            expires_at: timing::now() + self.ttl,
        };
        self.inner.insert(FeatureKey::Location(location.feature_id.clone()), entry).await;
    }

    pub async fn remove_sighting(&self, sighting: &FeatureSighting) {
        self.inner.invalidate(&FeatureKey::Structure(sighting.feature_id.clone())).await;
    }

    pub async fn remove_location(&self, location: &FeatureLocation) {
        self.inner.invalidate(&FeatureKey::Location(location.feature_id.clone())).await;
    }

    /// Live entries for persistence.
    pub fn snapshot(&self) -> Vec<(FeatureKey, FeatureEntry)> {
        self.inner.entries()
    }

    /// Reload persisted entries, skipping those already expired.
    pub async fn restore(&self, entries: Vec<(FeatureKey, FeatureEntry)>) {
        let now = timing::now();
        let mut restored = 0usize;
        for (key, entry) in entries {
            if entry.expires_at > now {
                self.inner.insert(key, entry).await;
                restored += 1;
            }
        }
        debug!("Restored {} feature cache entries", restored);
    }

    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The three dedup caches shared by workers, the overseer and the write buffer.
pub struct DedupCaches {
    pub sightings: SightingCache,
    pub mysteries: MysteryCache,
    pub features: FeatureCache,
}

impl DedupCaches {
    pub fn new(feature_ttl: f64, corrections: mpsc::UnboundedSender<DeadlineCorrection>) -> Self {
        Self {
            sightings: SightingCache::new(),
            mysteries: MysteryCache::new(corrections),
            features: FeatureCache::new(feature_ttl),
        }
    }

    /// Run expiry housekeeping on every cache.
    pub async fn run_pending_tasks(&self) {
        self.sightings.inner.run_pending_tasks().await;
        self.mysteries.run_pending_tasks().await;
        self.features.inner.run_pending_tasks().await;
    }
}
