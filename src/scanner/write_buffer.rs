//! WriteBuffer - single consumer between the scanner and the store.
//!
//! Workers push records through a cloneable `WriteHandle` and never wait on
//! the store. The buffer drops duplicates against the dedup caches as
//! requests arrive, keeps the spawn registry and the estimator in step with
//! what is written, and commits everything pending in one transaction on a
//! fixed tick or once the batch is large enough.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scanner::cache::DedupCaches;
use crate::scanner::config::ScanConfig;
use crate::scanner::estimator::DeadlineEstimator;
use crate::scanner::spawns::SpawnRegistry;
use crate::scanner::storage::{spawn_point_for, SightingStore};
use crate::scanner::timing;
use crate::types::{
    DeadlineCorrection, FeatureLocation, FeatureSighting, Mystery, SeenSample, Sighting, SpawnPointRecord,
};

/// One unit of work for the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Sighting(Sighting),
    Mystery(Mystery),
    FeatureSighting(FeatureSighting),
    FeatureLocation(FeatureLocation),
    ThrottleFailures { username: String, failures: u32 },
    DeadlineCorrection(DeadlineCorrection),
    SpawnPoint(SpawnPointRecord),
}

/// Counters shared between the buffer and the status report.
#[derive(Debug, Default)]
pub struct WriteStats {
    queued: AtomicU64,
    duplicates: AtomicU64,
    committed: AtomicU64,
    failed_batches: AtomicU64,
    pending: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStatsSnapshot {
    pub queued: u64,
    pub duplicates: u64,
    pub committed: u64,
    pub failed_batches: u64,
    pub pending: u64,
}

impl WriteStats {
    pub fn snapshot(&self) -> WriteStatsSnapshot {
        WriteStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

/// Non-blocking sender into the write buffer.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<WriteRequest>,
    stats: Arc<WriteStats>,
}

impl WriteHandle {
    /// Queue a request. Returns false once the buffer has shut down.
    pub fn send(&self, request: WriteRequest) -> bool {
        match self.tx.send(request) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!("Write buffer closed, dropping {:?}", e.0);
                false
            }
        }
    }

    pub fn stats(&self) -> WriteStatsSnapshot {
        self.stats.snapshot()
    }
}

pub struct WriteBuffer {
    requests: Option<mpsc::UnboundedReceiver<WriteRequest>>,
    corrections: Option<mpsc::UnboundedReceiver<DeadlineCorrection>>,
    store: Arc<dyn SightingStore>,
    caches: Arc<DedupCaches>,
    spawns: Arc<SpawnRegistry>,
    estimator: Arc<DeadlineEstimator>,
    pending: Vec<WriteRequest>,
    stats: Arc<WriteStats>,
    commit_interval: Duration,
    max_batch: usize,
    grace: Duration,
    flush: CancellationToken,
}

impl WriteBuffer {
    /// Create a new WriteBuffer and the handle used to feed it.
    ///
    /// `corrections` is the receiving end of the channel the mystery cache
    /// reports expired entries on. The buffer runs until `flush` is
    /// cancelled, then drains and commits what is left.
    pub fn new(
        store: Arc<dyn SightingStore>,
        caches: Arc<DedupCaches>,
        spawns: Arc<SpawnRegistry>,
        estimator: Arc<DeadlineEstimator>,
        corrections: mpsc::UnboundedReceiver<DeadlineCorrection>,
        config: &ScanConfig,
        flush: CancellationToken,
    ) -> (Self, WriteHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WriteStats::default());
        let buffer = Self {
            requests: Some(rx),
            corrections: Some(corrections),
            store,
            caches,
            spawns,
            estimator,
            pending: Vec::new(),
            stats: stats.clone(),
            commit_interval: timing::secs(config.commit_interval),
            max_batch: config.max_batch,
            grace: timing::secs(config.shutdown_grace),
            flush,
        };
        (buffer, WriteHandle { tx, stats })
    }

    /// Main execution loop.
    pub async fn run(mut self) -> Result<()> {
        let mut requests = match self.requests.take() {
            Some(receiver) => receiver,
            None => anyhow::bail!("WriteBuffer::run() called twice"),
        };
        let mut corrections = match self.corrections.take() {
            Some(receiver) => receiver,
            None => anyhow::bail!("WriteBuffer::run() called twice"),
        };

        info!("WriteBuffer is running, committing every {:?}", self.commit_interval);
        let mut tick = tokio::time::interval(self.commit_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(request) = requests.recv() => {
                    self.admit(request).await;
                    if self.pending.len() >= self.max_batch {
                        self.commit().await;
                    }
                },
                Some(correction) = corrections.recv() => {
                    self.admit_correction(correction);
                },
                _ = tick.tick() => {
                    self.caches.run_pending_tasks().await;
                    self.commit().await;
                },
                _ = self.flush.cancelled() => {
                    info!("WriteBuffer flushing before shutdown");
                    break;
                },
            }
        }

        self.drain(&mut requests, &mut corrections).await;
        Ok(())
    }

    async fn drain(
        &mut self,
        requests: &mut mpsc::UnboundedReceiver<WriteRequest>,
        corrections: &mut mpsc::UnboundedReceiver<DeadlineCorrection>,
    ) {
        // 1. Seen-range updates of mysteries that are still cached
        for correction in self.caches.mysteries.pending_corrections() {
            self.admit_correction(correction);
        }

        // 2. Everything already queued
        while let Ok(request) = requests.try_recv() {
            self.admit(request).await;
        }
        while let Ok(correction) = corrections.try_recv() {
            self.admit_correction(correction);
        }

        // 3. Final commit, bounded by the grace period
        let count = self.pending.len();
        if tokio::time::timeout(self.grace, self.commit()).await.is_err() {
            error!("Final commit did not finish within {:?}, {} writes lost", self.grace, count);
        } else {
            info!("WriteBuffer drained, {} writes in final commit", count);
        }
    }

    /// Filter a request against the caches and queue it with its side effects.
    async fn admit(&mut self, request: WriteRequest) {
        let fresh = match &request {
            WriteRequest::Sighting(sighting) => self.admit_sighting(sighting).await,
            WriteRequest::Mystery(mystery) => self.admit_mystery(mystery).await,
            WriteRequest::FeatureSighting(feature) => {
                if self.caches.features.contains_sighting(feature).await {
                    false
                } else {
                    self.caches.features.add_sighting(feature).await;
                    true
                }
            }
            WriteRequest::FeatureLocation(location) => {
                if self.caches.features.contains_location(location).await {
                    false
                } else {
                    self.caches.features.add_location(location).await;
                    true
                }
            }
            WriteRequest::ThrottleFailures { .. }
            | WriteRequest::DeadlineCorrection(_)
            | WriteRequest::SpawnPoint(_) => true,
        };
        if fresh {
            self.push(request);
        } else {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn admit_sighting(&mut self, sighting: &Sighting) -> bool {
        if self.caches.sightings.contains(sighting).await {
            return false;
        }
        self.caches.sightings.add(sighting).await;
        if !sighting.inferred {
            let offset = timing::hour_offset(sighting.expire_timestamp);
            if self.spawns.add_known(sighting.spawn_id, offset, sighting.coords) {
                self.push(WriteRequest::SpawnPoint(spawn_point_for(sighting)));
            }
        }
        true
    }

    async fn admit_mystery(&mut self, mystery: &Mystery) -> bool {
        if self.caches.mysteries.contains(mystery).await {
            return false;
        }
        self.caches.mysteries.add(mystery).await;
        self.estimator
            .record(mystery.spawn_id, SeenSample::from_observations(mystery.seen, mystery.seen));
        if self.spawns.bounds().contains(mystery.coords) && self.spawns.add_mystery(mystery.coords) {
            self.push(WriteRequest::SpawnPoint(SpawnPointRecord {
                spawn_id: mystery.spawn_id,
                coords: mystery.coords,
                despawn_offset: None,
                updated: timing::now_secs(),
            }));
        }
        true
    }

    fn admit_correction(&mut self, correction: DeadlineCorrection) {
        debug!(
            "Seen range of spawn {} extends to {}s",
            correction.spawn_id,
            correction.last_seen - correction.first_seen
        );
        self.estimator.record(
            correction.spawn_id,
            SeenSample::from_observations(correction.first_seen, correction.last_seen),
        );
        self.push(WriteRequest::DeadlineCorrection(correction));
    }

    fn push(&mut self, request: WriteRequest) {
        self.pending.push(request);
        self.stats.pending.store(self.pending.len() as u64, Ordering::Relaxed);
    }

    /// Commit every pending request in one store transaction. On failure the
    /// cache entries of the batch are dropped so the records are written
    /// again when next observed.
    async fn commit(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        self.stats.pending.store(0, Ordering::Relaxed);

        match self.store.commit(&batch).await {
            Ok(()) => {
                self.stats.committed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!("Committed {} writes", batch.len());
            }
            Err(e) => {
                self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!("Failed to commit {} writes: {:?}", batch.len(), e);
                for request in &batch {
                    self.forget(request).await;
                }
            }
        }
    }

    async fn forget(&self, request: &WriteRequest) {
        match request {
            WriteRequest::Sighting(sighting) => self.caches.sightings.remove(sighting).await,
            WriteRequest::Mystery(mystery) => self.caches.mysteries.remove(mystery).await,
            WriteRequest::FeatureSighting(feature) => self.caches.features.remove_sighting(feature).await,
            WriteRequest::FeatureLocation(location) => self.caches.features.remove_location(location).await,
            WriteRequest::ThrottleFailures { .. }
            | WriteRequest::DeadlineCorrection(_)
            | WriteRequest::SpawnPoint(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::geo::Bounds;
    use crate::scanner::storage::MemoryStore;
    use crate::types::Coordinates;

    struct Harness {
        store: Arc<MemoryStore>,
        spawns: Arc<SpawnRegistry>,
        estimator: Arc<DeadlineEstimator>,
        handle: WriteHandle,
        flush: CancellationToken,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn harness(commit_interval: f64) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let spawns = Arc::new(SpawnRegistry::new(Bounds::from_corners(
            Coordinates::new(0.0, 0.0),
            Coordinates::new(1.0, 1.0),
        )));
        let estimator = Arc::new(DeadlineEstimator::new(0));
        let (corrections_tx, corrections_rx) = mpsc::unbounded_channel();
        let caches = Arc::new(DedupCaches::new(3600.0, corrections_tx));
        let config = ScanConfig {
            commit_interval,
            ..ScanConfig::default()
        };
        let flush = CancellationToken::new();
        let (buffer, handle) = WriteBuffer::new(
            store.clone(),
            caches,
            spawns.clone(),
            estimator.clone(),
            corrections_rx,
            &config,
            flush.clone(),
        );
        let task = tokio::spawn(buffer.run());
        Harness {
            store,
            spawns,
            estimator,
            handle,
            flush,
            task,
        }
    }

    fn sighting(encounter_id: u64, expire: i64) -> Sighting {
        Sighting {
            encounter_id,
            spawn_id: 11,
            species_id: 10,
            coords: Coordinates::new(0.5, 0.5),
            seen: expire - 600,
            expire_timestamp: expire,
            inferred: false,
            detail: None,
        }
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped_before_commit() -> Result<()> {
        let h = harness(0.05);
        let expire = timing::now_secs() + 900;
        h.handle.send(WriteRequest::Sighting(sighting(1, expire)));
        h.handle.send(WriteRequest::Sighting(sighting(1, expire + 1)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.store.sightings().len(), 1);
        assert_eq!(h.handle.stats().duplicates, 1);
        assert_eq!(h.spawns.offset(11), Some(timing::hour_offset(expire)));
        assert!(h.store.spawn_point(11).is_some());

        h.flush.cancel();
        h.task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_flush_commits_pending_writes() -> Result<()> {
        let h = harness(3600.0);
        let now = timing::now_secs();
        h.handle.send(WriteRequest::Mystery(Mystery {
            encounter_id: 4,
            spawn_id: 12,
            species_id: 1,
            coords: Coordinates::new(0.2, 0.2),
            seen: now,
            detail: None,
        }));
        h.handle.send(WriteRequest::ThrottleFailures {
            username: "alpha".to_string(),
            failures: 2,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.mysteries().is_empty());

        h.flush.cancel();
        h.task.await??;
        assert_eq!(h.store.mysteries().len(), 1);
        assert_eq!(h.store.throttle_failures("alpha"), Some(2));
        assert_eq!(h.spawns.mystery_len(), 1);
        assert_eq!(h.estimator.sampled_spawns(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_commit_allows_rewrite() -> Result<()> {
        let h = harness(0.05);
        h.store.fail_next_commit();
        let expire = timing::now_secs() + 900;
        h.handle.send(WriteRequest::Sighting(sighting(1, expire)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.store.sightings().is_empty());

        h.handle.send(WriteRequest::Sighting(sighting(1, expire)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.store.sightings().len(), 1);

        h.flush.cancel();
        h.task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_slow_store_does_not_block_senders() -> Result<()> {
        let h = harness(0.01);
        h.store.set_commit_delay(Duration::from_millis(500));
        let expire = timing::now_secs() + 900;
        h.handle.send(WriteRequest::Sighting(sighting(1, expire)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        for i in 0..100 {
            h.handle.send(WriteRequest::FeatureLocation(FeatureLocation {
                feature_id: format!("stop-{}", i),
                coords: Coordinates::new(0.3, 0.3),
            }));
        }
        assert!(started.elapsed() < Duration::from_millis(50));

        h.flush.cancel();
        h.task.await??;
        assert_eq!(h.store.feature_count(), 100);
        Ok(())
    }
}
