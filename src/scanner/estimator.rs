//! Deadline estimation for spawn points whose despawn offset is unknown.
//!
//! Each untimed record contributes a first/last seen sample. The estimator
//! folds every sample newer than the migration cutoff into a window of hour
//! offsets in which the record most likely expires.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scanner::timing::{self, time_until_time};
use crate::types::{SeenSample, SpawnId};

/// Shortest observed lifetime after the last sighting.
pub const MIN_OFFSET: i64 = 90;
/// Longest lifetime after the first sighting.
pub const MAX_OFFSET: i64 = 1800;
/// Spreads wider than this mean the point does not follow a single hourly period.
pub const WIDE_SPREAD: i64 = 1710;

/// How much the returned window can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// No usable samples, default window
    Unsampled,
    /// Samples agree on a single period
    Tight,
    /// Samples are spread too widely; the window spans every hypothesis
    Wide,
}

/// Expiry window expressed as offsets from the top of the hour. Values may
/// exceed 3600 when the window reaches into the next hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineWindow {
    pub soonest: i64,
    pub latest: i64,
    pub confidence: Confidence,
}

impl DeadlineWindow {
    /// Seconds from `reference` (an hour offset) until each bound.
    pub fn remaining(&self, reference: i64) -> (i64, i64) {
        (
            time_until_time(self.soonest, reference),
            time_until_time(self.latest, reference),
        )
    }
}

/// Compute the window for a set of samples.
///
/// `seen` is the hour offset of a fresh observation that should widen the
/// sampled range; `now_offset` is used as reference when it is absent.
pub fn estimate_window(
    samples: &[SeenSample],
    seen: Option<i64>,
    now_offset: i64,
    last_migration: i64,
) -> DeadlineWindow {
    let reference = seen.unwrap_or(now_offset);
    let mut usable = samples.iter().filter(|s| s.first_seen > last_migration);

    let Some(head) = usable.next() else {
        return DeadlineWindow {
            soonest: reference + MIN_OFFSET,
            latest: reference + MAX_OFFSET,
            confidence: Confidence::Unsampled,
        };
    };

    let (mut first, mut last) = usable.fold((head.first_seconds, head.last_seconds), |(f, l), s| {
        (f.min(s.first_seconds), l.max(s.last_seconds))
    });

    if let Some(seen) = seen {
        if seen > last {
            last = seen;
        } else if seen < first {
            first = seen;
        }
    }

    if last - first > WIDE_SPREAD {
        let hypotheses = [
            first + MIN_OFFSET,
            last + MIN_OFFSET,
            first + MAX_OFFSET,
            last + MAX_OFFSET,
        ];
        let estimates = hypotheses.map(|h| time_until_time(h, reference));
        let soonest = estimates.iter().copied().min().unwrap_or(MIN_OFFSET);
        let latest = estimates.iter().copied().max().unwrap_or(MAX_OFFSET);
        return DeadlineWindow {
            soonest: reference + soonest,
            latest: reference + latest,
            confidence: Confidence::Wide,
        };
    }

    DeadlineWindow {
        soonest: last + MIN_OFFSET,
        latest: first + MAX_OFFSET,
        confidence: Confidence::Tight,
    }
}

/// In-memory index of historical samples per spawn point.
pub struct DeadlineEstimator {
    samples: RwLock<HashMap<SpawnId, Vec<SeenSample>>>,
    last_migration: i64,
}

impl DeadlineEstimator {
    /// Create an empty estimator that ignores samples first seen before `last_migration`.
    pub fn new(last_migration: i64) -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            last_migration,
        }
    }

    /// Replace the index with samples loaded from the store.
    pub fn load(&self, samples: Vec<(SpawnId, SeenSample)>) {
        let mut index: HashMap<SpawnId, Vec<SeenSample>> = HashMap::new();
        for (spawn_id, sample) in samples {
            index.entry(spawn_id).or_default().push(sample);
        }
        debug!("Loaded seen samples for {} spawn points", index.len());
        *self.samples.write().unwrap_or_else(|e| e.into_inner()) = index;
    }

    /// Add a sample, replacing an earlier one that started at the same time.
    pub fn record(&self, spawn_id: SpawnId, sample: SeenSample) {
        let mut index = self.samples.write().unwrap_or_else(|e| e.into_inner());
        let entry = index.entry(spawn_id).or_default();
        match entry.iter_mut().find(|s| s.first_seen == sample.first_seen) {
            Some(existing) => *existing = sample,
            None => entry.push(sample),
        }
    }

    /// Window for a spawn point, optionally widened by a fresh observation offset.
    pub fn estimate(&self, spawn_id: SpawnId, seen: Option<i64>) -> DeadlineWindow {
        let index = self.samples.read().unwrap_or_else(|e| e.into_inner());
        let samples = index.get(&spawn_id).map(Vec::as_slice).unwrap_or(&[]);
        estimate_window(samples, seen, timing::hour_offset(timing::now_secs()), self.last_migration)
    }

    /// Conservative expiry timestamp for a record seen at `seen`, available
    /// only when the samples agree on a single period.
    pub fn infer_expiry(&self, spawn_id: SpawnId, seen: i64) -> Option<i64> {
        let offset = timing::hour_offset(seen);
        let window = self.estimate(spawn_id, Some(offset));
        if window.confidence != Confidence::Tight {
            return None;
        }
        let (soonest, _) = window.remaining(offset);
        Some(seen + soonest)
    }

    /// Number of spawn points with at least one sample.
    pub fn sampled_spawns(&self) -> usize {
        self.samples.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPOCH: i64 = 1_481_932_800;

    fn sample(first: i64, last: i64) -> SeenSample {
        SeenSample {
            first_seen: EPOCH + 3600 * 10 + first,
            first_seconds: first,
            last_seconds: last,
        }
    }

    #[test]
    fn test_tight_window_uses_documented_offsets() {
        let window = estimate_window(&[sample(10, 50)], None, 1000, EPOCH);
        assert_eq!(window.confidence, Confidence::Tight);
        assert_eq!(window.soonest, 50 + 90);
        assert_eq!(window.latest, 10 + 1800);
    }

    #[test]
    fn test_wide_window_spans_all_hypotheses() {
        let samples = [sample(100, 200), sample(300, 2000)];
        let reference = 500;
        let window = estimate_window(&samples, Some(reference), 0, EPOCH);
        assert_eq!(window.confidence, Confidence::Wide);

        let hypotheses = [100 + 90, 2000 + 90, 100 + 1800, 2000 + 1800];
        let estimates: Vec<i64> = hypotheses.iter().map(|h| time_until_time(*h, reference)).collect();
        let min = *estimates.iter().min().unwrap();
        let max = *estimates.iter().max().unwrap();
        assert_eq!(window.remaining(reference), (min, max));
        assert_eq!(window.soonest, reference + min);
        assert_eq!(window.latest, reference + max);
    }

    #[test]
    fn test_unsampled_window_defaults() {
        let window = estimate_window(&[], None, 600, EPOCH);
        assert_eq!(window.confidence, Confidence::Unsampled);
        assert_eq!(window.remaining(600), (90, 1800));
    }

    #[test]
    fn test_samples_before_migration_are_ignored() {
        let stale = SeenSample {
            first_seen: EPOCH - 10,
            first_seconds: 10,
            last_seconds: 50,
        };
        let window = estimate_window(&[stale], None, 600, EPOCH);
        assert_eq!(window.confidence, Confidence::Unsampled);
    }

    #[test]
    fn test_seen_extends_range() {
        let window = estimate_window(&[sample(100, 200)], Some(400), 0, EPOCH);
        assert_eq!(window.soonest, 400 + 90);
        assert_eq!(window.latest, 100 + 1800);
    }

    #[test]
    fn test_infer_expiry_requires_tight_window() {
        let estimator = DeadlineEstimator::new(EPOCH);
        assert_eq!(estimator.infer_expiry(7, EPOCH + 7200 + 60), None);

        estimator.record(7, sample(10, 50));
        let seen = EPOCH + 7200 * 2 + 30;
        // soonest offset 140 is 110 seconds after offset 30
        assert_eq!(estimator.infer_expiry(7, seen), Some(seen + 110));
        assert_eq!(estimator.sampled_spawns(), 1);
    }

    #[test]
    fn test_record_replaces_same_start() {
        let estimator = DeadlineEstimator::new(EPOCH);
        estimator.record(1, sample(10, 50));
        estimator.record(1, sample(10, 70));
        let window = estimator.estimate(1, Some(20));
        assert_eq!(window.soonest, 70 + 90);
    }
}
