//! Status reporting.
//!
//! The overseer keeps plain atomic counters; `StatusReport` turns them and
//! the per-worker telemetry into one serializable snapshot that is logged on
//! every status tick and returned to callers on demand.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::scanner::pool::Census;
use crate::scanner::worker::WorkerSnapshot;
use crate::scanner::write_buffer::WriteStatsSnapshot;

/// Dispatch counters owned by the overseer.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub dispatched: AtomicU64,
    pub visits: AtomicU64,
    pub skipped: AtomicU64,
    pub redundant: AtomicU64,
    pub loop_errors: AtomicU64,
}

impl DispatchCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            visits: self.visits.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            redundant: self.redundant.load(Ordering::Relaxed),
            loop_errors: self.loop_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub dispatched: u64,
    pub visits: u64,
    /// Timed points no worker could reach in time
    pub skipped: u64,
    /// Timed points dropped because they were already cached
    pub redundant: u64,
    pub loop_errors: u64,
}

/// Min, median and max of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
    pub min: f64,
    pub median: f64,
    pub max: f64,
}

impl Stats {
    /// Returns `None` for an empty sample.
    pub fn generate(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Some(Self {
            min: sorted[0],
            median,
            max: sorted[sorted.len() - 1],
        })
    }
}

/// Registry and cache sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    pub timed_spawns: usize,
    pub mystery_spawns: usize,
    pub cell_points: usize,
    pub cached_sightings: u64,
    pub cached_mysteries: u64,
    pub cached_features: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: i64,
    pub uptime_secs: f64,
    pub dispatch: DispatchSnapshot,
    pub in_flight: usize,
    pub inventory: Inventory,
    pub identities: Census,
    pub writes: WriteStatsSnapshot,
    /// Travel speed of the most recent assignment per worker
    pub speed: Option<Stats>,
    /// Seconds between deadline and visit per worker
    pub after_spawn: Option<Stats>,
    pub workers: Vec<WorkerSnapshot>,
}

impl StatusReport {
    /// One-line summary for the periodic status log.
    pub fn summary(&self) -> String {
        let healthy = self.workers.iter().filter(|w| w.telemetry.error.is_none()).count();
        let mut line = format!(
            "visits: {}, skipped: {}, redundant: {}, in flight: {}, workers ok: {}/{}, identities: {} available / {} awaiting solve / {} retired, pending writes: {}",
            self.dispatch.visits,
            self.dispatch.skipped,
            self.dispatch.redundant,
            self.in_flight,
            healthy,
            self.workers.len(),
            self.identities.available.len(),
            self.identities.manual_solve.len(),
            self.identities.retired.len(),
            self.writes.pending,
        );
        if let Some(speed) = self.speed {
            line.push_str(&format!(
                ", speed {:.1}/{:.1}/{:.1} km/h",
                speed.min, speed.median, speed.max
            ));
        }
        if let Some(after) = self.after_spawn {
            line.push_str(&format!(
                ", after spawn {:.1}/{:.1}/{:.1}s",
                after.min, after.median, after.max
            ));
        }
        line
    }
}
