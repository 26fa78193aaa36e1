//! Spawn registry: every point the scanner knows about.
//!
//! A point is either timed (its record reliably disappears at a fixed offset
//! within each hour) or untimed (a "mystery" whose offset has not been
//! established yet). Cell points are candidate locations reported
//! incidentally by the service that have never produced a record.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::RwLock;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scanner::geo::Bounds;
use crate::scanner::timing::{self, HOUR};
use crate::types::{Coordinates, PointKey, SpawnId, SpawnPointRecord};

/// A spawn point with an established despawn offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnownSpawn {
    pub coords: Coordinates,
    /// Seconds after the top of the hour at which records vanish
    pub offset: i64,
}

/// Entry of the hourly schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpawn {
    pub spawn_id: SpawnId,
    pub coords: Coordinates,
    pub offset: i64,
}

/// Serializable registry contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnState {
    spawns: BTreeMap<SpawnId, KnownSpawn>,
    known_points: BTreeSet<PointKey>,
    mysteries: BTreeSet<PointKey>,
    cell_points: BTreeSet<PointKey>,
    /// Bounds fingerprint of the area this state was collected for
    fingerprint: String,
}

/// Thread-safe registry shared by the overseer, workers and the write buffer.
pub struct SpawnRegistry {
    state: RwLock<SpawnState>,
    bounds: Bounds,
}

impl SpawnRegistry {
    /// Create an empty registry for the given scan area.
    pub fn new(bounds: Bounds) -> Self {
        let state = SpawnState {
            fingerprint: bounds.fingerprint(),
            ..SpawnState::default()
        };
        Self {
            state: RwLock::new(state),
            bounds,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SpawnState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SpawnState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Load spawn points read from the store. Points outside the scan area are ignored.
    pub fn load_records(&self, records: Vec<SpawnPointRecord>) {
        let mut timed = 0usize;
        let mut untimed = 0usize;
        for record in records {
            if !self.bounds.contains(record.coords) {
                continue;
            }
            match record.despawn_offset {
                Some(offset) => {
                    self.add_known(record.spawn_id, offset, record.coords);
                    timed += 1;
                }
                None => {
                    if self.add_mystery(record.coords) {
                        untimed += 1;
                    }
                }
            }
        }
        info!("Loaded {} timed and {} untimed spawn points", timed, untimed);
    }

    /// Restore a persisted snapshot. Returns false, leaving the registry
    /// untouched, when the snapshot was taken for a different area.
    pub fn restore(&self, snapshot: SpawnState) -> bool {
        let expected = self.bounds.fingerprint();
        if snapshot.fingerprint != expected {
            warn!(
                "Discarding spawn snapshot for area {} (current area {})",
                snapshot.fingerprint, expected
            );
            return false;
        }
        *self.write() = snapshot;
        true
    }

    /// Copy of the current state for persistence.
    pub fn snapshot(&self) -> SpawnState {
        self.read().clone()
    }

    /// Record an established despawn offset. The point stops being a mystery
    /// or cell point. Returns true if the offset changed.
    pub fn add_known(&self, spawn_id: SpawnId, offset: i64, coords: Coordinates) -> bool {
        let offset = offset.rem_euclid(HOUR);
        let key = coords.key();
        let mut state = self.write();
        state.mysteries.remove(&key);
        state.cell_points.remove(&key);
        state.known_points.insert(key);
        let previous = state.spawns.insert(spawn_id, KnownSpawn { coords, offset });
        let changed = previous.map_or(true, |p| p.offset != offset);
        if changed {
            debug!("Spawn {} now despawns at offset {}", spawn_id, offset);
        }
        changed
    }

    /// Record a point with an unknown offset. Ignored for timed points.
    pub fn add_mystery(&self, coords: Coordinates) -> bool {
        let key = coords.key();
        let mut state = self.write();
        if state.known_points.contains(&key) {
            return false;
        }
        state.cell_points.remove(&key);
        state.mysteries.insert(key)
    }

    /// Record an incidental candidate point inside the scan area.
    pub fn add_cell_point(&self, coords: Coordinates) -> bool {
        if !self.bounds.contains(coords) {
            return false;
        }
        let key = coords.key();
        let mut state = self.write();
        if state.known_points.contains(&key) || state.mysteries.contains(&key) {
            return false;
        }
        state.cell_points.insert(key)
    }

    /// Whether the point is already tracked in any category.
    pub fn have_point(&self, coords: Coordinates) -> bool {
        let key = coords.key();
        let state = self.read();
        state.known_points.contains(&key)
            || state.mysteries.contains(&key)
            || state.cell_points.contains(&key)
    }

    pub fn is_mystery(&self, coords: Coordinates) -> bool {
        self.read().mysteries.contains(&coords.key())
    }

    /// Despawn offset of a timed spawn.
    pub fn offset(&self, spawn_id: SpawnId) -> Option<i64> {
        self.read().spawns.get(&spawn_id).map(|s| s.offset)
    }

    /// Next despawn timestamp of a timed spawn at or after `seen`.
    pub fn despawn_time(&self, spawn_id: SpawnId, seen: i64) -> Option<i64> {
        let offset = self.offset(spawn_id)?;
        let despawn = timing::current_hour(seen) + offset;
        Some(if seen > despawn { despawn + HOUR } else { despawn })
    }

    /// Timed spawns ordered by offset.
    pub fn schedule(&self) -> Vec<ScheduledSpawn> {
        let state = self.read();
        let mut spawns: Vec<ScheduledSpawn> = state
            .spawns
            .iter()
            .map(|(id, s)| ScheduledSpawn {
                spawn_id: *id,
                coords: s.coords,
                offset: s.offset,
            })
            .collect();
        spawns.sort_by_key(|s| (s.offset, s.spawn_id));
        spawns
    }

    /// Shuffled queue of every untimed and candidate point.
    pub fn mysteries(&self) -> VecDeque<Coordinates> {
        let mut points: Vec<Coordinates> = {
            let state = self.read();
            state
                .mysteries
                .iter()
                .chain(state.cell_points.iter())
                .map(PointKey::coords)
                .collect()
        };
        points.shuffle(&mut rand::thread_rng());
        points.into()
    }

    pub fn timed_len(&self) -> usize {
        self.read().spawns.len()
    }

    pub fn mystery_len(&self) -> usize {
        self.read().mysteries.len()
    }

    pub fn cell_point_len(&self) -> usize {
        self.read().cell_points.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.read();
        state.spawns.is_empty() && state.mysteries.is_empty() && state.cell_points.is_empty()
    }
}
