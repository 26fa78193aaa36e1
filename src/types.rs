//! Core types and data structures for the spawnwatch scanner.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Stable identifier of a physical spawn point.
pub type SpawnId = u64;

/// Identifier of a single observed entity instance.
pub type EncounterId = u64;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Hashable key for this location, rounded to a micro-degree.
    pub fn key(&self) -> PointKey {
        PointKey::from(*self)
    }

    /// Return a copy moved by a uniform random offset of up to `amount` degrees on each axis.
    pub fn jitter(&self, amount: f64) -> Self {
        if amount <= 0.0 {
            return *self;
        }
        let mut rng = rand::thread_rng();
        Self {
            lat: self.lat + rng.gen_range(-amount..=amount),
            lon: self.lon + rng.gen_range(-amount..=amount),
        }
    }
}

/// Coordinates rounded to 1e-6 degrees so they can be used in sets and maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PointKey {
    lat_e6: i64,
    lon_e6: i64,
}

impl PointKey {
    pub fn coords(&self) -> Coordinates {
        Coordinates::new(self.lat_e6 as f64 / 1e6, self.lon_e6 as f64 / 1e6)
    }
}

impl From<Coordinates> for PointKey {
    fn from(c: Coordinates) -> Self {
        Self {
            lat_e6: (c.lat * 1e6).round() as i64,
            lon_e6: (c.lon * 1e6).round() as i64,
        }
    }
}

/// A timed record: an entity whose expiry is either reported by the service
/// or inferred from the spawn registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub encounter_id: EncounterId,
    pub spawn_id: SpawnId,
    pub species_id: u16,
    pub coords: Coordinates,
    /// Unix timestamp (seconds) when the record was observed
    pub seen: i64,
    /// Unix timestamp (seconds) after which the entity is gone
    pub expire_timestamp: i64,
    /// True when the expiry was derived locally rather than reported
    pub inferred: bool,
    pub detail: Option<EncounterStats>,
}

/// An untimed record: an entity seen at a spawn whose despawn offset is unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mystery {
    pub encounter_id: EncounterId,
    pub spawn_id: SpawnId,
    pub species_id: u16,
    pub coords: Coordinates,
    pub seen: i64,
    pub detail: Option<EncounterStats>,
}

/// Detailed stats fetched through a follow-up encounter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounterStats {
    pub attack: u8,
    pub defense: u8,
    pub stamina: u8,
    pub move_1: u16,
    pub move_2: u16,
}

/// State of a contested area structure at a given modification time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSighting {
    pub feature_id: String,
    pub coords: Coordinates,
    pub team: u8,
    pub prestige: u32,
    pub guard_species_id: u16,
    /// Unix timestamp (seconds) of the last state change reported by the service
    pub last_modified: i64,
}

/// Position of a static area feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLocation {
    pub feature_id: String,
    pub coords: Coordinates,
}

/// First/last observation pair of an untimed record, written back when the
/// record leaves the cache so the stored seen-range reflects every visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineCorrection {
    pub encounter_id: EncounterId,
    pub spawn_id: SpawnId,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// A spawn point row as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPointRecord {
    pub spawn_id: SpawnId,
    pub coords: Coordinates,
    /// Despawn offset in seconds within the hour, if known
    pub despawn_offset: Option<i64>,
    pub updated: i64,
}

/// One historical observation window of an untimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenSample {
    /// Unix timestamp of the first observation
    pub first_seen: i64,
    /// Offset within the hour of the first observation
    pub first_seconds: i64,
    /// Offset of the last observation, relative to the hour of the first one
    pub last_seconds: i64,
}

impl SeenSample {
    /// Build a sample from a first/last observation pair.
    pub fn from_observations(first_seen: i64, last_seen: i64) -> Self {
        let hour = first_seen - first_seen.rem_euclid(3600);
        Self {
            first_seen,
            first_seconds: first_seen - hour,
            last_seconds: last_seen - hour,
        }
    }

    pub fn range(&self) -> i64 {
        self.last_seconds - self.first_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_key_round_trip_precision() {
        let c = Coordinates::new(40.1234567, -73.7654321);
        let back = c.key().coords();
        assert!((back.lat - 40.123457).abs() < 1e-9);
        assert!((back.lon + 73.765432).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let c = Coordinates::new(10.0, 20.0);
        for _ in 0..100 {
            let j = c.jitter(0.00033);
            assert!((j.lat - 10.0).abs() <= 0.00033);
            assert!((j.lon - 20.0).abs() <= 0.00033);
        }
    }

    #[test]
    fn test_seen_sample_offsets() {
        let sample = SeenSample::from_observations(7200 + 100, 7200 + 400);
        assert_eq!(sample.first_seconds, 100);
        assert_eq!(sample.last_seconds, 400);
        assert_eq!(sample.range(), 300);
    }
}
