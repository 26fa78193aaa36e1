//! Geometry helpers: distances, scan bounds, worker start cells and the
//! bootstrap hex grid.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::types::Coordinates;

const EARTH_RADIUS_M: f64 = 6_371_008.8;
const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Great-circle distance in meters.
pub fn distance(a: Coordinates, b: Coordinates) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Speed in km/h needed to cover `meters` in `seconds`.
pub fn speed_kmh(meters: f64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return f64::INFINITY;
    }
    meters / seconds * 3.6
}

/// Rectangular scan area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl Bounds {
    /// Build bounds from two opposite corners in any order.
    pub fn from_corners(a: Coordinates, b: Coordinates) -> Self {
        Self {
            south: a.lat.min(b.lat),
            north: a.lat.max(b.lat),
            west: a.lon.min(b.lon),
            east: a.lon.max(b.lon),
        }
    }

    pub fn contains(&self, c: Coordinates) -> bool {
        c.lat >= self.south && c.lat <= self.north && c.lon >= self.west && c.lon <= self.east
    }

    pub fn center(&self) -> Coordinates {
        Coordinates::new((self.south + self.north) / 2.0, (self.west + self.east) / 2.0)
    }

    /// Stable textual fingerprint, used to detect that persisted state
    /// belongs to a different scan area.
    pub fn fingerprint(&self) -> String {
        format!(
            "{:.6},{:.6},{:.6},{:.6}",
            self.south, self.north, self.west, self.east
        )
    }

    /// Center of the grid cell assigned to a worker slot.
    pub fn start_coords(&self, slot: usize, grid: (usize, usize)) -> Coordinates {
        let (rows, cols) = (grid.0.max(1), grid.1.max(1));
        let row = (slot / cols) % rows;
        let col = slot % cols;
        let part_lat = (self.north - self.south) / rows as f64;
        let part_lon = (self.east - self.west) / cols as f64;
        Coordinates::new(
            self.south + part_lat * row as f64 + part_lat / 2.0,
            self.west + part_lon * col as f64 + part_lon / 2.0,
        )
    }

    /// Shuffled hex grid covering the area with circles of `radius` meters.
    pub fn bootstrap_points(&self, radius: f64) -> Vec<Coordinates> {
        let radius = radius.max(1.0);
        let lat_gain = radius * 1.5 / METERS_PER_DEGREE_LAT;
        let lon_meters = METERS_PER_DEGREE_LAT * self.center().lat.to_radians().cos().max(0.01);
        let lon_gain = radius * 3f64.sqrt() / lon_meters;

        let mut points = Vec::new();
        let mut lat = self.south;
        let mut row = 0usize;
        while lat <= self.north {
            let mut lon = if row % 2 == 1 { self.west - lon_gain / 2.0 } else { self.west };
            while lon <= self.east {
                points.push(Coordinates::new(lat, lon));
                lon += lon_gain;
            }
            lat += lat_gain;
            row += 1;
        }
        points.shuffle(&mut rand::thread_rng());
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> Bounds {
        Bounds::from_corners(Coordinates::new(40.80, -111.95), Coordinates::new(40.70, -111.80))
    }

    #[test]
    fn test_distance_of_one_degree_latitude() {
        let d = distance(Coordinates::new(0.0, 0.0), Coordinates::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 100.0);
    }

    #[test]
    fn test_speed_kmh() {
        assert!((speed_kmh(1000.0, 3600.0) - 1.0).abs() < 1e-9);
        assert!(speed_kmh(1.0, 0.0).is_infinite());
    }

    #[test]
    fn test_bounds_normalizes_corners() {
        let b = bounds();
        assert_eq!(b.south, 40.70);
        assert_eq!(b.north, 40.80);
        assert!(b.contains(b.center()));
        assert!(!b.contains(Coordinates::new(41.0, -111.9)));
    }

    #[test]
    fn test_start_coords_are_cell_centers() {
        let b = bounds();
        let first = b.start_coords(0, (2, 2));
        let last = b.start_coords(3, (2, 2));
        assert!((first.lat - 40.725).abs() < 1e-9);
        assert!((first.lon + 111.9125).abs() < 1e-9);
        assert!((last.lat - 40.775).abs() < 1e-9);
        assert!((last.lon + 111.8375).abs() < 1e-9);
    }

    #[test]
    fn test_bootstrap_points_cover_area() {
        let b = bounds();
        let points = b.bootstrap_points(450.0);
        assert!(points.len() > 50);
        assert!(points.iter().all(|p| p.lat >= b.south && p.lat <= b.north));
    }
}
