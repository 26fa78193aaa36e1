//! Scanner configuration.
//!
//! `ScanConfig` is built once before anything starts, either from defaults,
//! from a TOML file or through `ScannerBuilder`, and is validated up front so
//! that bad combinations fail at startup instead of deep inside a worker.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::scanner::identity::Identity;
use crate::types::Coordinates;

/// Keep at most `keep` items of one kind; the rest is recycled when the
/// inventory is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemLimit {
    pub item_id: u32,
    pub keep: u32,
}

/// Full scanner configuration. Durations are expressed in seconds, speeds in km/h.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// One corner of the scan area
    pub map_start: Coordinates,
    /// Opposite corner of the scan area
    pub map_end: Coordinates,
    /// Worker grid (rows, columns); the slot count is rows * columns
    pub grid: (usize, usize),

    /// Minimum spacing between two map requests of the same identity
    pub scan_delay: f64,
    /// Highest travel speed a worker may be asked to cover
    pub speed_limit: f64,
    /// Speed below which worker selection stops looking for a better match
    pub good_enough: f64,
    /// How long a timed point may wait for a worker past now
    pub give_up_known: f64,
    /// How long an untimed point may wait for a worker
    pub give_up_unknown: f64,
    /// Timed points later than this are skipped outright
    pub skip_spawn: f64,
    /// Timed points later than this are skipped when already cached
    pub redundant_after: f64,
    /// Pause between worker selection rounds
    pub search_interval: f64,
    /// Random offset applied to every dispatched point, in degrees
    pub point_jitter: f64,
    /// Cap on in-flight visit tasks; defaults to the slot count
    pub max_in_flight: Option<usize>,
    /// Timed spawns needed before the hourly schedule is used
    pub min_spawns_for_schedule: usize,
    /// Consecutive dispatch loop errors tolerated before giving up
    pub max_loop_errors: u32,
    /// Hex grid spacing of bootstrap points, in meters
    pub bootstrap_radius: f64,

    /// Concurrent authentication handshakes
    pub simultaneous_logins: usize,
    /// Concurrent first-time app initializations
    pub simultaneous_simulation: usize,
    /// Dispatch pauses while more identities than this await a manual solve
    pub max_captchas: usize,
    /// Challenge attempts per identity before it is benched
    pub captchas_allowed: u32,
    /// Prefer identities waiting on a challenge when a solver is configured
    pub favor_captcha: bool,
    /// Attempts per request before giving up on a point
    pub max_retries: u32,
    /// Consecutive empty visits tolerated before the identity is swapped
    pub max_empty_visits: u32,
    /// Bounded wait used while polling for a replacement identity
    pub acquire_poll: f64,
    /// Cooldown used when the service throttles without a reset time
    pub throttle_backoff: f64,
    /// Minimum time between two egress rotations
    pub egress_cooldown: f64,
    /// Wait applied when an egress block cannot be rotated away
    pub egress_wait: f64,
    /// Lowest client version the scanner can speak
    pub client_version: String,

    /// Spin nearby features while visiting
    pub spin_features: bool,
    /// Seconds between two spins of the same identity
    pub spin_cooldown: f64,
    /// Maximum distance to a spinnable feature, in meters
    pub spin_range: f64,
    /// Inventory size at which spinning stops
    pub item_capacity: u32,
    /// Per-item limits applied when the inventory is full
    pub item_limits: Vec<ItemLimit>,
    /// Species that get a follow-up encounter request
    pub encounter_species: Vec<u16>,
    /// Ignore samples first seen before this Unix timestamp
    pub last_migration: i64,
    /// Lifetime of feature cache entries
    pub feature_cache_ttl: f64,

    /// Store commit cadence
    pub commit_interval: f64,
    /// Pending writes that force an early commit
    pub max_batch: usize,
    /// Time allowed to drain outstanding work on shutdown
    pub shutdown_grace: f64,
    /// Snapshot persistence cadence
    pub snapshot_interval: f64,
    /// Status report cadence
    pub status_interval: f64,
    /// Cadence of the least-productive identity swap
    pub swap_interval: f64,

    /// sqlx connection string of the sighting store
    pub database_url: String,
    /// Identities available to the pool
    pub identities: Vec<Identity>,
    /// Egress proxies, if any
    pub proxies: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            map_start: Coordinates::new(40.7913, -111.9398),
            map_end: Coordinates::new(40.7143, -111.8046),
            grid: (4, 4),
            scan_delay: 10.0,
            speed_limit: 30.58,
            good_enough: 0.1,
            give_up_known: 75.0,
            give_up_unknown: 60.0,
            skip_spawn: 90.0,
            redundant_after: 5.0,
            search_interval: 2.0,
            point_jitter: 0.00033,
            max_in_flight: None,
            min_spawns_for_schedule: 10,
            max_loop_errors: 100,
            bootstrap_radius: 450.0,
            simultaneous_logins: 2,
            simultaneous_simulation: 4,
            max_captchas: 0,
            captchas_allowed: 3,
            favor_captcha: true,
            max_retries: 3,
            max_empty_visits: 3,
            acquire_poll: 5.0,
            throttle_backoff: 30.0,
            egress_cooldown: 60.0,
            egress_wait: 5.0,
            client_version: "0.57.4".to_string(),
            spin_features: false,
            spin_cooldown: 300.0,
            spin_range: 36.0,
            item_capacity: 350,
            item_limits: Vec::new(),
            encounter_species: Vec::new(),
            last_migration: 1_481_932_800,
            feature_cache_ttl: 86_400.0,
            commit_interval: 5.0,
            max_batch: 500,
            shutdown_grace: 30.0,
            snapshot_interval: 300.0,
            status_interval: 30.0,
            swap_interval: 600.0,
            database_url: "sqlite:spawnwatch.db?mode=rwc".to_string(),
            identities: Vec::new(),
            proxies: Vec::new(),
        }
    }
}

impl ScanConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ScanConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of worker slots.
    pub fn worker_count(&self) -> usize {
        self.grid.0 * self.grid.1
    }

    /// Effective cap on in-flight visit tasks.
    pub fn in_flight_limit(&self) -> usize {
        self.max_in_flight.unwrap_or_else(|| self.worker_count())
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.grid.0 == 0 || self.grid.1 == 0 {
            bail!("grid must have at least one row and one column, got {:?}", self.grid);
        }
        if self.map_start.lat == self.map_end.lat || self.map_start.lon == self.map_end.lon {
            bail!("map_start and map_end must span a non-empty area");
        }
        let positive = [
            ("scan_delay", self.scan_delay),
            ("commit_interval", self.commit_interval),
            ("acquire_poll", self.acquire_poll),
            ("search_interval", self.search_interval),
            ("status_interval", self.status_interval),
            ("snapshot_interval", self.snapshot_interval),
            ("swap_interval", self.swap_interval),
        ];
        for (name, value) in positive {
            if !value.is_finite() {
                bail!("{} must be a finite number of seconds, got {}", name, value);
            }
        }
        let non_negative = [
            ("give_up_known", self.give_up_known),
            ("give_up_unknown", self.give_up_unknown),
            ("skip_spawn", self.skip_spawn),
            ("redundant_after", self.redundant_after),
            ("shutdown_grace", self.shutdown_grace),
            ("throttle_backoff", self.throttle_backoff),
            ("egress_wait", self.egress_wait),
            ("egress_cooldown", self.egress_cooldown),
            ("spin_cooldown", self.spin_cooldown),
            ("spin_range", self.spin_range),
            ("feature_cache_ttl", self.feature_cache_ttl),
            ("point_jitter", self.point_jitter),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                bail!("{} must be finite and not negative, got {}", name, value);
            }
        }
        if !(self.scan_delay > 0.0) {
            bail!("scan_delay must be positive, got {}", self.scan_delay);
        }
        if !(self.speed_limit > 0.0) {
            bail!("speed_limit must be positive, got {}", self.speed_limit);
        }
        if self.good_enough < 0.0 || self.good_enough >= self.speed_limit {
            bail!(
                "good_enough ({}) must be between 0 and speed_limit ({})",
                self.good_enough,
                self.speed_limit
            );
        }
        if self.in_flight_limit() == 0 {
            bail!("max_in_flight must be at least 1");
        }
        if self.simultaneous_logins == 0 || self.simultaneous_simulation == 0 {
            bail!("simultaneous_logins and simultaneous_simulation must be at least 1");
        }
        if self.max_empty_visits == 0 {
            bail!("max_empty_visits must be at least 1");
        }
        if !(self.commit_interval > 0.0) || !(self.acquire_poll > 0.0) || !(self.search_interval > 0.0) {
            bail!("commit_interval, acquire_poll and search_interval must be positive");
        }
        if !(self.status_interval > 0.0) || !(self.snapshot_interval > 0.0) || !(self.swap_interval > 0.0) {
            bail!("status_interval, snapshot_interval and swap_interval must be positive");
        }
        if self.item_capacity == 0 {
            bail!("item_capacity must be at least 1");
        }
        if self.max_batch == 0 {
            bail!("max_batch must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for identity in &self.identities {
            if !seen.insert(identity.username.as_str()) {
                bail!("identity {} is listed more than once", identity.username);
            }
        }
        Ok(())
    }
}
