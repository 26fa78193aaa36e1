//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spawnwatch::scanner::identity::SessionTokens;
use spawnwatch::scanner::protocol::{
    AppProfile, FeatureKind, MapCell, MapObjects, RawFeature, SpinResult, WildRecord,
};
use spawnwatch::scanner::{
    timing, Identity, MemoryStore, Overseer, ProtocolClient, ProtocolError, ScanConfig, ScannerBuilder,
};
use spawnwatch::types::EncounterStats;
use spawnwatch::Coordinates;

pub const CENTER: Coordinates = Coordinates {
    lat: 40.7500,
    lon: -111.9000,
};

#[derive(Debug, Clone)]
pub struct VisitCall {
    pub username: String,
    pub point: Coordinates,
    pub at: f64,
}

/// Scriptable stand-in for the map service.
#[derive(Default)]
pub struct MockProtocol {
    visits: Mutex<Vec<VisitCall>>,
    scripted: Mutex<HashMap<String, VecDeque<Result<MapObjects, ProtocolError>>>>,
    default_map: Mutex<MapObjects>,
    minimum_version: Mutex<Option<String>>,
    logins: AtomicUsize,
    visit_delay: Mutex<Option<Duration>>,
    spins: AtomicUsize,
    recycled: Mutex<Vec<(u32, u32)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue responses for one identity. Once used up, the default map is returned.
    pub fn script(&self, username: &str, responses: Vec<Result<MapObjects, ProtocolError>>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .extend(responses);
    }

    pub fn set_default_map(&self, map: MapObjects) {
        *self.default_map.lock().unwrap() = map;
    }

    pub fn require_version(&self, version: &str) {
        *self.minimum_version.lock().unwrap() = Some(version.to_string());
    }

    /// Make every map request take `delay` before it answers.
    pub fn set_visit_delay(&self, delay: Duration) {
        *self.visit_delay.lock().unwrap() = Some(delay);
    }

    /// Most map requests that were being answered at the same time.
    pub fn peak_concurrent_visits(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn visits(&self) -> Vec<VisitCall> {
        self.visits.lock().unwrap().clone()
    }

    pub fn spins(&self) -> usize {
        self.spins.load(Ordering::SeqCst)
    }

    /// `(item_id, count)` of every recycle request.
    pub fn recycled(&self) -> Vec<(u32, u32)> {
        self.recycled.lock().unwrap().clone()
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` visits were made or `timeout` passes.
    pub async fn wait_for_visits(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.visits.lock().unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.visits.lock().unwrap().len() >= count
    }
}

#[async_trait]
impl ProtocolClient for MockProtocol {
    async fn login(&self, identity: &Identity, _proxy: Option<&str>) -> Result<SessionTokens, ProtocolError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(SessionTokens {
            access_token: format!("token-{}", identity.username),
            expires_at: timing::now() + 3600.0,
        })
    }

    async fn initialize_app(&self, _identity: &Identity, _proxy: Option<&str>) -> Result<AppProfile, ProtocolError> {
        Ok(AppProfile {
            level: 5,
            items: Default::default(),
        })
    }

    async fn minimum_version(&self, _identity: &Identity, _proxy: Option<&str>) -> Result<Option<String>, ProtocolError> {
        Ok(self.minimum_version.lock().unwrap().clone())
    }

    async fn visit(&self, identity: &Identity, _proxy: Option<&str>, point: Coordinates) -> Result<MapObjects, ProtocolError> {
        self.visits.lock().unwrap().push(VisitCall {
            username: identity.username.clone(),
            point,
            at: timing::now(),
        });
        let delay = *self.visit_delay.lock().unwrap();
        if let Some(delay) = delay {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&identity.username)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(response) => response,
            None => Ok(self.default_map.lock().unwrap().clone()),
        }
    }

    async fn encounter(
        &self,
        _identity: &Identity,
        _proxy: Option<&str>,
        _record: &WildRecord,
        _point: Coordinates,
    ) -> Result<EncounterStats, ProtocolError> {
        Ok(EncounterStats {
            attack: 15,
            defense: 14,
            stamina: 13,
            move_1: 221,
            move_2: 26,
        })
    }

    async fn spin_feature(
        &self,
        _identity: &Identity,
        _proxy: Option<&str>,
        _feature: &RawFeature,
        _point: Coordinates,
    ) -> Result<SpinResult, ProtocolError> {
        self.spins.fetch_add(1, Ordering::SeqCst);
        Ok(SpinResult::Success {
            awarded: [(1, 3)].into_iter().collect(),
        })
    }

    async fn verify_challenge(&self, _identity: &Identity, _proxy: Option<&str>, _token: &str) -> Result<bool, ProtocolError> {
        Ok(true)
    }

    async fn recycle_item(
        &self,
        _identity: &Identity,
        _proxy: Option<&str>,
        item_id: u32,
        count: u32,
    ) -> Result<bool, ProtocolError> {
        self.recycled.lock().unwrap().push((item_id, count));
        Ok(true)
    }
}

/// Move a point north by `meters`.
pub fn north_of(c: Coordinates, meters: f64) -> Coordinates {
    Coordinates::new(c.lat + meters / 111_320.0, c.lon)
}

/// Identities `user0..userN`.
pub fn identities(count: usize) -> Vec<Identity> {
    (0..count).map(|i| Identity::new(&format!("user{}", i), "secret")).collect()
}

pub fn usernames(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("user{}", i)).collect()
}

/// Configuration over a small area around `CENTER` with quick timings.
pub fn test_config(rows: usize, columns: usize, identities: Vec<Identity>) -> ScanConfig {
    ScanConfig {
        map_start: Coordinates::new(CENTER.lat - 0.05, CENTER.lon - 0.05),
        map_end: Coordinates::new(CENTER.lat + 0.05, CENTER.lon + 0.05),
        grid: (rows, columns),
        scan_delay: 0.05,
        search_interval: 0.05,
        point_jitter: 0.0,
        acquire_poll: 0.1,
        commit_interval: 0.1,
        shutdown_grace: 5.0,
        throttle_backoff: 0.1,
        egress_wait: 0.1,
        identities,
        ..ScanConfig::default()
    }
}

pub fn wild(encounter_id: u64, spawn_id: u64, coords: Coordinates, time_till_hidden_ms: i64) -> WildRecord {
    WildRecord {
        encounter_id,
        spawn_id,
        species_id: 16,
        coords,
        last_modified_ms: timing::now_secs() * 1000,
        time_till_hidden_ms,
    }
}

/// A spinnable stop at `coords`.
pub fn stop(id: &str, coords: Coordinates) -> RawFeature {
    RawFeature {
        id: id.to_string(),
        coords,
        kind: FeatureKind::Stop,
        last_modified_ms: timing::now_secs() * 1000,
        cooldown_complete_ms: None,
        enabled: true,
    }
}

pub fn map_with(wild: Vec<WildRecord>) -> MapObjects {
    MapObjects {
        cells: vec![MapCell {
            wild,
            features: Vec::new(),
            spawn_points: Vec::new(),
        }],
        timestamp_ms: timing::now_secs() * 1000,
    }
}

pub async fn build(config: ScanConfig, protocol: Arc<MockProtocol>, store: Arc<MemoryStore>) -> Arc<Overseer> {
    ScannerBuilder::new()
        .with_config(config)
        .build(protocol, store.clone(), store)
        .await
        .expect("scanner should build")
}
