//! Worker - one session slot bound to one identity at a time.
//!
//! A worker is created once per slot and lives for the whole run. The busy
//! flag is the async mutex around its `Session`: whoever holds the guard is
//! the only one allowed to make requests with the bound identity. Failures
//! are classified into recovery actions; everything except a fatal error is
//! absorbed here by retrying, rotating egress or moving the identity back to
//! the pool and waiting for a replacement.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, error, info, instrument, warn};

use crate::scanner::config::ItemLimit;
use crate::scanner::egress::Rotation;
use crate::scanner::geo;
use crate::scanner::identity::Identity;
use crate::scanner::protocol::{
    version_at_least, FeatureKind, ProtocolClient, ProtocolError, RawFeature, Recovery, SpinResult,
    WildRecord,
};
use crate::scanner::timing;
use crate::scanner::write_buffer::WriteRequest;
use crate::scanner::ScanContext;
use crate::types::{Coordinates, EncounterStats, FeatureLocation, FeatureSighting, Mystery, Sighting};

/// Remaining lifetimes above this are not trusted.
const MAX_TIME_TILL_HIDDEN_MS: i64 = 90_000;
const BOOTSTRAP_TRIES: usize = 3;
const BOOTSTRAP_JITTER: f64 = 0.00005;
/// Larger surpluses are recycled in random chunks of at least this size.
const RECYCLE_CHUNK: u32 = 50;

type ProtocolFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProtocolError>> + Send + 'a>>;

/// Position in the worker life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    Init,
    LoggingIn,
    AppInitializing,
    Ready,
    Visiting,
    Encountering,
    SpinningFeature,
    Benched,
    Swapped,
    Removed,
    Killed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkerStatus::Init => "init",
            WorkerStatus::LoggingIn => "logging in",
            WorkerStatus::AppInitializing => "initializing",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Visiting => "visiting",
            WorkerStatus::Encountering => "encountering",
            WorkerStatus::SpinningFeature => "spinning",
            WorkerStatus::Benched => "benched",
            WorkerStatus::Swapped => "swapped",
            WorkerStatus::Removed => "removed",
            WorkerStatus::Killed => "killed",
        };
        f.write_str(label)
    }
}

/// Errors that leave the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {slot} stopped on a fatal error: {source}")]
    Fatal { slot: usize, source: ProtocolError },
    #[error("worker {0} was cancelled")]
    Cancelled(usize),
}

/// Outcome of a failed request that the call loop could not absorb.
#[derive(Debug)]
enum Escalation {
    Reauthenticate,
    Swap(String),
    Challenge(String),
    Bench,
    Retire,
    Fatal(ProtocolError),
    GiveUp(ProtocolError),
    Cancelled,
}

/// State guarded by the busy flag.
#[derive(Debug)]
pub struct Session {
    identity: Option<Identity>,
    proxy: Option<String>,
    authenticated: bool,
    empty_visits: u32,
    captchas: u32,
    next_spin: f64,
    spins_disabled: bool,
    last_visit: f64,
}

impl Session {
    fn new(proxy: Option<String>) -> Self {
        Self {
            identity: None,
            proxy,
            authenticated: false,
            empty_visits: 0,
            captchas: 0,
            next_spin: 0.0,
            spins_disabled: false,
            last_visit: 0.0,
        }
    }

    fn bind(&mut self, identity: Identity) {
        self.authenticated = false;
        self.empty_visits = 0;
        self.captchas = 0;
        self.spins_disabled = false;
        self.last_visit = identity.last_active.unwrap_or(0.0);
        self.identity = Some(identity);
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn empty_visits(&self) -> u32 {
        self.empty_visits
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }
}

/// Exclusive access to a worker. Dropping it marks the worker idle.
pub type BusyGuard = OwnedMutexGuard<Session>;

/// Values the overseer reads without taking the busy flag.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub location: Coordinates,
    pub last_request: f64,
    pub speed: f64,
    pub status: WorkerStatus,
    pub error: Option<String>,
    pub username: Option<String>,
    /// When the current identity was bound
    pub account_started: f64,
    /// Seconds between the deadline and the last timed visit
    pub after_spawn: Option<f64>,
}

impl Telemetry {
    /// Fresh telemetry for a newly bound identity. Resumes from its last known position.
    fn bound_to(identity: &Identity, start: Coordinates, now: f64) -> Self {
        Self {
            location: identity.location.unwrap_or(start),
            last_request: identity.last_active.unwrap_or(0.0),
            speed: 0.0,
            status: WorkerStatus::Init,
            error: None,
            username: Some(identity.username.clone()),
            account_started: now,
            after_spawn: None,
        }
    }
}

/// Status row of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub slot: usize,
    pub telemetry: Telemetry,
    pub visits: u64,
    pub seen: u64,
    pub account_seen: u64,
}

pub struct Worker {
    slot: usize,
    session: Arc<tokio::sync::Mutex<Session>>,
    telemetry: Mutex<Telemetry>,
    visits: AtomicU64,
    seen: AtomicU64,
    account_seen: AtomicU64,
    ctx: Arc<ScanContext>,
}

impl Worker {
    /// Create a new worker for a slot, bound to its first identity.
    pub fn new(slot: usize, mut identity: Identity, ctx: Arc<ScanContext>) -> Self {
        identity.ensure_device();
        let start = ctx.spawns.bounds().start_coords(slot, ctx.config.grid);
        let telemetry = Telemetry::bound_to(&identity, start, timing::now());
        let mut session = Session::new(ctx.egress.initial(slot));
        info!(slot, "Bound identity {}", identity.username);
        session.bind(identity);
        Self {
            slot,
            session: Arc::new(tokio::sync::Mutex::new(session)),
            telemetry: Mutex::new(telemetry),
            visits: AtomicU64::new(0),
            seen: AtomicU64::new(0),
            account_seen: AtomicU64::new(0),
            ctx,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    fn telemetry(&self) -> std::sync::MutexGuard<'_, Telemetry> {
        self.telemetry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the busy flag if the worker is idle.
    pub fn try_acquire(&self) -> Option<BusyGuard> {
        self.session.clone().try_lock_owned().ok()
    }

    /// Wait for the busy flag.
    pub async fn acquire(&self) -> BusyGuard {
        self.session.clone().lock_owned().await
    }

    pub fn location(&self) -> Coordinates {
        self.telemetry().location
    }

    pub fn status(&self) -> WorkerStatus {
        self.telemetry().status
    }

    fn set_status(&self, status: WorkerStatus) {
        self.telemetry().status = status;
    }

    fn set_error(&self, error: impl Into<String>) {
        self.telemetry().error = Some(error.into());
    }

    /// Speed in km/h needed to reach `point` by `arrive_at` from the last
    /// request position. The elapsed time never counts as less than the scan delay.
    pub fn travel_speed(&self, point: Coordinates, arrive_at: f64) -> f64 {
        let telemetry = self.telemetry();
        let elapsed = (arrive_at - telemetry.last_request).max(self.ctx.config.scan_delay);
        geo::speed_kmh(geo::distance(telemetry.location, point), elapsed)
    }

    pub fn set_speed(&self, speed: f64) {
        self.telemetry().speed = speed;
    }

    pub fn set_after_spawn(&self, seconds: f64) {
        self.telemetry().after_spawn = Some(seconds);
    }

    /// Records seen per second by the current identity.
    pub fn seen_per_second(&self, now: f64) -> f64 {
        let started = self.telemetry().account_started;
        let elapsed = now - started;
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.account_seen.load(Ordering::Relaxed) as f64 / elapsed
    }

    pub fn visits(&self) -> u64 {
        self.visits.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            slot: self.slot,
            telemetry: self.telemetry().clone(),
            visits: self.visits.load(Ordering::Relaxed),
            seen: self.seen.load(Ordering::Relaxed),
            account_seen: self.account_seen.load(Ordering::Relaxed),
        }
    }

    /// Bind a new identity to the session.
    fn adopt(&self, session: &mut Session, mut identity: Identity) {
        identity.ensure_device();
        let start = self.ctx.spawns.bounds().start_coords(self.slot, self.ctx.config.grid);
        *self.telemetry() = Telemetry::bound_to(&identity, start, timing::now());
        self.account_seen.store(0, Ordering::Relaxed);
        info!(slot = self.slot, "Bound identity {}", identity.username);
        session.bind(identity);
    }

    /// Copy session progress into the identity and hand the latest copy to the pool.
    fn persist(&self, session: &mut Session) {
        let (location, last_request) = {
            let telemetry = self.telemetry();
            (telemetry.location, telemetry.last_request)
        };
        if let Some(identity) = session.identity.as_mut() {
            identity.location = Some(location);
            if last_request > 0.0 {
                identity.last_active = Some(last_request);
            }
            self.ctx.pool.record(identity);
        }
    }

    fn take_identity(&self, session: &mut Session) -> Option<Identity> {
        self.persist(session);
        session.authenticated = false;
        session.identity.take()
    }

    async fn pause(&self, duration: Duration) -> Result<(), Escalation> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.ctx.cancel.cancelled() => Err(Escalation::Cancelled),
        }
    }

    /// Run one request with transient retries, cooldowns and egress rotation.
    async fn call<T, F>(&self, session: &mut Session, label: &'static str, request: F) -> Result<T, Escalation>
    where
        T: Send,
        F: for<'a> Fn(&'a dyn ProtocolClient, &'a Identity, Option<&'a str>) -> ProtocolFuture<'a, T> + Send + Sync,
    {
        let config = &self.ctx.config;
        let retries = config.max_retries.saturating_sub(1) as usize;
        let mut cooldowns = 0u32;
        let mut rotations = 0u32;

        loop {
            let Some(identity) = session.identity.clone() else {
                return Err(Escalation::Swap("no identity bound".to_string()));
            };
            let proxy = session.proxy.clone();
            let protocol = self.ctx.protocol.clone();

            let strategy = ExponentialBackoff::from_millis(100)
                .max_delay(Duration::from_secs(5))
                .map(jitter)
                .take(retries);
            let attempt = RetryIf::spawn(
                strategy,
                || request(protocol.as_ref(), &identity, proxy.as_deref()),
                |e: &ProtocolError| {
                    let transient = Recovery::classify(e) == Recovery::Retry;
                    if transient {
                        debug!(slot = self.slot, "{} failed transiently: {}", label, e);
                    }
                    transient
                },
            );
            let result = tokio::select! {
                result = attempt => result,
                _ = self.ctx.cancel.cancelled() => return Err(Escalation::Cancelled),
            };
            self.telemetry().last_request = timing::now();

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            self.set_error(error.to_string());

            match Recovery::classify(&error) {
                Recovery::Retry => return Err(Escalation::GiveUp(error)),
                Recovery::Cooldown { reset_at } => {
                    cooldowns += 1;
                    if let Some(identity) = session.identity.as_mut() {
                        identity.throttle_failures += 1;
                        self.ctx.writes.send(WriteRequest::ThrottleFailures {
                            username: identity.username.clone(),
                            failures: identity.throttle_failures,
                        });
                    }
                    if cooldowns > config.max_retries {
                        return Err(Escalation::Swap(format!("throttled {} times", cooldowns)));
                    }
                    let wait = match reset_at {
                        Some(reset_at) => timing::until(reset_at),
                        None => timing::secs(config.throttle_backoff),
                    };
                    warn!(slot = self.slot, "{} throttled, cooling down for {:?}", label, wait);
                    self.pause(wait).await?;
                }
                Recovery::Reauthenticate => return Err(Escalation::Reauthenticate),
                Recovery::SwapIdentity => return Err(Escalation::Swap(error.to_string())),
                Recovery::BenchIdentity => {
                    return Err(match error {
                        ProtocolError::ChallengeRequired { url } => Escalation::Challenge(url),
                        _ => Escalation::Bench,
                    })
                }
                Recovery::RetireIdentity => return Err(Escalation::Retire),
                Recovery::RotateEgress => {
                    rotations += 1;
                    if rotations > config.max_retries {
                        return Err(Escalation::GiveUp(error));
                    }
                    match self.ctx.egress.rotate(session.proxy.as_deref()) {
                        Rotation::Rotated(route) => session.proxy = Some(route),
                        Rotation::Wait(wait) => self.pause(wait).await?,
                    }
                }
                Recovery::Fatal => return Err(Escalation::Fatal(error)),
            }
        }
    }

    /// Authenticate the bound identity and run the first-time initialization when needed.
    async fn login(&self, session: &mut Session) -> Result<(), Escalation> {
        self.set_status(WorkerStatus::LoggingIn);
        let now = timing::now();
        let cached = session
            .identity
            .as_ref()
            .and_then(|i| i.tokens.as_ref())
            .is_some_and(|t| t.is_valid(now));

        if !cached {
            let tokens = {
                let _permit = self.ctx.pool.login_permit().await;
                self.call(session, "login", |p, identity, proxy| p.login(identity, proxy)).await
            };
            let tokens = match tokens {
                Ok(tokens) => tokens,
                Err(Escalation::Reauthenticate) => {
                    return Err(Escalation::Swap("login was not accepted".to_string()))
                }
                Err(e) => return Err(e),
            };

            let minimum = self
                .call(session, "minimum_version", |p, identity, proxy| p.minimum_version(identity, proxy))
                .await?;
            if let Some(minimum) = minimum {
                if !version_at_least(&self.ctx.config.client_version, &minimum) {
                    error!(
                        "Service requires client version {} but this build speaks {}",
                        minimum, self.ctx.config.client_version
                    );
                    return Err(Escalation::Fatal(ProtocolError::ForcedUpgrade));
                }
            }
            if let Some(identity) = session.identity.as_mut() {
                identity.tokens = Some(tokens);
            }
        }

        let initialized = session.identity.as_ref().is_some_and(Identity::is_initialized);
        if !initialized {
            let _permit = self.ctx.pool.init_permit().await;
            self.set_status(WorkerStatus::AppInitializing);
            let profile = self
                .call(session, "initialize_app", |p, identity, proxy| p.initialize_app(identity, proxy))
                .await?;
            if let Some(identity) = session.identity.as_mut() {
                identity.level = Some(profile.level);
                identity.items = profile.items;
                identity.inventory_timestamp = Some(timing::now_secs());
                info!(slot = self.slot, "Initialized {} at level {}", identity.username, profile.level);
            }
        }

        session.authenticated = true;
        self.set_status(WorkerStatus::Ready);
        Ok(())
    }

    /// Visit a point, absorbing every failure that is not fatal.
    /// Returns whether anything was seen.
    #[instrument(skip(self, session), fields(slot = self.slot))]
    pub async fn visit(&self, session: &mut Session, point: Coordinates, bootstrap: bool) -> Result<bool, WorkerError> {
        let mut reauthenticated = false;
        loop {
            if session.identity.is_none() {
                self.replace_identity(session).await?;
            }
            self.telemetry().location = point;

            if !session.authenticated {
                if let Err(escalation) = self.login(session).await {
                    self.escalate(session, escalation).await?;
                    return Ok(false);
                }
            }

            match self.visit_point(session, point, bootstrap).await {
                Ok(seen) => {
                    let limit = self.ctx.config.max_empty_visits;
                    if !bootstrap && session.empty_visits > limit {
                        let reason = format!("{} empty visits", session.empty_visits);
                        self.swap_identity(session, &reason).await?;
                    }
                    return Ok(seen > 0);
                }
                Err(Escalation::Reauthenticate) if !reauthenticated => {
                    warn!(slot = self.slot, "Session expired, logging in again");
                    reauthenticated = true;
                    session.authenticated = false;
                    if let Some(identity) = session.identity.as_mut() {
                        identity.tokens = None;
                    }
                }
                Err(escalation) => {
                    self.escalate(session, escalation).await?;
                    return Ok(false);
                }
            }
        }
    }

    /// Visit a bootstrap point, retrying with a small position jitter.
    pub async fn bootstrap_visit(&self, session: &mut Session, point: Coordinates) -> Result<bool, WorkerError> {
        let mut target = point;
        for _ in 0..BOOTSTRAP_TRIES {
            if self.visit(session, target, true).await? {
                return Ok(true);
            }
            self.set_error("bootstrap visit saw nothing");
            target = point.jitter(BOOTSTRAP_JITTER);
        }
        Ok(false)
    }

    async fn visit_point(&self, session: &mut Session, point: Coordinates, bootstrap: bool) -> Result<usize, Escalation> {
        self.set_status(WorkerStatus::Visiting);
        info!(slot = self.slot, "Visiting {:.4},{:.4}", point.lat, point.lon);

        // 1. Keep map requests of this identity at least scan_delay apart
        let wait = session.last_visit + self.ctx.config.scan_delay - timing::now();
        if wait > 0.0 {
            self.pause(timing::secs(wait)).await?;
        }

        // 2. Request the map
        let map = self
            .call(session, "visit", move |p, identity, proxy| p.visit(identity, proxy, point))
            .await?;
        session.last_visit = timing::now();
        self.visits.fetch_add(1, Ordering::Relaxed);
        // An answered map request means no challenge is pending
        if let Some(identity) = session.identity.as_mut() {
            identity.captcha = false;
        }

        // 3. Make room before spinning again
        if !self.ctx.config.item_limits.is_empty() && self.bag_full(session) {
            self.clean_bag(session).await?;
        }

        // 4. Records, features and candidate points
        let mut records = 0usize;
        let mut features = 0usize;
        let mut spin_target: Option<RawFeature> = None;
        for cell in &map.cells {
            for wild in &cell.wild {
                records += 1;
                self.process_wild(session, wild, point).await?;
            }
            for feature in cell.features.iter().filter(|f| f.enabled) {
                features += 1;
                self.process_feature(feature);
                if spin_target.is_none() && self.can_spin(session, feature) {
                    spin_target = Some(feature.clone());
                }
            }
            for candidate in cell.spawn_points.iter().filter(|c| !self.ctx.spawns.have_point(**c)) {
                self.ctx.spawns.add_cell_point(*candidate);
            }
        }

        // 5. Optional spin of one nearby feature
        if let Some(feature) = spin_target {
            self.spin(session, feature, point).await?;
        }

        // 6. Yield accounting
        if records > 0 {
            self.seen.fetch_add(records as u64, Ordering::Relaxed);
            session.empty_visits = 0;
            self.telemetry().error = None;
        } else {
            session.empty_visits += 1;
            if features == 0 {
                warn!(slot = self.slot, "Nothing seen, {} empty visits in a row", session.empty_visits);
                self.set_error("nothing seen");
            }
            if bootstrap {
                debug!(slot = self.slot, "Empty bootstrap visit");
            }
        }
        self.persist(session);
        self.set_status(WorkerStatus::Ready);
        info!(slot = self.slot, "Point processed, {} records and {} features seen", records, features);
        Ok(records + features)
    }

    async fn process_wild(&self, session: &mut Session, wild: &WildRecord, point: Coordinates) -> Result<(), Escalation> {
        let seen = (wild.last_modified_ms + 500).div_euclid(1000);
        let tth = wild.time_till_hidden_ms;

        let expiry = if tth > 0 && tth <= MAX_TIME_TILL_HIDDEN_MS {
            Some(((wild.last_modified_ms + tth + 500).div_euclid(1000), false))
        } else {
            self.ctx
                .spawns
                .despawn_time(wild.spawn_id, seen)
                .or_else(|| self.ctx.estimator.infer_expiry(wild.spawn_id, seen))
                .map(|expire| (expire, true))
        };

        let mut sighting = None;
        let mut mystery = None;
        let fresh = match expiry {
            Some((expire_timestamp, inferred)) => {
                let s = Sighting {
                    encounter_id: wild.encounter_id,
                    spawn_id: wild.spawn_id,
                    species_id: wild.species_id,
                    coords: wild.coords,
                    seen,
                    expire_timestamp,
                    inferred,
                    detail: None,
                };
                let fresh = !self.ctx.caches.sightings.contains(&s).await;
                sighting = Some(s);
                fresh
            }
            None => {
                let m = Mystery {
                    encounter_id: wild.encounter_id,
                    spawn_id: wild.spawn_id,
                    species_id: wild.species_id,
                    coords: wild.coords,
                    seen,
                    detail: None,
                };
                let fresh = !self.ctx.caches.mysteries.contains(&m).await;
                mystery = Some(m);
                fresh
            }
        };

        let mut detail = None;
        if fresh {
            self.account_seen.fetch_add(1, Ordering::Relaxed);
            if self.ctx.config.encounter_species.contains(&wild.species_id) {
                detail = self.encounter(session, wild, point).await?;
            }
        }

        if let Some(mut s) = sighting {
            s.detail = detail;
            self.ctx.writes.send(WriteRequest::Sighting(s));
        } else if let Some(mut m) = mystery {
            m.detail = detail;
            self.ctx.writes.send(WriteRequest::Mystery(m));
        }
        Ok(())
    }

    async fn encounter(
        &self,
        session: &mut Session,
        wild: &WildRecord,
        point: Coordinates,
    ) -> Result<Option<EncounterStats>, Escalation> {
        self.set_status(WorkerStatus::Encountering);
        let record = wild.clone();
        let result = self
            .call(session, "encounter", move |p, identity, proxy| {
                let record = record.clone();
                Box::pin(async move { p.encounter(identity, proxy, &record, point).await })
            })
            .await;
        self.set_status(WorkerStatus::Visiting);
        match result {
            Ok(stats) => Ok(Some(stats)),
            Err(Escalation::GiveUp(e)) => {
                warn!(slot = self.slot, "{} during encounter", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn process_feature(&self, feature: &RawFeature) {
        let request = match &feature.kind {
            FeatureKind::Structure {
                team,
                prestige,
                guard_species_id,
            } => WriteRequest::FeatureSighting(FeatureSighting {
                feature_id: feature.id.clone(),
                coords: feature.coords,
                team: *team,
                prestige: *prestige,
                guard_species_id: *guard_species_id,
                last_modified: feature.last_modified_ms.div_euclid(1000),
            }),
            FeatureKind::Stop => WriteRequest::FeatureLocation(FeatureLocation {
                feature_id: feature.id.clone(),
                coords: feature.coords,
            }),
        };
        self.ctx.writes.send(request);
    }

    fn can_spin(&self, session: &Session, feature: &RawFeature) -> bool {
        let config = &self.ctx.config;
        if !config.spin_features || session.spins_disabled || !matches!(feature.kind, FeatureKind::Stop) {
            return false;
        }
        if self.bag_full(session) {
            return false;
        }
        let now = timing::now();
        if now <= session.next_spin {
            return false;
        }
        if let Some(cooldown_ms) = feature.cooldown_complete_ms {
            if now <= cooldown_ms as f64 / 1000.0 {
                return false;
            }
        }
        let telemetry = self.telemetry();
        telemetry.speed < config.speed_limit
            && geo::distance(telemetry.location, feature.coords) <= config.spin_range
    }

    async fn spin(&self, session: &mut Session, feature: RawFeature, point: Coordinates) -> Result<(), Escalation> {
        self.set_status(WorkerStatus::SpinningFeature);
        let target = feature.clone();
        let result = self
            .call(session, "spin_feature", move |p, identity, proxy| {
                let feature = target.clone();
                Box::pin(async move { p.spin_feature(identity, proxy, &feature, point).await })
            })
            .await;
        session.next_spin = timing::now() + self.ctx.config.spin_cooldown;
        self.set_status(WorkerStatus::Visiting);

        match result {
            Ok(SpinResult::Success { awarded }) => {
                info!(slot = self.slot, "Spun {}", feature.id);
                if let Some(identity) = session.identity.as_mut() {
                    for (item_id, count) in awarded {
                        let held = identity.items.entry(item_id).or_insert(0);
                        *held = held.saturating_add(count);
                    }
                }
            }
            Ok(SpinResult::OutOfRange) => info!(slot = self.slot, "{} was out of spinning range", feature.id),
            Ok(SpinResult::Cooldown) => warn!(slot = self.slot, "{} was in its cooldown period", feature.id),
            Ok(SpinResult::InventoryFull) => warn!(slot = self.slot, "Could not spin {}: inventory full", feature.id),
            Ok(SpinResult::DailyLimit) => {
                warn!(slot = self.slot, "Daily spin limit reached, no more spins for this identity");
                session.spins_disabled = true;
            }
            Ok(SpinResult::Failed(code)) => warn!(slot = self.slot, "Failed spinning {}: {}", feature.id, code),
            Err(Escalation::GiveUp(e)) => warn!(slot = self.slot, "{} while spinning", e),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn bag_full(&self, session: &Session) -> bool {
        session
            .identity
            .as_ref()
            .is_some_and(|identity| identity.item_count() >= self.ctx.config.item_capacity)
    }

    /// Recycle items held above their configured limit.
    async fn clean_bag(&self, session: &mut Session) -> Result<(), Escalation> {
        let plan = match session.identity.as_ref() {
            Some(identity) => recycle_plan(&identity.items, &self.ctx.config.item_limits),
            None => return Ok(()),
        };
        let mut removed = 0u32;
        for (item_id, count) in plan {
            let result = self
                .call(session, "recycle_item", move |p, identity, proxy| {
                    p.recycle_item(identity, proxy, item_id, count)
                })
                .await;
            match result {
                Ok(true) => {
                    removed += count;
                    if let Some(held) = session.identity.as_mut().and_then(|i| i.items.get_mut(&item_id)) {
                        *held = held.saturating_sub(count);
                    }
                }
                Ok(false) => warn!(slot = self.slot, "Failed to remove item {}", item_id),
                Err(Escalation::GiveUp(e)) => warn!(slot = self.slot, "{} while recycling item {}", e, item_id),
                Err(e) => return Err(e),
            }
        }
        info!(slot = self.slot, "Removed {} items", removed);
        Ok(())
    }

    async fn escalate(&self, session: &mut Session, escalation: Escalation) -> Result<(), WorkerError> {
        match escalation {
            Escalation::Challenge(url) => self.handle_challenge(session, &url).await,
            other => self.settle(session, other).await,
        }
    }

    /// Apply a recovery action. Challenges are treated as a plain bench here.
    async fn settle(&self, session: &mut Session, escalation: Escalation) -> Result<(), WorkerError> {
        match escalation {
            Escalation::Reauthenticate => self.swap_identity(session, "reauthentication failed").await,
            Escalation::Swap(reason) => self.swap_identity(session, &reason).await,
            Escalation::Challenge(_) | Escalation::Bench => self.bench_identity(session).await,
            Escalation::Retire => self.remove_identity(session).await,
            Escalation::GiveUp(e) => {
                warn!(slot = self.slot, "{}, giving up on this point", e);
                self.set_status(WorkerStatus::Ready);
                Ok(())
            }
            Escalation::Fatal(source) => {
                error!(slot = self.slot, "Fatal error: {}", source);
                self.set_status(WorkerStatus::Killed);
                self.ctx.cancel.cancel();
                Err(WorkerError::Fatal { slot: self.slot, source })
            }
            Escalation::Cancelled => Err(WorkerError::Cancelled(self.slot)),
        }
    }

    /// Ask the solver for a token, up to the configured number of attempts,
    /// before benching the identity.
    async fn handle_challenge(&self, session: &mut Session, url: &str) -> Result<(), WorkerError> {
        let Some(solver) = self.ctx.solver.clone() else {
            return self.bench_identity(session).await;
        };
        loop {
            if session.captchas >= self.ctx.config.captchas_allowed {
                warn!(slot = self.slot, "Too many challenges, benching");
                return self.bench_identity(session).await;
            }
            session.captchas += 1;
            self.set_error("challenge");

            let token = match solver.solve(url).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(slot = self.slot, "Challenge solver failed: {:?}", e);
                    return self.swap_identity(session, "solving the challenge failed").await;
                }
            };
            let verified = self
                .call(session, "verify_challenge", move |p, identity, proxy| {
                    let token = token.clone();
                    Box::pin(async move { p.verify_challenge(identity, proxy, &token).await })
                })
                .await;
            match verified {
                Ok(true) => {
                    info!(slot = self.slot, "Challenge solved");
                    if let Some(identity) = session.identity.as_mut() {
                        identity.captcha = false;
                    }
                    self.persist(session);
                    return Ok(());
                }
                Ok(false) | Err(Escalation::Challenge(_)) => {
                    warn!(slot = self.slot, "Challenge answer rejected, trying again");
                }
                Err(other) => return self.settle(session, other).await,
            }
        }
    }

    async fn replace_identity(&self, session: &mut Session) -> Result<(), WorkerError> {
        match self.ctx.pool.acquire(self.slot, &self.ctx.cancel).await {
            Some(identity) => {
                self.adopt(session, identity);
                Ok(())
            }
            None => Err(WorkerError::Cancelled(self.slot)),
        }
    }

    /// Return the identity to the available queue and wait for another one.
    pub async fn swap_identity(&self, session: &mut Session, reason: &str) -> Result<(), WorkerError> {
        self.set_status(WorkerStatus::Swapped);
        if let Some(identity) = self.take_identity(session) {
            warn!(slot = self.slot, "Swapping out {} because {}", identity.username, reason);
            self.ctx.pool.release(self.slot, identity);
        }
        self.replace_identity(session).await
    }

    async fn bench_identity(&self, session: &mut Session) -> Result<(), WorkerError> {
        self.set_status(WorkerStatus::Benched);
        if let Some(identity) = self.take_identity(session) {
            warn!(slot = self.slot, "Benching {} until its challenge is solved", identity.username);
            self.ctx.pool.bench(self.slot, identity);
        }
        self.replace_identity(session).await
    }

    async fn remove_identity(&self, session: &mut Session) -> Result<(), WorkerError> {
        self.set_status(WorkerStatus::Removed);
        if let Some(identity) = self.take_identity(session) {
            warn!(slot = self.slot, "Removing {} due to ban", identity.username);
            self.ctx.pool.retire(self.slot, identity);
        }
        self.replace_identity(session).await
    }

    /// Hand the bound identity back to the pool at shutdown.
    pub fn return_identity(&self, session: &mut Session) -> bool {
        match self.take_identity(session) {
            Some(identity) => {
                debug!(slot = self.slot, "Returning {} to the pool", identity.username);
                self.ctx.pool.release(self.slot, identity);
                self.set_status(WorkerStatus::Killed);
                true
            }
            None => false,
        }
    }
}

/// How many items of each limited kind to recycle. Surpluses above
/// `RECYCLE_CHUNK` are only partly recycled, by a random amount.
fn recycle_plan(items: &BTreeMap<u32, u32>, limits: &[ItemLimit]) -> Vec<(u32, u32)> {
    let mut rng = rand::thread_rng();
    limits
        .iter()
        .filter_map(|limit| {
            let held = *items.get(&limit.item_id)?;
            let surplus = held.checked_sub(limit.keep).filter(|s| *s > 0)?;
            let count = if surplus > RECYCLE_CHUNK {
                rng.gen_range(RECYCLE_CHUNK..=surplus)
            } else {
                surplus
            };
            Some((limit.item_id, count))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycle_plan_trims_to_limits() {
        let items = BTreeMap::from([(1, 120), (2, 10), (3, 400)]);
        let limits = [
            ItemLimit { item_id: 1, keep: 100 },
            ItemLimit { item_id: 2, keep: 50 },
            ItemLimit { item_id: 3, keep: 100 },
            ItemLimit { item_id: 4, keep: 0 },
        ];
        let plan = recycle_plan(&items, &limits);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0], (1, 20));
        let (item_id, count) = plan[1];
        assert_eq!(item_id, 3);
        assert!((RECYCLE_CHUNK..=300).contains(&count));
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(WorkerStatus::SpinningFeature.to_string(), "spinning");
        assert_eq!(WorkerStatus::Benched.to_string(), "benched");
    }
}
