//! Overseer - the dispatch scheduler.
//!
//! The launch loop walks the timed schedule in deadline order, filling the
//! gaps before each deadline with untimed points. Every point becomes a
//! detached task that picks the idle worker with the lowest feasible travel
//! speed, waits for the deadline and visits. Concurrency is bounded by one
//! global semaphore; the busy flag of each worker is its session lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::scanner::config::ScanConfig;
use crate::scanner::identity::Identity;
use crate::scanner::metrics::{DispatchCounters, Inventory, Stats, StatusReport};
use crate::scanner::pool::Census;
use crate::scanner::spawns::ScheduledSpawn;
use crate::scanner::storage::SnapshotStore;
use crate::scanner::timing::{self, HOUR};
use crate::scanner::worker::{BusyGuard, Worker, WorkerError};
use crate::scanner::ScanContext;
use crate::types::{Coordinates, SpawnId};

pub const IDENTITIES_SNAPSHOT: &str = "identities";
pub const SPAWNS_SNAPSHOT: &str = "spawns";
pub const FEATURES_SNAPSHOT: &str = "features";

/// Points dispatched this long before their deadline are held by the task.
const DISPATCH_LEAD: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    /// Known despawn offset within the hour
    Timed,
    /// Deadline unknown, visited opportunistically
    Untimed,
    /// Bootstrap point that waits for a worker indefinitely
    MustVisit,
}

/// A location to visit and the time it should be visited at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub coords: Coordinates,
    pub spawn_id: Option<SpawnId>,
    pub deadline: Option<f64>,
    pub kind: PointKind,
}

impl Point {
    pub fn timed(spawn: &ScheduledSpawn, deadline: f64) -> Self {
        Self {
            coords: spawn.coords,
            spawn_id: Some(spawn.spawn_id),
            deadline: Some(deadline),
            kind: PointKind::Timed,
        }
    }

    pub fn untimed(coords: Coordinates) -> Self {
        Self {
            coords,
            spawn_id: None,
            deadline: None,
            kind: PointKind::Untimed,
        }
    }

    pub fn must_visit(coords: Coordinates) -> Self {
        Self {
            coords,
            spawn_id: None,
            deadline: None,
            kind: PointKind::MustVisit,
        }
    }

    /// Time after which no worker is searched for any more. `None` means never.
    pub fn skip_time(&self, now: f64, config: &ScanConfig) -> Option<f64> {
        match self.kind {
            PointKind::Timed => {
                let give_up = now + config.give_up_known;
                Some(self.deadline.map_or(give_up, |d| d.max(give_up)))
            }
            PointKind::Untimed => Some(now + config.give_up_unknown),
            PointKind::MustVisit => None,
        }
    }

    /// When the worker is expected to be at the point.
    pub fn arrival(&self, now: f64) -> f64 {
        self.deadline.map_or(now, |d| d.max(now))
    }
}

/// Next occurrence of every timed spawn strictly after `cursor`, in deadline order.
pub fn upcoming(schedule: &[ScheduledSpawn], cursor: f64) -> Vec<(f64, ScheduledSpawn)> {
    let hour = timing::current_hour(cursor.floor() as i64);
    let mut points: Vec<(f64, ScheduledSpawn)> = schedule
        .iter()
        .map(|spawn| {
            let mut deadline = (hour + spawn.offset) as f64;
            while deadline <= cursor {
                deadline += HOUR as f64;
            }
            (deadline, *spawn)
        })
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.spawn_id.cmp(&b.1.spawn_id)));
    points
}

pub struct Overseer {
    ctx: Arc<ScanContext>,
    workers: Vec<Arc<Worker>>,
    dispatch: Arc<Semaphore>,
    tracker: TaskTracker,
    counters: DispatchCounters,
    untimed: Mutex<VecDeque<Coordinates>>,
    retry_later: Mutex<VecDeque<Coordinates>>,
    snapshots: Arc<dyn SnapshotStore>,
    write_task: Mutex<Option<JoinHandle<Result<()>>>>,
    flush: CancellationToken,
    fatal: Mutex<Option<String>>,
    started: f64,
}

impl Overseer {
    /// Create a new Overseer with one worker per bootstrapped identity.
    pub fn new(
        ctx: Arc<ScanContext>,
        identities: Vec<Identity>,
        snapshots: Arc<dyn SnapshotStore>,
        write_task: JoinHandle<Result<()>>,
        flush: CancellationToken,
    ) -> Self {
        let workers = identities
            .into_iter()
            .enumerate()
            .map(|(slot, identity)| Arc::new(Worker::new(slot, identity, ctx.clone())))
            .collect();
        let limit = ctx.config.in_flight_limit();
        Self {
            workers,
            dispatch: Arc::new(Semaphore::new(limit)),
            tracker: TaskTracker::new(),
            counters: DispatchCounters::default(),
            untimed: Mutex::new(VecDeque::new()),
            retry_later: Mutex::new(VecDeque::new()),
            snapshots,
            write_task: Mutex::new(Some(write_task)),
            flush,
            fatal: Mutex::new(None),
            started: timing::now(),
            ctx,
        }
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn context(&self) -> &Arc<ScanContext> {
        &self.ctx
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Visits currently holding a dispatch slot.
    pub fn in_flight(&self) -> usize {
        self.ctx.config.in_flight_limit() - self.dispatch.available_permits()
    }

    /// Main execution loop. Returns when cancelled, or with an error when a
    /// worker hit a fatal condition or the loop failed too often.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "Overseer is running with {} workers and {} dispatch slots.",
            self.workers.len(),
            self.ctx.config.in_flight_limit()
        );

        let status = self.clone();
        self.tracker.spawn(async move { status.status_loop().await });
        let swapper = self.clone();
        self.tracker.spawn(async move { swapper.swap_loop().await });

        let result = self.launch().await;

        if let Some(reason) = self.fatal_reason() {
            return Err(anyhow!("scanner stopped: {}", reason));
        }
        result
    }

    async fn launch(self: &Arc<Self>) -> Result<()> {
        let config = &self.ctx.config;
        if self.ctx.spawns.timed_len() < config.min_spawns_for_schedule {
            self.bootstrap().await;
        }

        let mut cursor = timing::now() - config.skip_spawn;
        let mut consecutive_errors = 0u32;
        while !self.ctx.cancel.is_cancelled() {
            let round = if self.ctx.spawns.timed_len() < config.min_spawns_for_schedule {
                self.untimed_round().await
            } else {
                self.timed_round(&mut cursor).await
            };
            match round {
                Ok(()) => consecutive_errors = 0,
                Err(_) if self.ctx.cancel.is_cancelled() => break,
                Err(e) => {
                    consecutive_errors += 1;
                    DispatchCounters::bump(&self.counters.loop_errors);
                    error!("Dispatch loop error ({} in a row): {:?}", consecutive_errors, e);
                    if consecutive_errors > config.max_loop_errors {
                        self.ctx.cancel.cancel();
                        return Err(e.context("too many dispatch loop errors"));
                    }
                    self.pause(timing::secs(config.search_interval)).await;
                }
            }
        }
        info!("Launch loop stopped.");
        Ok(())
    }

    /// Visit the whole area once: first every worker's start position, then a
    /// hex grid over the bounds.
    #[instrument(skip(self))]
    async fn bootstrap(self: &Arc<Self>) {
        info!("Bootstrapping {} workers", self.workers.len());

        // 1. Every worker visits where it stands
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let permit = match self.take_slot().await {
                Ok(permit) => permit,
                Err(e) => {
                    debug!("Bootstrap stopped: {}", e);
                    break;
                }
            };
            let worker = worker.clone();
            let cancel = self.ctx.cancel.clone();
            handles.push(self.tracker.spawn(async move {
                let _permit = permit;
                let mut guard = tokio::select! {
                    guard = worker.acquire() => guard,
                    _ = cancel.cancelled() => return Ok(false),
                };
                let location = worker.location();
                worker.bootstrap_visit(&mut guard, location).await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => self.record_worker_error(e),
                Err(e) => error!("Bootstrap task failed: {}", e),
            }
        }

        // 2. Hex grid over the bounds
        let points = self.ctx.spawns.bounds().bootstrap_points(self.ctx.config.bootstrap_radius);
        info!("Bootstrapping {} grid points", points.len());
        let mut handles = Vec::with_capacity(points.len());
        for coords in points {
            match self.dispatch(Point::must_visit(coords)).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    debug!("Bootstrap dispatch stopped: {}", e);
                    break;
                }
            }
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Bootstrap task failed: {}", e);
            }
        }
        info!(
            "Bootstrap finished with {} timed and {} untimed spawns known",
            self.ctx.spawns.timed_len(),
            self.ctx.spawns.mystery_len()
        );
    }

    /// Too few timed spawns for a schedule: keep visiting untimed points.
    async fn untimed_round(self: &Arc<Self>) -> Result<()> {
        match self.next_untimed() {
            Some(coords) => {
                self.dispatch(Point::untimed(coords)).await?;
            }
            None => self.pause(timing::secs(self.ctx.config.search_interval)).await,
        }
        Ok(())
    }

    /// One pass over the next hour of timed spawns.
    async fn timed_round(self: &Arc<Self>, cursor: &mut f64) -> Result<()> {
        let config = &self.ctx.config;
        let schedule = self.ctx.spawns.schedule();
        let points = upcoming(&schedule, *cursor);
        debug!("Scheduling {} timed spawns after {:.0}", points.len(), *cursor);

        for (deadline, spawn) in points {
            if self.ctx.cancel.is_cancelled() {
                return Ok(());
            }
            // 1. Fill the gap before the deadline with untimed points
            loop {
                let lead = deadline - timing::now();
                if lead <= DISPATCH_LEAD {
                    break;
                }
                match self.next_untimed() {
                    Some(coords) => {
                        self.dispatch(Point::untimed(coords)).await?;
                    }
                    None => {
                        self.pause(timing::secs(lead - DISPATCH_LEAD)).await;
                        break;
                    }
                }
                if self.ctx.cancel.is_cancelled() {
                    return Ok(());
                }
            }
            *cursor = deadline;

            // 2. Late or already seen
            let time_diff = timing::now() - deadline;
            if time_diff > config.skip_spawn {
                DispatchCounters::bump(&self.counters.skipped);
                debug!("Skipping spawn {}, {:.1}s late", spawn.spawn_id, time_diff);
                continue;
            }
            if time_diff > config.redundant_after && self.ctx.caches.sightings.contains_spawn(spawn.spawn_id).await {
                DispatchCounters::bump(&self.counters.redundant);
                continue;
            }

            self.dispatch(Point::timed(&spawn, deadline)).await?;
        }
        Ok(())
    }

    /// Next untimed point. Points that found no worker come back once the
    /// buffered ones are used up; the registry refills the buffer after that.
    fn next_untimed(&self) -> Option<Coordinates> {
        let mut untimed = self.untimed.lock().unwrap_or_else(|e| e.into_inner());
        if untimed.is_empty() {
            let mut retry = self.retry_later.lock().unwrap_or_else(|e| e.into_inner());
            if retry.is_empty() {
                *untimed = self.ctx.spawns.mysteries();
            } else {
                untimed.extend(retry.drain(..));
            }
        }
        untimed.pop_front()
    }

    /// Wait until no manual-solve backlog holds dispatch back, then take a
    /// dispatch slot. Every visit that leaves the overseer goes through here.
    async fn take_slot(&self) -> Result<OwnedSemaphorePermit> {
        loop {
            if !self.ctx.pool.wait_for_solve_capacity(&self.ctx.cancel).await {
                return Err(anyhow!("dispatch cancelled"));
            }
            let permit = tokio::select! {
                permit = self.dispatch.clone().acquire_owned() => permit.context("Dispatch semaphore closed")?,
                _ = self.ctx.cancel.cancelled() => return Err(anyhow!("dispatch cancelled")),
            };
            // The visit that held the slot may have benched its identity
            if self.ctx.pool.has_solve_capacity() {
                return Ok(permit);
            }
        }
    }

    /// Take a dispatch slot and hand the point to a detached task.
    async fn dispatch(self: &Arc<Self>, point: Point) -> Result<JoinHandle<()>> {
        let permit = self.take_slot().await?;
        DispatchCounters::bump(&self.counters.dispatched);
        let overseer = self.clone();
        Ok(self.tracker.spawn(async move { overseer.try_point(point, permit).await }))
    }

    /// Find the idle worker with the lowest feasible travel speed to `point`.
    /// Returns `None` once the point's skip time passes or on cancellation.
    pub async fn best_worker(&self, point: &Point) -> Option<(Arc<Worker>, BusyGuard, f64)> {
        let config = &self.ctx.config;
        let skip_time = point.skip_time(timing::now(), config);

        loop {
            if self.ctx.cancel.is_cancelled() {
                return None;
            }
            let arrival = point.arrival(timing::now());
            let mut best: Option<(Arc<Worker>, BusyGuard, f64)> = None;
            for worker in &self.workers {
                let Some(guard) = worker.try_acquire() else {
                    continue;
                };
                if guard.identity().is_none() {
                    continue;
                }
                let speed = worker.travel_speed(point.coords, arrival);
                let better = best.as_ref().map_or(true, |(_, _, lowest)| speed < *lowest);
                if better && speed < config.speed_limit {
                    best = Some((worker.clone(), guard, speed));
                    if speed < config.good_enough {
                        break;
                    }
                }
            }
            if best.is_some() {
                return best;
            }
            if skip_time.is_some_and(|t| timing::now() >= t) {
                return None;
            }
            self.pause(timing::secs(config.search_interval)).await;
        }
    }

    async fn try_point(self: Arc<Self>, point: Point, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        let mut target = point;
        if self.ctx.config.point_jitter > 0.0 && point.kind != PointKind::MustVisit {
            target.coords = point.coords.jitter(self.ctx.config.point_jitter);
        }

        let Some((worker, mut guard, speed)) = self.best_worker(&target).await else {
            match point.kind {
                PointKind::Timed => {
                    DispatchCounters::bump(&self.counters.skipped);
                    debug!("No worker could reach spawn {:?} in time", point.spawn_id);
                }
                PointKind::Untimed => {
                    self.retry_later
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back(point.coords);
                }
                PointKind::MustVisit => {}
            }
            return;
        };
        worker.set_speed(speed);

        if let Some(deadline) = point.deadline {
            let wait = deadline - timing::now();
            if wait > 0.0 {
                self.pause(timing::secs(wait)).await;
                if self.ctx.cancel.is_cancelled() {
                    return;
                }
            }
            worker.set_after_spawn(timing::now() - deadline);
        }

        let result = match point.kind {
            PointKind::MustVisit => worker.bootstrap_visit(&mut guard, target.coords).await,
            _ => worker.visit(&mut guard, target.coords, false).await,
        };
        DispatchCounters::bump(&self.counters.visits);
        if let Err(e) = result {
            self.record_worker_error(e);
        }
    }

    fn record_worker_error(&self, error: WorkerError) {
        match error {
            WorkerError::Cancelled(slot) => debug!(slot, "Visit cancelled"),
            fatal @ WorkerError::Fatal { .. } => {
                error!("{}", fatal);
                let mut reason = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
                reason.get_or_insert_with(|| fatal.to_string());
                self.ctx.cancel.cancel();
            }
        }
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {},
            _ = self.ctx.cancel.cancelled() => {},
        }
    }

    /// Periodic status log and snapshot persistence.
    async fn status_loop(self: Arc<Self>) {
        let mut status = tokio::time::interval(timing::secs(self.ctx.config.status_interval));
        let mut snapshot = tokio::time::interval(timing::secs(self.ctx.config.snapshot_interval));
        status.tick().await;
        snapshot.tick().await;
        loop {
            tokio::select! {
                _ = status.tick() => info!("Status: {}", self.status().summary()),
                _ = snapshot.tick() => {
                    if let Err(e) = self.save_snapshots().await {
                        error!("Failed to save snapshots: {:?}", e);
                    }
                }
                _ = self.ctx.cancel.cancelled() => break,
            }
        }
    }

    /// Periodically replace the least productive identity while spare
    /// identities exist. A worker that is busy, including one in the middle of
    /// a failure-driven swap, is never picked.
    async fn swap_loop(self: Arc<Self>) {
        let period = timing::secs(self.ctx.config.swap_interval);
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = self.ctx.cancel.cancelled() => break,
            }
            if self.ctx.pool.available_len() == 0 {
                continue;
            }
            if let Err(e) = self.swap_least_productive().await {
                warn!("Throughput swap failed: {}", e);
            }
        }
    }

    /// Swap the identity of the idle worker with the lowest records per second.
    /// Returns the slot that was swapped, if any.
    pub async fn swap_least_productive(&self) -> Result<Option<usize>, WorkerError> {
        let now = timing::now();
        let min_age = self.ctx.config.swap_interval;
        let mut lowest: Option<(f64, &Arc<Worker>, BusyGuard)> = None;
        for worker in &self.workers {
            if now - worker.snapshot().telemetry.account_started < min_age {
                continue;
            }
            let Some(guard) = worker.try_acquire() else {
                continue;
            };
            let rate = worker.seen_per_second(now);
            if lowest.as_ref().map_or(true, |(r, _, _)| rate < *r) {
                lowest = Some((rate, worker, guard));
            }
        }
        let Some((rate, worker, mut guard)) = lowest else {
            return Ok(None);
        };
        let reason = format!("least productive at {:.3} records/s", rate);
        worker.swap_identity(&mut guard, &reason).await?;
        Ok(Some(worker.slot()))
    }

    /// Snapshot of dispatch counters, worker telemetry and identity census.
    pub fn status(&self) -> StatusReport {
        let workers: Vec<_> = self.workers.iter().map(|w| w.snapshot()).collect();
        let speeds: Vec<f64> = workers.iter().map(|w| w.telemetry.speed).collect();
        let after: Vec<f64> = workers.iter().filter_map(|w| w.telemetry.after_spawn).collect();
        let caches = &self.ctx.caches;
        StatusReport {
            timestamp: chrono::Utc::now().timestamp(),
            uptime_secs: timing::now() - self.started,
            dispatch: self.counters.snapshot(),
            in_flight: self.in_flight(),
            inventory: Inventory {
                timed_spawns: self.ctx.spawns.timed_len(),
                mystery_spawns: self.ctx.spawns.mystery_len(),
                cell_points: self.ctx.spawns.cell_point_len(),
                cached_sightings: caches.sightings.len(),
                cached_mysteries: caches.mysteries.len(),
                cached_features: caches.features.len(),
            },
            identities: self.ctx.pool.census(),
            writes: self.ctx.writes.stats(),
            speed: Stats::generate(&speeds),
            after_spawn: Stats::generate(&after),
            workers,
        }
    }

    /// Persist identities, the spawn registry and the feature cache.
    pub async fn save_snapshots(&self) -> Result<()> {
        let identities = serde_json::to_value(self.ctx.pool.snapshot()).context("Failed to encode identities")?;
        self.snapshots.save_snapshot(IDENTITIES_SNAPSHOT, &identities).await?;

        let spawns = serde_json::to_value(self.ctx.spawns.snapshot()).context("Failed to encode spawns")?;
        self.snapshots.save_snapshot(SPAWNS_SNAPSHOT, &spawns).await?;

        let features =
            serde_json::to_value(self.ctx.caches.features.snapshot()).context("Failed to encode feature cache")?;
        self.snapshots.save_snapshot(FEATURES_SNAPSHOT, &features).await?;
        debug!("Snapshots saved");
        Ok(())
    }

    /// Stop dispatching, drain in-flight visits, return every identity to the
    /// pool, flush pending writes and persist snapshots.
    pub async fn shutdown(&self) -> Result<Census> {
        let grace = timing::secs(self.ctx.config.shutdown_grace);
        info!("Shutting down, waiting up to {:?} for in-flight visits", grace);

        // 1. Stop the launch loop and every task at its next suspension point
        self.ctx.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("{} tasks still running after the grace period", self.tracker.len());
        }

        // 2. Identities back to the pool
        for worker in &self.workers {
            match tokio::time::timeout(grace, worker.acquire()).await {
                Ok(mut guard) => {
                    worker.return_identity(&mut guard);
                }
                Err(_) => warn!(slot = worker.slot(), "Worker still busy, its identity stays with the slot"),
            }
        }

        // 3. Drain the write buffer
        self.flush.cancel();
        let write_task = self.write_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = write_task {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => error!("Write buffer stopped with an error: {:?}", e),
                Ok(Err(e)) => error!("Write buffer task failed: {}", e),
                Err(_) => warn!("Write buffer did not drain within {:?}", grace),
            }
        }

        // 4. Snapshots
        if let Err(e) = self.save_snapshots().await {
            error!("Failed to save snapshots on shutdown: {:?}", e);
        }

        let census = self.ctx.pool.census();
        info!(
            "Shutdown complete: {} available, {} awaiting solve, {} retired, {} still owned",
            census.available.len(),
            census.manual_solve.len(),
            census.retired.len(),
            census.owned.len()
        );
        Ok(census)
    }
}
