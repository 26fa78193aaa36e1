//! Identity pool shared by every worker.
//!
//! Identities live in exactly one place at a time: the available queue, the
//! manual-solve queue, the retired list, or a worker slot. Every move between
//! those places happens under a single lock, so the census always accounts
//! for each identity once.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scanner::config::ScanConfig;
use crate::scanner::identity::Identity;
use crate::scanner::timing;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("not enough identities: {slots} worker slots but only {available} usable identities")]
    Insufficient { slots: usize, available: usize },
}

/// Where every identity currently is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Census {
    pub available: Vec<String>,
    pub manual_solve: Vec<String>,
    pub retired: Vec<String>,
    /// Slot to username
    pub owned: BTreeMap<usize, String>,
}

impl Census {
    /// True when each expected username appears exactly once and nothing else appears.
    pub fn is_consistent(&self, expected: &[String]) -> bool {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let all = self
            .available
            .iter()
            .chain(self.manual_solve.iter())
            .chain(self.retired.iter())
            .chain(self.owned.values());
        for username in all {
            *counts.entry(username.as_str()).or_default() += 1;
        }
        counts.len() == expected.len()
            && expected.iter().all(|u| counts.get(u.as_str()) == Some(&1))
    }
}

#[derive(Default)]
struct Queues {
    available: VecDeque<Identity>,
    manual_solve: VecDeque<Identity>,
    retired: Vec<Identity>,
    owners: BTreeMap<usize, String>,
    /// Latest persisted copy of every identity, owned ones included
    latest: HashMap<String, Identity>,
}

impl Queues {
    fn check_in(&mut self, identity: Identity) {
        self.latest.insert(identity.username.clone(), identity.clone());
        if identity.banned {
            self.retired.push(identity);
        } else if identity.captcha {
            self.manual_solve.push_back(identity);
        } else {
            self.available.push_back(identity);
        }
    }

    fn release_owner(&mut self, slot: usize, username: &str) {
        match self.owners.get(&slot) {
            Some(owner) if owner == username => {
                self.owners.remove(&slot);
            }
            Some(owner) => warn!(slot, "Slot owned by {} but {} was returned", owner, username),
            None => warn!(slot, "Identity {} returned by a slot that owned nothing", username),
        }
    }
}

pub struct ResourcePool {
    queues: Mutex<Queues>,
    available_signal: Notify,
    solve_signal: Notify,
    logins: Semaphore,
    simulations: Semaphore,
    max_manual_solve: usize,
    favor_captcha: bool,
    solver_enabled: bool,
    poll: Duration,
}

impl ResourcePool {
    /// Create a pool from configured identities, routing each one by its flags.
    pub fn new(identities: Vec<Identity>, config: &ScanConfig, solver_enabled: bool) -> Self {
        let mut queues = Queues::default();
        for identity in identities {
            queues.check_in(identity);
        }
        info!(
            "Identity pool: {} available, {} awaiting a manual solve, {} retired",
            queues.available.len(),
            queues.manual_solve.len(),
            queues.retired.len()
        );
        Self {
            queues: Mutex::new(queues),
            available_signal: Notify::new(),
            solve_signal: Notify::new(),
            logins: Semaphore::new(config.simultaneous_logins),
            simulations: Semaphore::new(config.simultaneous_simulation),
            max_manual_solve: config.max_captchas,
            favor_captcha: config.favor_captcha,
            solver_enabled,
            poll: timing::secs(config.acquire_poll),
        }
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand one identity to every slot. Fails without taking anything when
    /// the available queue cannot fill all slots.
    pub fn bootstrap(&self, slots: usize) -> Result<Vec<Identity>, PoolError> {
        let mut queues = self.queues();
        let available = queues.available.len();
        if available < slots {
            return Err(PoolError::Insufficient { slots, available });
        }
        if available == slots {
            warn!("No spare identities: swaps will wait until one is released");
        }
        let mut assigned = Vec::with_capacity(slots);
        for slot in 0..slots {
            if let Some(identity) = queues.available.pop_front() {
                queues.owners.insert(slot, identity.username.clone());
                assigned.push(identity);
            }
        }
        Ok(assigned)
    }

    fn try_take(&self, slot: usize) -> Option<Identity> {
        let mut queues = self.queues();
        let prefer_solve = self.solver_enabled
            && !queues.manual_solve.is_empty()
            && (self.favor_captcha || queues.available.is_empty());
        let identity = if prefer_solve {
            queues.manual_solve.pop_front()
        } else {
            queues.available.pop_front()
        }?;
        queues.owners.insert(slot, identity.username.clone());
        Some(identity)
    }

    /// Take an identity for a slot without waiting.
    pub fn try_acquire(&self, slot: usize) -> Option<Identity> {
        self.try_take(slot)
    }

    /// Wait for an identity for a slot. Returns `None` only when cancelled.
    pub async fn acquire(&self, slot: usize, cancel: &CancellationToken) -> Option<Identity> {
        loop {
            let notified = self.available_signal.notified();
            if let Some(identity) = self.try_take(slot) {
                debug!(slot, "Acquired identity {}", identity.username);
                return Some(identity);
            }
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep(self.poll) => {
                    debug!(slot, "Still waiting for a free identity");
                },
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Return an identity from a slot, routing it by its flags.
    pub fn release(&self, slot: usize, identity: Identity) {
        {
            let mut queues = self.queues();
            queues.release_owner(slot, &identity.username);
            queues.check_in(identity);
        }
        self.available_signal.notify_one();
    }

    /// Return an identity that hit a challenge.
    pub fn bench(&self, slot: usize, mut identity: Identity) {
        identity.captcha = true;
        self.release(slot, identity);
    }

    /// Return an identity that must never be used again.
    pub fn retire(&self, slot: usize, mut identity: Identity) {
        identity.banned = true;
        self.release(slot, identity);
    }

    /// Move an identity out of the manual-solve queue after an external solve.
    pub fn resolve_challenge(&self, username: &str) -> bool {
        let moved = {
            let mut queues = self.queues();
            match queues.manual_solve.iter().position(|i| i.username == username) {
                Some(index) => match queues.manual_solve.remove(index) {
                    Some(mut identity) => {
                        identity.captcha = false;
                        queues.check_in(identity);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if moved {
            info!("Challenge resolved for {}", username);
            self.available_signal.notify_one();
            self.solve_signal.notify_waiters();
        }
        moved
    }

    /// Remember the latest state of an identity owned by a worker.
    pub fn record(&self, identity: &Identity) {
        self.queues()
            .latest
            .insert(identity.username.clone(), identity.clone());
    }

    pub fn manual_solve_pending(&self) -> usize {
        self.queues().manual_solve.len()
    }

    pub fn available_len(&self) -> usize {
        self.queues().available.len()
    }

    /// Whether the manual-solve backlog is within the configured limit.
    pub fn has_solve_capacity(&self) -> bool {
        self.manual_solve_pending() <= self.max_manual_solve
    }

    /// Block while too many identities await a manual solve. Returns false
    /// when cancelled.
    pub async fn wait_for_solve_capacity(&self, cancel: &CancellationToken) -> bool {
        let mut paused = false;
        loop {
            let notified = self.solve_signal.notified();
            let pending = self.manual_solve_pending();
            if self.has_solve_capacity() {
                if paused {
                    info!("Manual-solve backlog down to {}, resuming dispatch", pending);
                }
                return true;
            }
            if !paused {
                warn!(
                    "{} identities await a manual solve (limit {}), pausing dispatch",
                    pending, self.max_manual_solve
                );
                paused = true;
            }
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep(self.poll) => {},
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Limit on concurrent authentication handshakes.
    pub async fn login_permit(&self) -> Option<SemaphorePermit<'_>> {
        self.logins.acquire().await.ok()
    }

    /// Limit on concurrent first-time app initializations.
    pub async fn init_permit(&self) -> Option<SemaphorePermit<'_>> {
        self.simulations.acquire().await.ok()
    }

    pub fn census(&self) -> Census {
        let queues = self.queues();
        Census {
            available: queues.available.iter().map(|i| i.username.clone()).collect(),
            manual_solve: queues.manual_solve.iter().map(|i| i.username.clone()).collect(),
            retired: queues.retired.iter().map(|i| i.username.clone()).collect(),
            owned: queues.owners.clone(),
        }
    }

    /// Latest copy of every identity, for persistence.
    pub fn snapshot(&self) -> Vec<Identity> {
        let queues = self.queues();
        let mut identities: Vec<Identity> = queues.latest.values().cloned().collect();
        identities.sort_by(|a, b| a.username.cmp(&b.username));
        identities
    }
}
