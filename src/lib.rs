//! spawnwatch - deadline-aware scanner for short-lived map records
//!
//! This crate schedules a fixed pool of authenticated sessions across a map
//! area so that every known spawn point is visited shortly after it becomes
//! observable, and persists what was seen without letting store latency
//! stall the scheduler.

pub mod types;
pub mod scanner;

// Re-export main types for convenience
pub use types::{Coordinates, PointKey, SpawnId, EncounterId};
