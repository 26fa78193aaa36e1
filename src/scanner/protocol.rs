//! Boundary to the remote map service.
//!
//! The wire protocol and request signing live behind `ProtocolClient`. The
//! scanner only sees decoded responses and a closed set of `ProtocolError`
//! kinds, each mapped to one recovery action by `Recovery::classify`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::scanner::identity::{Identity, SessionTokens};
use crate::types::{Coordinates, EncounterId, EncounterStats, SpawnId};

/// Every failure the service boundary can report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("request timed out")]
    Timeout,
    #[error("service is offline")]
    ServiceOffline,
    #[error("request signing service is offline")]
    HashingOffline,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("throttled until {reset_at:?}")]
    Throttled { reset_at: Option<f64> },
    #[error("session is not logged in")]
    NotLoggedIn,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("challenge required at {url}")]
    ChallengeRequired { url: String },
    #[error("identity is banned")]
    Banned,
    #[error("egress address is blocked")]
    ProxyBlocked,
    #[error("service rejected the request")]
    BadRpc,
    #[error("client version is no longer accepted")]
    ForcedUpgrade,
    #[error("request signing key expired")]
    ExpiredKey,
    #[error("empty response")]
    EmptyResponse,
}

/// What to do about a `ProtocolError`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Recovery {
    /// Transient, retry with backoff
    Retry,
    /// Wait until the given time (or a default backoff) and retry
    Cooldown { reset_at: Option<f64> },
    /// Log in again with the same identity
    Reauthenticate,
    /// Release the identity and take another one
    SwapIdentity,
    /// Move the identity to the manual-solve queue
    BenchIdentity,
    /// Remove the identity permanently
    RetireIdentity,
    /// Switch to another egress route
    RotateEgress,
    /// Stop the whole process
    Fatal,
}

impl Recovery {
    /// Map an error to its recovery action.
    pub fn classify(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Timeout
            | ProtocolError::ServiceOffline
            | ProtocolError::HashingOffline
            | ProtocolError::Malformed(_)
            | ProtocolError::EmptyResponse => Recovery::Retry,
            ProtocolError::Throttled { reset_at } => Recovery::Cooldown { reset_at: *reset_at },
            ProtocolError::NotLoggedIn => Recovery::Reauthenticate,
            ProtocolError::AuthFailed(_) | ProtocolError::BadRpc => Recovery::SwapIdentity,
            ProtocolError::ChallengeRequired { .. } => Recovery::BenchIdentity,
            ProtocolError::Banned => Recovery::RetireIdentity,
            ProtocolError::ProxyBlocked => Recovery::RotateEgress,
            ProtocolError::ForcedUpgrade | ProtocolError::ExpiredKey => Recovery::Fatal,
        }
    }
}

/// Record of an entity reported in a map cell.
#[derive(Debug, Clone, PartialEq)]
pub struct WildRecord {
    pub encounter_id: EncounterId,
    pub spawn_id: SpawnId,
    pub species_id: u16,
    pub coords: Coordinates,
    pub last_modified_ms: i64,
    /// Milliseconds until the record disappears; out-of-range values mean unknown
    pub time_till_hidden_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureKind {
    /// Contested structure
    Structure { team: u8, prestige: u32, guard_species_id: u16 },
    /// Spinnable stop
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawFeature {
    pub id: String,
    pub coords: Coordinates,
    pub kind: FeatureKind,
    pub last_modified_ms: i64,
    /// When the identity may spin this feature again
    pub cooldown_complete_ms: Option<i64>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapCell {
    pub wild: Vec<WildRecord>,
    pub features: Vec<RawFeature>,
    /// Spawn locations reported without a current record
    pub spawn_points: Vec<Coordinates>,
}

/// Decoded response of a map visit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapObjects {
    pub cells: Vec<MapCell>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpinResult {
    /// Item id to count awarded by the spin
    Success { awarded: BTreeMap<u32, u32> },
    OutOfRange,
    Cooldown,
    InventoryFull,
    DailyLimit,
    Failed(u32),
}

/// Player profile returned by the first-time app initialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppProfile {
    pub level: u32,
    pub items: BTreeMap<u32, u32>,
}

/// Decoded remote service. Every call carries the identity it is made for
/// and the egress route to use.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Authenticate and obtain session tokens.
    async fn login(&self, identity: &Identity, proxy: Option<&str>) -> Result<SessionTokens, ProtocolError>;

    /// First-time app initialization for a fresh identity.
    async fn initialize_app(&self, identity: &Identity, proxy: Option<&str>) -> Result<AppProfile, ProtocolError>;

    /// Lowest client version the service currently accepts, if it says.
    async fn minimum_version(&self, identity: &Identity, proxy: Option<&str>) -> Result<Option<String>, ProtocolError>;

    /// Request the map objects around a point.
    async fn visit(&self, identity: &Identity, proxy: Option<&str>, point: Coordinates) -> Result<MapObjects, ProtocolError>;

    /// Request detailed stats for a record.
    async fn encounter(
        &self,
        identity: &Identity,
        proxy: Option<&str>,
        record: &WildRecord,
        point: Coordinates,
    ) -> Result<EncounterStats, ProtocolError>;

    async fn spin_feature(
        &self,
        identity: &Identity,
        proxy: Option<&str>,
        feature: &RawFeature,
        point: Coordinates,
    ) -> Result<SpinResult, ProtocolError>;

    /// Submit a solved challenge token. Returns whether the service accepted it.
    async fn verify_challenge(&self, identity: &Identity, proxy: Option<&str>, token: &str) -> Result<bool, ProtocolError>;

    /// Discard `count` items of one kind. Returns whether the service accepted it.
    async fn recycle_item(
        &self,
        identity: &Identity,
        proxy: Option<&str>,
        item_id: u32,
        count: u32,
    ) -> Result<bool, ProtocolError>;
}

/// Optional solver for challenges raised against an identity.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    async fn solve(&self, challenge_url: &str) -> anyhow::Result<String>;
}

/// Compare dotted version strings numerically. Non-numeric parts count as zero.
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u32> { v.split('.').map(|p| p.trim().parse().unwrap_or(0)).collect() };
    let (mut a, mut b) = (parse(version), parse(minimum));
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a >= b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(Recovery::classify(&ProtocolError::Timeout), Recovery::Retry);
        assert_eq!(Recovery::classify(&ProtocolError::Malformed("x".into())), Recovery::Retry);
        assert_eq!(
            Recovery::classify(&ProtocolError::Throttled { reset_at: Some(5.0) }),
            Recovery::Cooldown { reset_at: Some(5.0) }
        );
        assert_eq!(Recovery::classify(&ProtocolError::NotLoggedIn), Recovery::Reauthenticate);
        assert_eq!(Recovery::classify(&ProtocolError::AuthFailed("bad".into())), Recovery::SwapIdentity);
        assert_eq!(
            Recovery::classify(&ProtocolError::ChallengeRequired { url: "u".into() }),
            Recovery::BenchIdentity
        );
        assert_eq!(Recovery::classify(&ProtocolError::Banned), Recovery::RetireIdentity);
        assert_eq!(Recovery::classify(&ProtocolError::ProxyBlocked), Recovery::RotateEgress);
        assert_eq!(Recovery::classify(&ProtocolError::ForcedUpgrade), Recovery::Fatal);
        assert_eq!(Recovery::classify(&ProtocolError::ExpiredKey), Recovery::Fatal);
    }

    #[test]
    fn test_version_comparison() {
        assert!(version_at_least("0.57.4", "0.57.4"));
        assert!(version_at_least("0.59", "0.57.4"));
        assert!(!version_at_least("0.57.4", "0.59.1"));
        assert!(version_at_least("1.0", "0.99.99"));
    }
}
