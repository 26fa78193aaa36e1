//! Identity records: credentials plus the session state that survives swaps
//! and restarts.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::Coordinates;

const DEVICE_MODELS: &[(&str, &str)] = &[
    ("iPhone8,1", "10.2.1"),
    ("iPhone8,2", "10.3.1"),
    ("iPhone9,1", "10.3.2"),
    ("iPhone9,3", "10.2.1"),
    ("iPhone9,4", "10.3.2"),
];

fn default_provider() -> String {
    "ptc".to_string()
}

/// Device fingerprint presented to the service. Generated once per identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub device_id: String,
    pub model: String,
    pub os_version: String,
}

impl DeviceFingerprint {
    /// Generate a random fingerprint.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let (model, os_version) = DEVICE_MODELS
            .choose(&mut rng)
            .copied()
            .unwrap_or(("iPhone8,1", "10.2.1"));
        Self {
            device_id: format!("{:032x}", rng.gen::<u128>()),
            model: model.to_string(),
            os_version: os_version.to_string(),
        }
    }
}

/// Access token returned by a successful login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: String,
    /// Unix timestamp (seconds) after which a new login is needed
    pub expires_at: f64,
}

impl SessionTokens {
    pub fn is_valid(&self, now: f64) -> bool {
        self.expires_at > now
    }
}

/// One login identity and everything learned about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub password: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub device: Option<DeviceFingerprint>,
    #[serde(default)]
    pub tokens: Option<SessionTokens>,
    /// Time of the last request made with this identity
    #[serde(default)]
    pub last_active: Option<f64>,
    /// Position reported with the last request
    #[serde(default)]
    pub location: Option<Coordinates>,
    /// Item id to count
    #[serde(default)]
    pub items: BTreeMap<u32, u32>,
    #[serde(default)]
    pub level: Option<u32>,
    /// Set once the first-time app initialization has completed
    #[serde(default)]
    pub inventory_timestamp: Option<i64>,
    /// A challenge must be solved before the identity can be used again
    #[serde(default)]
    pub captcha: bool,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub throttle_failures: u32,
}

impl Identity {
    /// Create a fresh identity with the default provider.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            provider: default_provider(),
            device: None,
            tokens: None,
            last_active: None,
            location: None,
            items: BTreeMap::new(),
            level: None,
            inventory_timestamp: None,
            captcha: false,
            banned: false,
            throttle_failures: 0,
        }
    }

    /// Device fingerprint, generated on first use and kept afterwards.
    pub fn ensure_device(&mut self) -> &DeviceFingerprint {
        self.device.get_or_insert_with(DeviceFingerprint::generate)
    }

    /// Whether the identity went through first-time app initialization.
    pub fn is_initialized(&self) -> bool {
        self.inventory_timestamp.is_some()
    }

    /// Total number of items held.
    pub fn item_count(&self) -> u32 {
        self.items.values().fold(0u32, |total, count| total.saturating_add(*count))
    }

    /// Whether the identity may be handed to a worker.
    pub fn is_usable(&self) -> bool {
        !self.banned && !self.captcha
    }

    /// Fold a persisted copy of this identity into the configured one.
    /// Configured credentials win; learned session state is taken from the
    /// stored copy. A stored device fingerprint is never replaced.
    pub fn merge_persisted(&mut self, stored: Identity) {
        if stored.username != self.username {
            return;
        }
        if stored.device.is_some() {
            self.device = stored.device;
        }
        self.tokens = stored.tokens;
        self.last_active = stored.last_active;
        self.location = stored.location;
        self.items = stored.items;
        self.level = stored.level;
        self.inventory_timestamp = stored.inventory_timestamp;
        self.captcha = stored.captcha;
        self.banned = stored.banned;
        self.throttle_failures = stored.throttle_failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_is_generated_once() {
        let mut identity = Identity::new("alpha", "pw");
        let first = identity.ensure_device().clone();
        assert_eq!(first.device_id.len(), 32);
        let second = identity.ensure_device().clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_keeps_configured_credentials() {
        let mut configured = Identity::new("alpha", "new-password");
        let mut stored = Identity::new("alpha", "old-password");
        stored.ensure_device();
        stored.level = Some(12);
        stored.banned = true;

        configured.merge_persisted(stored.clone());
        assert_eq!(configured.password, "new-password");
        assert_eq!(configured.level, Some(12));
        assert!(configured.banned);
        assert_eq!(configured.device, stored.device);
    }

    #[test]
    fn test_stored_device_outlives_configured_one() {
        let mut stored = Identity::new("alpha", "pw");
        let assigned = stored.ensure_device().clone();

        let mut configured = Identity::new("alpha", "pw");
        configured.device = Some(DeviceFingerprint::generate());
        configured.merge_persisted(stored);
        assert_eq!(configured.device, Some(assigned));

        // Without a stored fingerprint the configured one is kept
        let mut configured = Identity::new("alpha", "pw");
        let own = configured.ensure_device().clone();
        configured.merge_persisted(Identity::new("alpha", "pw"));
        assert_eq!(configured.device, Some(own));
    }

    #[test]
    fn test_merge_ignores_other_usernames() {
        let mut configured = Identity::new("alpha", "pw");
        let mut other = Identity::new("beta", "pw");
        other.banned = true;
        configured.merge_persisted(other);
        assert!(!configured.banned);
    }

    #[test]
    fn test_usable_flags() {
        let mut identity = Identity::new("alpha", "pw");
        assert!(identity.is_usable());
        identity.captcha = true;
        assert!(!identity.is_usable());
    }
}
