//! Egress routes (proxies) and their rotation.
//!
//! A blocked route is swapped for the next one in the list. Rotations are
//! rate limited globally so a burst of blocks does not cycle through every
//! route at once; when no rotation is possible the caller waits instead.

use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonempty::NonEmpty;
use tracing::{info, warn};

/// Outcome of a rotation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// Use this route from now on
    Rotated(String),
    /// No alternate route right now; wait this long and retry on the same one
    Wait(Duration),
}

pub struct EgressPool {
    routes: Option<NonEmpty<String>>,
    next: Mutex<usize>,
    limiter: Option<DefaultDirectRateLimiter>,
    wait: Duration,
}

impl EgressPool {
    /// Create a pool over the configured proxies. An empty list means direct egress.
    pub fn new(proxies: Vec<String>, cooldown: Duration, wait: Duration) -> Self {
        let routes = NonEmpty::from_vec(proxies);
        let limiter = Quota::with_period(cooldown)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        if let Some(routes) = &routes {
            info!("Egress pool ready with {} routes", routes.len());
        }
        Self {
            routes,
            next: Mutex::new(0),
            limiter,
            wait,
        }
    }

    /// Route assigned to a worker slot at startup.
    pub fn initial(&self, slot: usize) -> Option<String> {
        self.routes
            .as_ref()
            .and_then(|routes| routes.get(slot % routes.len()).cloned())
    }

    pub fn len(&self) -> usize {
        self.routes.as_ref().map_or(0, NonEmpty::len)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_none()
    }

    /// Replace a blocked route.
    pub fn rotate(&self, current: Option<&str>) -> Rotation {
        let Some(routes) = &self.routes else {
            warn!("Egress blocked and no proxies configured, waiting {:?}", self.wait);
            return Rotation::Wait(self.wait);
        };
        if routes.len() < 2 {
            warn!("Egress blocked and no alternate proxy, waiting {:?}", self.wait);
            return Rotation::Wait(self.wait);
        }
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                return Rotation::Wait(self.wait);
            }
        }

        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..routes.len() {
            let candidate = &routes[*next % routes.len()];
            *next = (*next + 1) % routes.len();
            if Some(candidate.as_str()) != current {
                info!("Rotated egress route to {}", candidate);
                return Rotation::Rotated(candidate.clone());
            }
        }
        Rotation::Wait(self.wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> Vec<String> {
        vec!["http://a:1".to_string(), "http://b:1".to_string(), "http://c:1".to_string()]
    }

    #[test]
    fn test_initial_route_by_slot() {
        let pool = EgressPool::new(routes(), Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(pool.initial(0).as_deref(), Some("http://a:1"));
        assert_eq!(pool.initial(4).as_deref(), Some("http://b:1"));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_rotation_skips_current_route() {
        let pool = EgressPool::new(routes(), Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(pool.rotate(Some("http://a:1")), Rotation::Rotated("http://b:1".to_string()));
    }

    #[test]
    fn test_rotation_is_rate_limited() {
        let pool = EgressPool::new(routes(), Duration::from_secs(60), Duration::from_secs(5));
        assert!(matches!(pool.rotate(None), Rotation::Rotated(_)));
        assert_eq!(pool.rotate(None), Rotation::Wait(Duration::from_secs(5)));
    }

    #[test]
    fn test_no_routes_means_wait() {
        let pool = EgressPool::new(Vec::new(), Duration::from_secs(60), Duration::from_secs(5));
        assert!(pool.is_empty());
        assert_eq!(pool.initial(0), None);
        assert_eq!(pool.rotate(None), Rotation::Wait(Duration::from_secs(5)));
    }
}
