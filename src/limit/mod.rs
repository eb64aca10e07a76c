//! Multi-scope rate limiting. One `RateLimiter` per upstream runtime owns
//! the endpoint window plus keyed window maps for the ip / user / key
//! scopes. Scope checks run cheapest-first (endpoint, ip, user) with the
//! key scope evaluated inside key selection.

pub mod window;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::compile::RateTuning;
use window::SlidingWindow;

/// Outcome of an endpoint/ip/user admission check.
#[derive(Debug)]
pub enum Admission {
    Admitted,
    /// `retry_at` is the earliest instant the blocking scope can admit.
    Blocked { retry_at: Option<Instant> },
}

pub struct RateLimiter {
    tuning: RateTuning,
    endpoint: Option<Arc<SlidingWindow>>,
    ip: DashMap<String, Arc<SlidingWindow>>,
    user: DashMap<String, Arc<SlidingWindow>>,
    key: DashMap<String, Arc<SlidingWindow>>,
}

impl RateLimiter {
    pub fn new(tuning: RateTuning) -> Self {
        let endpoint = tuning.endpoint.map(|q| Arc::new(SlidingWindow::new(q)));
        Self {
            tuning,
            endpoint,
            ip: DashMap::new(),
            user: DashMap::new(),
            key: DashMap::new(),
        }
    }

    /// Whether the endpoint quota (and key-usage accounting) applies to this
    /// path suffix.
    pub fn path_is_limited(&self, suffix: &str) -> bool {
        self.tuning.paths.matches(suffix)
    }

    fn ip_window(&self, ip: &str) -> Option<Arc<SlidingWindow>> {
        let quota = self.tuning.ip?;
        Some(
            self.ip
                .entry(ip.to_string())
                .or_insert_with(|| Arc::new(SlidingWindow::new(quota)))
                .clone(),
        )
    }

    fn user_window(&self, user: &str) -> Option<Arc<SlidingWindow>> {
        let quota = self.tuning.user?;
        Some(
            self.user
                .entry(user.to_string())
                .or_insert_with(|| Arc::new(SlidingWindow::new(quota)))
                .clone(),
        )
    }

    /// Window guarding one credential value, or `None` when the key scope is
    /// unlimited.
    pub fn key_window(&self, key: &str) -> Option<Arc<SlidingWindow>> {
        let quota = self.tuning.key?;
        Some(
            self.key
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(SlidingWindow::new(quota)))
                .clone(),
        )
    }

    /// Check the endpoint / ip / user scopes in order and, when all admit,
    /// consume one sample from each. First block wins; nothing is consumed
    /// on a block, so a deferred request re-evaluates cleanly later.
    pub fn admit(&self, suffix: &str, ip: &str, user: Option<&str>) -> Admission {
        let mut windows: Vec<Arc<SlidingWindow>> = Vec::with_capacity(3);
        if self.path_is_limited(suffix) {
            if let Some(w) = self.endpoint.clone() {
                windows.push(w);
            }
        }
        if let Some(w) = self.ip_window(ip) {
            windows.push(w);
        }
        if let Some(w) = user.and_then(|u| self.user_window(u)) {
            windows.push(w);
        }

        for w in &windows {
            if !w.would_admit() {
                return Admission::Blocked {
                    retry_at: w.earliest_admit(),
                };
            }
        }
        // Commit phase. A concurrent admission may have taken the last slot
        // between the check and the insert; treat that as a block. Earlier
        // windows keep their sample, which only makes admission stricter,
        // never unsound.
        for w in &windows {
            if !w.try_acquire() {
                return Admission::Blocked {
                    retry_at: w.earliest_admit(),
                };
            }
        }
        Admission::Admitted
    }

    /// Latest of the earliest-admit instants across the endpoint / ip / user
    /// scopes. `None` when every scope has headroom.
    pub fn earliest_admit(&self, suffix: &str, ip: &str, user: Option<&str>) -> Option<Instant> {
        let mut latest: Option<Instant> = None;
        let mut consider = |w: Option<Arc<SlidingWindow>>| {
            if let Some(at) = w.and_then(|w| w.earliest_admit()) {
                latest = Some(match latest {
                    Some(cur) if cur >= at => cur,
                    _ => at,
                });
            }
        };
        if self.path_is_limited(suffix) {
            consider(self.endpoint.clone());
        }
        consider(self.ip_window(ip));
        consider(user.and_then(|u| self.user_window(u)));
        latest
    }

    /// Drop ip/user/key windows that have fully drained, so dynamic
    /// identifiers (client IPs) do not grow the maps unboundedly.
    pub fn prune_idle(&self) {
        self.ip.retain(|_, w| !w.is_empty());
        self.user.retain(|_, w| !w.is_empty());
        self.key.retain(|_, w| !w.is_empty());
    }
}
