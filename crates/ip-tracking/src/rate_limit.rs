//! Fixed-window rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{EndpointRateLimitConfig, RateLimitRule};

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The attempt is within budget.
    Allow,
    /// The budget is spent until the window resets.
    Deny {
        /// Time until the current window ends.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Check if the attempt is allowed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Attempt counter for one key.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    window_start: Instant,
    window: Duration,
    count: u64,
}

impl WindowCounter {
    const fn open(now: Instant, window: Duration) -> Self {
        Self {
            window_start: now,
            window,
            count: 0,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }
}

#[derive(Debug, Default)]
struct Counters {
    by_key: HashMap<String, WindowCounter>,
    last_sweep: Option<Instant>,
}

impl Counters {
    /// Drop expired counters if a full `window` has passed since the last sweep.
    fn sweep_if_due(&mut self, window: Duration, now: Instant) {
        match self.last_sweep {
            Some(at) if now.saturating_duration_since(at) < window => {}
            Some(_) => {
                let before = self.by_key.len();
                self.by_key.retain(|_, c| !c.expired(now));
                self.last_sweep = Some(now);
                debug!(removed = before - self.by_key.len(), "Swept expired rate-limit counters");
            }
            None => self.last_sweep = Some(now),
        }
    }
}

/// Keyed fixed-window counter.
///
/// Every attempt counts, allowed or not. The attempt that takes the count
/// past the rule's limit, and every one after it, is denied until the window
/// that began with the key's first attempt has fully elapsed.
///
/// Counters whose window has elapsed are swept during checks, at most once
/// per window, so the map only holds keys seen recently.
#[derive(Debug, Default)]
pub struct RateLimiter {
    counters: Mutex<Counters>,
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an attempt for `key` and decide.
    pub fn check(&self, key: &str, rule: &RateLimitRule) -> RateDecision {
        self.check_at(key, rule, Instant::now())
    }

    /// Count an attempt for `key` at `now` and decide.
    pub fn check_at(&self, key: &str, rule: &RateLimitRule, now: Instant) -> RateDecision {
        let mut counters = self.counters.lock();
        counters.sweep_if_due(rule.window, now);
        let counter = counters
            .by_key
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::open(now, rule.window));

        if counter.expired(now) {
            *counter = WindowCounter::open(now, rule.window);
        }
        counter.count = counter.count.saturating_add(1);

        if counter.count > rule.limit {
            let elapsed = now.saturating_duration_since(counter.window_start);
            let retry_after = rule.window.saturating_sub(elapsed);
            debug!(key = %key, count = counter.count, limit = rule.limit, "Rate limit exceeded");
            RateDecision::Deny { retry_after }
        } else {
            RateDecision::Allow
        }
    }

    /// Attempts counted in the current window for `key`.
    #[must_use]
    pub fn current_count(&self, key: &str) -> u64 {
        self.counters.lock().by_key.get(key).map_or(0, |c| c.count)
    }

    /// Drop counters whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut counters = self.counters.lock();
        let before = counters.by_key.len();
        counters.by_key.retain(|_, c| !c.expired(now));
        counters.last_sweep = Some(now);
        before - counters.by_key.len()
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.counters.lock().by_key.len()
    }

    /// Forget every counter.
    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }
}

/// Rate limits guarding one endpoint.
///
/// The address budget always applies; the identity budget applies only to
/// authenticated requests. Both must allow.
#[derive(Debug)]
pub struct EndpointRateLimit {
    config: EndpointRateLimitConfig,
    by_address: RateLimiter,
    by_identity: RateLimiter,
}

impl EndpointRateLimit {
    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: EndpointRateLimitConfig) -> Self {
        Self {
            config,
            by_address: RateLimiter::new(),
            by_identity: RateLimiter::new(),
        }
    }

    /// The protected endpoint path.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Check whether a request is subject to these limits.
    #[must_use]
    pub fn applies_to(&self, path: &str, method: &str) -> bool {
        path == self.config.endpoint && self.config.applies_to_method(method)
    }

    /// Count an attempt and decide.
    pub fn check(&self, ip: IpAddr, identity: Option<&str>) -> RateDecision {
        self.check_at(ip, identity, Instant::now())
    }

    /// Count an attempt at `now` and decide.
    pub fn check_at(&self, ip: IpAddr, identity: Option<&str>, now: Instant) -> RateDecision {
        let endpoint = &self.config.endpoint;

        let address_key = format!("{endpoint}:ip:{ip}");
        let by_address = self
            .by_address
            .check_at(&address_key, &self.config.by_address, now);

        let by_identity = identity.map_or(RateDecision::Allow, |id| self.count_identity(id, now));

        match (by_address, by_identity) {
            (RateDecision::Allow, RateDecision::Allow) => RateDecision::Allow,
            (RateDecision::Deny { retry_after: a }, RateDecision::Deny { retry_after: b }) => {
                warn!(ip = %ip, endpoint = %endpoint, "Address and identity rate limited");
                RateDecision::Deny {
                    retry_after: a.max(b),
                }
            }
            (deny @ RateDecision::Deny { .. }, RateDecision::Allow) => {
                warn!(ip = %ip, endpoint = %endpoint, "Address rate limited");
                deny
            }
            (RateDecision::Allow, deny @ RateDecision::Deny { .. }) => {
                warn!(ip = %ip, endpoint = %endpoint, identity = ?identity, "Identity rate limited");
                deny
            }
        }
    }

    /// Count an attempt against the identity budget alone.
    ///
    /// Used when no client address is known.
    pub fn check_identity(&self, identity: &str) -> RateDecision {
        self.check_identity_at(identity, Instant::now())
    }

    /// Count an identity-only attempt at `now` and decide.
    pub fn check_identity_at(&self, identity: &str, now: Instant) -> RateDecision {
        let decision = self.count_identity(identity, now);
        if !decision.is_allowed() {
            warn!(endpoint = %self.config.endpoint, identity = %identity, "Identity rate limited");
        }
        decision
    }

    fn count_identity(&self, identity: &str, now: Instant) -> RateDecision {
        let key = format!("{}:user:{identity}", self.config.endpoint);
        self.by_identity.check_at(&key, &self.config.by_identity, now)
    }

    /// Drop expired counters from both limiters.
    pub fn purge_expired(&self, now: Instant) -> usize {
        self.by_address.purge_expired(now) + self.by_identity.purge_expired(now)
    }

    /// Keys currently tracked across both limiters.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.by_address.tracked_keys() + self.by_identity.tracked_keys()
    }
}
