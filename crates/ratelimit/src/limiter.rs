//! The limiter: named categories, per-key windows, admission checks.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use reliefgrid_events::{EventBus, ResilienceEvent};

use crate::config::{RateLimitConfig, RateLimitConfigUpdate, RateLimitError, seed_defaults};
use crate::window::Window;

/// Outcome of a rate-limit check.
///
/// Integrators surfacing this over HTTP map `allowed == false` to
/// `429 Too Many Requests` with `retry_after` in the `Retry-After` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Quota left in the current window (after consumption, when allowed).
    pub remaining: u32,
    /// When the current window fully replenishes.
    pub reset_at: DateTime<Utc>,
    /// How long a rejected caller should wait before retrying.
    pub retry_after: Option<Duration>,
}

/// Request admission bounded per `(limit_name, caller_key)`.
///
/// The window table is sharded: checks for different keys never contend.
/// Each window's read-modify-write happens under its own entry lock.
///
/// Construct once at startup and pass by handle; every test builds its own
/// limiter.
pub struct RateLimiter {
    configs: DashMap<String, RateLimitConfig>,
    windows: DashMap<(String, String), Window>,
    bus: Option<Arc<dyn EventBus>>,
}

impl RateLimiter {
    /// Limiter seeded with the platform's default categories
    /// (`global`, `api`, `auth`, `upload`).
    pub fn new() -> Self {
        let limiter = Self::empty();
        for config in seed_defaults() {
            limiter.configs.insert(config.name.clone(), config);
        }
        limiter
    }

    /// Limiter with no categories: every check fails open until categories
    /// are registered.
    pub fn empty() -> Self {
        Self {
            configs: DashMap::new(),
            windows: DashMap::new(),
            bus: None,
        }
    }

    /// Publish rejection events to `bus` in addition to logging them.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Evaluate and, when within quota, consume `cost` events for the caller.
    pub fn check_and_consume(&self, limit_name: &str, caller_key: &str, cost: u32) -> RateLimitResult {
        self.check_and_consume_at(limit_name, caller_key, cost, Utc::now())
    }

    /// [`check_and_consume`](Self::check_and_consume) against an explicit
    /// clock reading.
    pub fn check_and_consume_at(
        &self,
        limit_name: &str,
        caller_key: &str,
        cost: u32,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let Some(config) = self.config(limit_name) else {
            // Unconfigured categories fail open.
            tracing::debug!(limit = limit_name, "no config for limit, allowing");
            return RateLimitResult {
                allowed: true,
                remaining: u32::MAX,
                reset_at: now,
                retry_after: None,
            };
        };

        let key = (limit_name.to_string(), caller_key.to_string());
        let result = {
            let mut entry = self
                .windows
                .entry(key)
                .or_insert_with(|| Window::new(config.strategy, now));
            // A strategy change takes effect here: the stale window is
            // replaced wholesale.
            if !entry.matches(config.strategy) {
                *entry = Window::new(config.strategy, now);
            }
            entry.consume(config.limit, config.window, cost, now)
        };

        if !result.allowed {
            tracing::warn!(
                limit = limit_name,
                key = caller_key,
                cost,
                "rate limit exceeded"
            );
            if let Some(bus) = &self.bus {
                bus.publish(ResilienceEvent::RateLimitExceeded {
                    limit: limit_name.to_string(),
                    key: caller_key.to_string(),
                    at: now,
                });
            }
        }

        result
    }

    /// Read-only projection: what a cost-1 check would return, without
    /// consuming. Repeated calls return identical results absent an
    /// intervening [`check_and_consume`](Self::check_and_consume).
    pub fn remaining(&self, limit_name: &str, caller_key: &str) -> RateLimitResult {
        self.remaining_at(limit_name, caller_key, Utc::now())
    }

    /// [`remaining`](Self::remaining) against an explicit clock reading.
    pub fn remaining_at(
        &self,
        limit_name: &str,
        caller_key: &str,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let Some(config) = self.config(limit_name) else {
            return RateLimitResult {
                allowed: true,
                remaining: u32::MAX,
                reset_at: now,
                retry_after: None,
            };
        };

        let key = (limit_name.to_string(), caller_key.to_string());
        match self.windows.get(&key) {
            Some(window) => window.preview(config.limit, config.window, 1, now),
            None => RateLimitResult {
                allowed: true,
                remaining: config.limit,
                reset_at: now + config.window,
                retry_after: None,
            },
        }
    }

    /// Discard the window for one caller key. Returns `false` if no window
    /// existed.
    pub fn reset(&self, limit_name: &str, caller_key: &str) -> bool {
        let key = (limit_name.to_string(), caller_key.to_string());
        self.windows.remove(&key).is_some()
    }

    /// Add a new category (or replace an existing one wholesale).
    pub fn register(&self, config: RateLimitConfig) -> Result<(), RateLimitError> {
        config.validate()?;
        self.configs.insert(config.name.clone(), config);
        Ok(())
    }

    /// Apply a partial update to an existing category. Takes effect on the
    /// next check.
    pub fn update_config(
        &self,
        limit_name: &str,
        update: RateLimitConfigUpdate,
    ) -> Result<RateLimitConfig, RateLimitError> {
        let mut entry = self
            .configs
            .get_mut(limit_name)
            .ok_or_else(|| RateLimitError::UnknownLimit(limit_name.to_string()))?;
        let mut updated = entry.clone();
        update.apply(&mut updated);
        updated.validate()?;
        *entry = updated.clone();
        tracing::info!(limit = limit_name, "rate limit config updated");
        Ok(updated)
    }

    /// All configured categories, ordered by name.
    pub fn configs(&self) -> Vec<RateLimitConfig> {
        let mut out: Vec<RateLimitConfig> = self
            .configs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Evict windows idle for longer than their own category's window
    /// length. Returns the number of windows removed.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Utc::now())
    }

    /// [`sweep_idle`](Self::sweep_idle) against an explicit clock reading.
    pub fn sweep_idle_at(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        self.windows.retain(|(limit_name, _), window| {
            let Some(config) = self.config(limit_name) else {
                // Orphaned window: its category is gone.
                evicted += 1;
                return false;
            };
            if window.idle(config.window, now) {
                evicted += 1;
                false
            } else {
                true
            }
        });
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle rate-limit windows");
        }
        evicted
    }

    fn config(&self, limit_name: &str) -> Option<RateLimitConfig> {
        self.configs.get(limit_name).map(|entry| entry.value().clone())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use reliefgrid_events::InMemoryEventBus;

    use crate::config::RateLimitStrategy;

    use super::*;

    #[test]
    fn seeded_limiter_carries_the_default_categories() {
        let limiter = RateLimiter::new();
        let names: Vec<String> = limiter.configs().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["api", "auth", "global", "upload"]);
    }

    #[test]
    fn unknown_limit_fails_open() {
        let limiter = RateLimiter::empty();
        let result = limiter.check_and_consume("nonexistent", "caller", 1);
        assert!(result.allowed);
        assert_eq!(result.remaining, u32::MAX);
    }

    #[test]
    fn auth_category_rejects_the_eleventh_attempt() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..10 {
            assert!(limiter.check_and_consume_at("auth", "10.0.0.1", 1, now).allowed);
        }

        let rejected = limiter.check_and_consume_at("auth", "10.0.0.1", 1, now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, Some(Duration::milliseconds(60_000)));
    }

    #[test]
    fn caller_keys_are_isolated() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..10 {
            limiter.check_and_consume_at("auth", "10.0.0.1", 1, now);
        }
        assert!(!limiter.check_and_consume_at("auth", "10.0.0.1", 1, now).allowed);

        // A different caller still has its full quota.
        let other = limiter.check_and_consume_at("auth", "10.0.0.2", 1, now);
        assert!(other.allowed);
        assert_eq!(other.remaining, 9);
    }

    #[test]
    fn remaining_is_idempotent() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        limiter.check_and_consume_at("api", "caller", 3, now);

        let first = limiter.remaining_at("api", "caller", now);
        let second = limiter.remaining_at("api", "caller", now);
        assert_eq!(first, second);
        assert_eq!(first.remaining, 97);
    }

    #[test]
    fn remaining_for_untouched_key_reports_full_quota() {
        let limiter = RateLimiter::new();
        let result = limiter.remaining("api", "fresh-caller");
        assert!(result.allowed);
        assert_eq!(result.remaining, 100);
    }

    #[test]
    fn reset_discards_only_the_named_window() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        for _ in 0..10 {
            limiter.check_and_consume_at("auth", "10.0.0.1", 1, now);
        }

        assert!(limiter.reset("auth", "10.0.0.1"));
        assert!(!limiter.reset("auth", "10.0.0.1"));

        let result = limiter.check_and_consume_at("auth", "10.0.0.1", 1, now);
        assert!(result.allowed);
        assert_eq!(result.remaining, 9);
    }

    #[test]
    fn config_update_takes_effect_on_the_next_check() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        for _ in 0..10 {
            limiter.check_and_consume_at("auth", "10.0.0.1", 1, now);
        }
        assert!(!limiter.check_and_consume_at("auth", "10.0.0.1", 1, now).allowed);

        limiter
            .update_config("auth", RateLimitConfigUpdate::new().with_limit(12))
            .unwrap();

        assert!(limiter.check_and_consume_at("auth", "10.0.0.1", 1, now).allowed);
    }

    #[test]
    fn update_of_unknown_category_is_rejected() {
        let limiter = RateLimiter::empty();
        let err = limiter
            .update_config("ghost", RateLimitConfigUpdate::new().with_limit(1))
            .unwrap_err();
        assert_eq!(err, RateLimitError::UnknownLimit("ghost".to_string()));
    }

    #[test]
    fn strategy_change_replaces_the_window_on_next_check() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        for _ in 0..10 {
            limiter.check_and_consume_at("auth", "10.0.0.1", 1, now);
        }

        limiter
            .update_config(
                "auth",
                RateLimitConfigUpdate::new().with_strategy(RateLimitStrategy::Sliding),
            )
            .unwrap();

        // The fixed-window state is discarded with the strategy switch.
        let result = limiter.check_and_consume_at("auth", "10.0.0.1", 1, now);
        assert!(result.allowed);
        assert_eq!(result.remaining, 9);
    }

    #[test]
    fn sweep_evicts_only_idle_windows() {
        let limiter = RateLimiter::new();
        let now = Utc::now();
        limiter.check_and_consume_at("auth", "idle-caller", 1, now);
        limiter.check_and_consume_at("auth", "busy-caller", 1, now);

        let later = now + Duration::milliseconds(60_000);
        limiter.check_and_consume_at("auth", "busy-caller", 1, later);

        assert_eq!(limiter.sweep_idle_at(later), 1);

        // The busy caller's window survived the sweep.
        let result = limiter.remaining_at("auth", "busy-caller", later);
        assert_eq!(result.remaining, 9);
    }

    #[test]
    fn rejections_are_published_to_the_event_bus() {
        let bus = Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe();
        let limiter = RateLimiter::new().with_event_bus(bus.clone() as Arc<dyn EventBus>);
        let now = Utc::now();

        for _ in 0..11 {
            limiter.check_and_consume_at("auth", "10.0.0.1", 1, now);
        }

        match subscription.try_recv().unwrap() {
            ResilienceEvent::RateLimitExceeded { limit, key, .. } => {
                assert_eq!(limit, "auth");
                assert_eq!(key, "10.0.0.1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
