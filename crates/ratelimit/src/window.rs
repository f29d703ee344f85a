//! Per-key window accounting.
//!
//! A window belongs to one `(limit_name, caller_key)` pair and is only ever
//! touched under that entry's lock. Methods take `now` explicitly so the
//! accounting is deterministic under test.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::config::RateLimitStrategy;
use crate::limiter::RateLimitResult;

/// Window state for one caller key.
#[derive(Debug)]
pub(crate) enum Window {
    Sliding(SlidingWindow),
    Fixed(FixedWindow),
}

impl Window {
    pub(crate) fn new(strategy: RateLimitStrategy, now: DateTime<Utc>) -> Self {
        match strategy {
            RateLimitStrategy::Sliding => Window::Sliding(SlidingWindow::new()),
            RateLimitStrategy::Fixed => Window::Fixed(FixedWindow::new(now)),
        }
    }

    pub(crate) fn matches(&self, strategy: RateLimitStrategy) -> bool {
        matches!(
            (self, strategy),
            (Window::Sliding(_), RateLimitStrategy::Sliding)
                | (Window::Fixed(_), RateLimitStrategy::Fixed)
        )
    }

    pub(crate) fn consume(
        &mut self,
        limit: u32,
        window: Duration,
        cost: u32,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        match self {
            Window::Sliding(state) => state.consume(limit, window, cost, now),
            Window::Fixed(state) => state.consume(limit, window, cost, now),
        }
    }

    pub(crate) fn preview(
        &self,
        limit: u32,
        window: Duration,
        cost: u32,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        match self {
            Window::Sliding(state) => state.preview(limit, window, cost, now),
            Window::Fixed(state) => state.preview(limit, window, cost, now),
        }
    }

    /// True when the window has seen no accountable activity for longer than
    /// its own length; an idle window is equivalent to a fresh one and safe
    /// to evict.
    pub(crate) fn idle(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match self {
            Window::Sliding(state) => state
                .events
                .back()
                .is_none_or(|newest| *newest <= now - window),
            Window::Fixed(state) => now - state.window_start >= window,
        }
    }
}

/// Ordered timestamps of admitted events inside the trailing window.
#[derive(Debug, Default)]
pub(crate) struct SlidingWindow {
    events: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn consume(
        &mut self,
        limit: u32,
        window: Duration,
        cost: u32,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let cutoff = now - window;
        while matches!(self.events.front(), Some(t) if *t <= cutoff) {
            self.events.pop_front();
        }

        let used = self.events.len() as u32;
        let remaining = limit.saturating_sub(used);
        if cost <= remaining {
            for _ in 0..cost {
                self.events.push_back(now);
            }
            let oldest = self.events.front().copied().unwrap_or(now);
            RateLimitResult {
                allowed: true,
                remaining: remaining - cost,
                reset_at: oldest + window,
                retry_after: None,
            }
        } else {
            // Rejection leaves the accounting untouched; only entries already
            // outside the window were pruned above.
            let oldest = self.events.front().copied().unwrap_or(now);
            RateLimitResult {
                allowed: false,
                remaining,
                reset_at: oldest + window,
                retry_after: Some((oldest + window) - now),
            }
        }
    }

    pub(crate) fn preview(
        &self,
        limit: u32,
        window: Duration,
        cost: u32,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let cutoff = now - window;
        let used = self.events.iter().filter(|t| **t > cutoff).count() as u32;
        let oldest = self
            .events
            .iter()
            .find(|t| **t > cutoff)
            .copied()
            .unwrap_or(now);
        let remaining = limit.saturating_sub(used);
        let allowed = cost <= remaining;
        RateLimitResult {
            allowed,
            remaining,
            reset_at: oldest + window,
            retry_after: (!allowed).then(|| (oldest + window) - now),
        }
    }
}

/// Counter over a window that rolls over once its length has elapsed.
#[derive(Debug)]
pub(crate) struct FixedWindow {
    pub(crate) window_start: DateTime<Utc>,
    count: u32,
}

impl FixedWindow {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    pub(crate) fn consume(
        &mut self,
        limit: u32,
        window: Duration,
        cost: u32,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        // Roll over before evaluation.
        if now - self.window_start >= window {
            self.window_start = now;
            self.count = 0;
        }

        let reset_at = self.window_start + window;
        if self.count.saturating_add(cost) <= limit {
            self.count += cost;
            RateLimitResult {
                allowed: true,
                remaining: limit - self.count,
                reset_at,
                retry_after: None,
            }
        } else {
            RateLimitResult {
                allowed: false,
                remaining: limit.saturating_sub(self.count),
                reset_at,
                retry_after: Some(reset_at - now),
            }
        }
    }

    pub(crate) fn preview(
        &self,
        limit: u32,
        window: Duration,
        cost: u32,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        // Roll over virtually; a read must not mutate.
        let (start, count) = if now - self.window_start >= window {
            (now, 0)
        } else {
            (self.window_start, self.count)
        };
        let reset_at = start + window;
        let remaining = limit.saturating_sub(count);
        let allowed = count.saturating_add(cost) <= limit;
        RateLimitResult {
            allowed,
            remaining,
            reset_at,
            retry_after: (!allowed).then(|| reset_at - now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc::now()
    }

    fn one_minute() -> Duration {
        Duration::milliseconds(60_000)
    }

    #[test]
    fn sliding_admits_up_to_limit_then_rejects() {
        let now = t0();
        let mut state = SlidingWindow::new();

        for i in 0..5u32 {
            let result = state.consume(5, one_minute(), 1, now);
            assert!(result.allowed, "call {i} should be admitted");
            assert_eq!(result.remaining, 4 - i);
        }

        let rejected = state.consume(5, one_minute(), 1, now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.retry_after, Some(one_minute()));
    }

    #[test]
    fn sliding_readmits_after_the_window_passes() {
        let now = t0();
        let mut state = SlidingWindow::new();
        for _ in 0..5 {
            state.consume(5, one_minute(), 1, now);
        }
        assert!(!state.consume(5, one_minute(), 1, now).allowed);

        // Entries aged out exactly at the window boundary are discarded.
        let later = now + one_minute();
        let result = state.consume(5, one_minute(), 1, later);
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[test]
    fn sliding_rejects_oversized_cost_in_full() {
        let now = t0();
        let mut state = SlidingWindow::new();
        state.consume(5, one_minute(), 3, now);

        // cost 3 > remaining 2: nothing is admitted, nothing is consumed.
        let rejected = state.consume(5, one_minute(), 3, now);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 2);

        let partial = state.consume(5, one_minute(), 2, now);
        assert!(partial.allowed);
        assert_eq!(partial.remaining, 0);
    }

    #[test]
    fn sliding_preview_never_mutates() {
        let now = t0();
        let mut state = SlidingWindow::new();
        state.consume(5, one_minute(), 2, now);

        let first = state.preview(5, one_minute(), 1, now);
        let second = state.preview(5, one_minute(), 1, now);
        assert_eq!(first, second);
        assert_eq!(first.remaining, 3);
    }

    #[test]
    fn fixed_counts_within_one_window() {
        let now = t0();
        let mut state = FixedWindow::new(now);

        let result = state.consume(10, one_minute(), 4, now);
        assert!(result.allowed);
        assert_eq!(result.remaining, 6);
        assert_eq!(result.reset_at, now + one_minute());

        let rejected = state.consume(10, one_minute(), 7, now + Duration::milliseconds(10));
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 6);
        assert_eq!(
            rejected.retry_after,
            Some(one_minute() - Duration::milliseconds(10))
        );
    }

    #[test]
    fn fixed_rolls_over_with_full_quota() {
        let now = t0();
        let mut state = FixedWindow::new(now);
        state.consume(10, one_minute(), 10, now);
        assert!(!state.consume(10, one_minute(), 1, now).allowed);

        let later = now + one_minute();
        let result = state.consume(10, one_minute(), 1, later);
        assert!(result.allowed);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.reset_at, later + one_minute());
    }

    #[test]
    fn fixed_preview_rolls_over_virtually() {
        let now = t0();
        let mut state = FixedWindow::new(now);
        state.consume(10, one_minute(), 10, now);

        let later = now + one_minute();
        let preview = state.preview(10, one_minute(), 1, later);
        assert!(preview.allowed);
        assert_eq!(preview.remaining, 10);

        // The real window is untouched by the preview.
        assert_eq!(state.window_start, now);
    }

    #[test]
    fn idle_detection_tracks_accountable_activity() {
        let now = t0();

        let mut sliding = Window::new(RateLimitStrategy::Sliding, now);
        assert!(sliding.idle(one_minute(), now));
        sliding.consume(5, one_minute(), 1, now);
        assert!(!sliding.idle(one_minute(), now + Duration::milliseconds(59_999)));
        assert!(sliding.idle(one_minute(), now + one_minute()));

        let mut fixed = Window::new(RateLimitStrategy::Fixed, now);
        fixed.consume(5, one_minute(), 1, now);
        assert!(!fixed.idle(one_minute(), now + Duration::milliseconds(59_999)));
        assert!(fixed.idle(one_minute(), now + one_minute()));
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 1000,
                ..ProptestConfig::default()
            })]

            /// Property: total admitted cost inside one window never exceeds
            /// the limit, whatever the request pattern.
            #[test]
            fn sliding_never_admits_more_than_limit(
                limit in 1u32..50,
                costs in proptest::collection::vec(1u32..5, 1..40),
            ) {
                let now = Utc::now();
                let mut state = SlidingWindow::new();
                let mut admitted = 0u32;
                for cost in costs {
                    let result = state.consume(limit, one_minute(), cost, now);
                    if result.allowed {
                        admitted += cost;
                    }
                    prop_assert!(admitted <= limit);
                    prop_assert_eq!(result.remaining, limit - admitted);
                }
            }

            /// Property: remaining plus consumed always equals the limit
            /// within one fixed window.
            #[test]
            fn fixed_remaining_accounts_for_all_admissions(
                limit in 1u32..50,
                costs in proptest::collection::vec(1u32..5, 1..40),
            ) {
                let now = Utc::now();
                let mut state = FixedWindow::new(now);
                let mut admitted = 0u32;
                for cost in costs {
                    let result = state.consume(limit, one_minute(), cost, now);
                    if result.allowed {
                        admitted += cost;
                    }
                    prop_assert_eq!(result.remaining, limit - admitted);
                }
            }

            /// Property: a rejected check leaves the window exactly as a
            /// subsequent preview reports it.
            #[test]
            fn rejection_is_observation_only(
                limit in 1u32..10,
                cost in 1u32..20,
            ) {
                let now = Utc::now();
                let mut state = SlidingWindow::new();
                state.consume(limit, one_minute(), limit, now);

                let before = state.preview(limit, one_minute(), 1, now);
                let rejected = state.consume(limit, one_minute(), cost, now);
                let after = state.preview(limit, one_minute(), 1, now);

                prop_assert!(!rejected.allowed);
                prop_assert_eq!(before, after);
            }
        }
    }
}
