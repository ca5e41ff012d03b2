//! Sliding-window rate limiter with cost attribution.
//!
//! Per-user request windows with lazy pruning. Costs accrue in cents
//! against a hard budget; exceeding it sets a sticky flag that clears only
//! when the window rolls over and total spend drops back under the limit.

use dashmap::DashMap;
use std::time::Duration;

use crate::types::{now_ms, RerankError};

#[derive(Debug, Default)]
struct UserWindow {
    /// `(timestamp_ms, cost_cents)` pairs inside the window.
    entries: Vec<(i64, u64)>,
    budget_exceeded: bool,
}

impl UserWindow {
    fn prune(&mut self, cutoff: i64) {
        self.entries.retain(|(at, _)| *at > cutoff);
    }

    fn total_cents(&self) -> u64 {
        self.entries.iter().map(|(_, cost)| cost).sum()
    }

    fn reset_at(&self, window_ms: i64, now: i64) -> i64 {
        self.entries
            .first()
            .map(|(at, _)| at + window_ms)
            .unwrap_or(now + window_ms)
    }
}

pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: u32,
    budget_cents: u64,
    users: DashMap<String, UserWindow>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: u32, budget_cents: u64) -> Self {
        Self {
            window,
            max_requests,
            budget_cents,
            users: DashMap::new(),
        }
    }

    /// Admit the request and record its cost, or reject with a structured
    /// reason and the window's reset time.
    pub fn check_and_record(&self, user_id: &str, cost_cents: u64) -> Result<(), RerankError> {
        let now = now_ms();
        let window_ms = self.window.as_millis() as i64;
        let mut window = self.users.entry(user_id.to_string()).or_default();
        window.prune(now - window_ms);

        if window.budget_exceeded {
            // Sticky flag clears on roll-over once spend drops below the
            // budget again.
            if window.total_cents() < self.budget_cents {
                window.budget_exceeded = false;
            } else {
                return Err(RerankError::RateLimited {
                    user_id: user_id.to_string(),
                    reason: format!(
                        "Cost budget exceeded: {} cents spent of {} allowed",
                        window.total_cents(),
                        self.budget_cents
                    ),
                    reset_at: window.reset_at(window_ms, now),
                });
            }
        }

        if window.entries.len() >= self.max_requests as usize {
            return Err(RerankError::RateLimited {
                user_id: user_id.to_string(),
                reason: format!(
                    "Rate limit exceeded: {} requests per {}s window",
                    self.max_requests,
                    self.window.as_secs()
                ),
                reset_at: window.reset_at(window_ms, now),
            });
        }

        if window.total_cents() + cost_cents > self.budget_cents {
            // The attempt's cost is attributed; the flag clears only after
            // enough of the window expires.
            window.entries.push((now, cost_cents));
            window.budget_exceeded = true;
            return Err(RerankError::RateLimited {
                user_id: user_id.to_string(),
                reason: format!(
                    "Cost budget exceeded: request would pass {} cents",
                    self.budget_cents
                ),
                reset_at: window.reset_at(window_ms, now),
            });
        }

        window.entries.push((now, cost_cents));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_request_cap() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(3600), 3, 10_000);
        for _ in 0..3 {
            limiter.check_and_record("u1", 1).unwrap();
        }
        let err = limiter.check_and_record("u1", 1).unwrap_err();
        match err {
            RerankError::RateLimited {
                reason, reset_at, ..
            } => {
                assert!(reason.contains("Rate limit exceeded"));
                assert!(reset_at > now_ms());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn users_are_isolated() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(3600), 1, 10_000);
        limiter.check_and_record("u1", 1).unwrap();
        limiter.check_and_record("u2", 1).unwrap();
        assert!(limiter.check_and_record("u1", 1).is_err());
    }

    #[test]
    fn budget_flag_is_sticky() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(3600), 100, 10);
        limiter.check_and_record("u1", 8).unwrap();
        // Passing the budget sets the sticky flag.
        assert!(limiter.check_and_record("u1", 5).is_err());
        // Still rejected even though this request alone would fit.
        let err = limiter.check_and_record("u1", 1).unwrap_err();
        assert!(matches!(err, RerankError::RateLimited { .. }));
    }

    #[test]
    fn window_rollover_clears_state() {
        let limiter = SlidingWindowLimiter::new(Duration::from_millis(1), 1, 10_000);
        limiter.check_and_record("u1", 1).unwrap();
        assert!(limiter.check_and_record("u1", 1).is_err());
        std::thread::sleep(Duration::from_millis(5));
        limiter.check_and_record("u1", 1).unwrap();
    }
}
