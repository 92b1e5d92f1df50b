//! Per-agent rate limiting.
//!
//! A sliding one-minute window gates `event.append` and session `validate`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window rate limiter keyed by agent id.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum operations per minute per agent.
    limit: u32,
    timestamps: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit: limit_per_minute,
            timestamps: HashMap::new(),
        }
    }

    /// Record one operation for `agent_id`; returns `false` when the agent
    /// is over its limit.
    #[must_use]
    pub fn check(&mut self, agent_id: &str) -> bool {
        let now = Instant::now();
        let window_start = now.checked_sub(WINDOW).unwrap_or(now);

        let timestamps = self
            .timestamps
            .entry(agent_id.to_string())
            .or_default();
        timestamps.retain(|t| *t > window_start);

        if timestamps.len() < self.limit as usize {
            timestamps.push(now);
            true
        } else {
            false
        }
    }

    /// Drop tracking for agents with no activity inside the window.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window_start = now.checked_sub(WINDOW).unwrap_or(now);
        self.timestamps
            .retain(|_, stamps| stamps.iter().any(|t| *t > window_start));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_limit() {
        let mut limiter = RateLimiter::new(10);
        for _ in 0..10 {
            assert!(limiter.check("alice"));
        }
    }

    #[test]
    fn denies_over_limit() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(!limiter.check("alice"));
    }

    #[test]
    fn agents_are_independent() {
        let mut limiter = RateLimiter::new(1);
        assert!(limiter.check("alice"));
        assert!(limiter.check("bob"));
        assert!(!limiter.check("alice"));
    }

    #[test]
    fn prune_keeps_active_agents() {
        let mut limiter = RateLimiter::new(5);
        assert!(limiter.check("alice"));
        limiter.prune();
        assert_eq!(limiter.timestamps.len(), 1);
    }
}
