//! Circuit breaker guarding the expert escalation path.
//!
//! Opens when the failure rate over a sliding window crosses a threshold.
//! While open, escalations fail closed. After a cooldown the circuit probes
//! half-open and closes again on consecutive successes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration for the escalation circuit.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure rate in [0, 1] that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Minimum samples in the window before the rate is meaningful.
    pub min_samples: usize,
    /// Sliding window length.
    pub window: Duration,
    /// Cooldown while open before probing half-open.
    pub open_cooldown: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            min_samples: 5,
            window: Duration::from_secs(60),
            open_cooldown: Duration::from_secs(10),
            success_threshold: 1,
        }
    }
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { successes: u32 },
}

/// Public-facing circuit state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of the circuit for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub state: CircuitStateKind,
    pub window_samples: usize,
    pub window_failures: usize,
    pub cooldown_remaining_ms: Option<u64>,
}

/// Error-rate circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    outcomes: VecDeque<(Instant, bool)>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            outcomes: VecDeque::new(),
        }
    }

    /// Whether an escalation may proceed. An open circuit past its cooldown
    /// transitions to half-open and allows one probe.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_cooldown {
                    self.state = CircuitState::HalfOpen { successes: 0 };
                    info!("escalation circuit half-open after cooldown");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Milliseconds until the open circuit probes again.
    #[must_use]
    pub fn retry_after_ms(&self) -> u64 {
        match self.state {
            CircuitState::Open { opened_at } => self
                .config
                .open_cooldown
                .checked_sub(opened_at.elapsed())
                .map_or(0, |d| d.as_millis() as u64),
            _ => 0,
        }
    }

    /// Record a successful escalation.
    pub fn record_success(&mut self) {
        self.push_outcome(true);
        if let CircuitState::HalfOpen { successes } = self.state {
            let successes = successes + 1;
            if successes >= self.config.success_threshold {
                self.state = CircuitState::Closed;
                self.outcomes.clear();
                info!("escalation circuit closed after successful probe");
            } else {
                self.state = CircuitState::HalfOpen { successes };
            }
        }
    }

    /// Record a failed escalation.
    pub fn record_failure(&mut self) {
        self.push_outcome(false);
        match self.state {
            CircuitState::Closed => {
                let (samples, failures) = self.window_counts_ref();
                if samples >= self.config.min_samples {
                    let rate = failures as f64 / samples as f64;
                    if rate >= self.config.failure_rate_threshold {
                        self.state = CircuitState::Open {
                            opened_at: Instant::now(),
                        };
                        warn!(
                            samples,
                            failures, "escalation circuit opened on failure rate"
                        );
                    }
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                warn!("escalation circuit re-opened after half-open failure");
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Status snapshot for reporting.
    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        let (samples, failures) = self.window_counts_ref();
        let (state, cooldown_remaining_ms) = match self.state {
            CircuitState::Closed => (CircuitStateKind::Closed, None),
            CircuitState::Open { opened_at } => (
                CircuitStateKind::Open,
                Some(
                    self.config
                        .open_cooldown
                        .checked_sub(opened_at.elapsed())
                        .map_or(0, |d| d.as_millis() as u64),
                ),
            ),
            CircuitState::HalfOpen { .. } => (CircuitStateKind::HalfOpen, None),
        };
        CircuitStatus {
            state,
            window_samples: samples,
            window_failures: failures,
            cooldown_remaining_ms,
        }
    }

    fn push_outcome(&mut self, success: bool) {
        let now = Instant::now();
        self.outcomes.push_back((now, success));
        let horizon = now.checked_sub(self.config.window).unwrap_or(now);
        while self
            .outcomes
            .front()
            .is_some_and(|(at, _)| *at < horizon)
        {
            self.outcomes.pop_front();
        }
    }

    fn window_counts_ref(&self) -> (usize, usize) {
        let samples = self.outcomes.len();
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        (samples, failures)
    }
}
