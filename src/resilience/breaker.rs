//! Per-node `Closed -> Open -> Half-Open -> Closed|Open` circuit breaker.
//!
//! Guarded by a plain [`std::sync::Mutex`]: every critical section here is
//! a handful of comparisons and never spans an `.await`, so there is no
//! need for the async-aware lock the pipe internals use.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::core::context::Parameters;
use crate::params;

/// Tunables for one [`CircuitBreaker`] instance. One instance guards one
/// node; it is not shared across nodes.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub probe_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            probe_count: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Builds a config from a node's layered `Parameters`. Returns `None`
    /// when `breaker.enabled` is explicitly set to `false` — the Resilient
    /// strategy then skips breaker accounting entirely for that node.
    pub fn from_parameters(parameters: &Parameters) -> Option<Self> {
        if !parameters.get_or(params::BREAKER_ENABLED, true) {
            return None;
        }
        let defaults = Self::default();
        Some(Self {
            failure_threshold: parameters
                .get_or(params::BREAKER_FAILURE_THRESHOLD, defaults.failure_threshold),
            open_duration: parameters
                .get_raw(params::BREAKER_OPEN_DURATION_MS)
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis)
                .unwrap_or(defaults.open_duration),
            probe_count: parameters.get_or(params::BREAKER_PROBE_COUNT, defaults.probe_count),
        })
    }
}

/// The coarse state a breaker is observed in, exposed for reporting
/// (`Outcome`'s breaker-trip counters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

enum State {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { admitted: u32, successes: u32 },
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
            trips: AtomicU64::new(0),
        }
    }

    /// Total number of `Closed -> Open` or `Half-Open -> Open` transitions
    /// observed so far.
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Whether a call is admitted right now. Transitions `Open -> Half-Open`
    /// as a side effect once `open_duration` has elapsed. Callers that get
    /// `false` must treat the call as rejected with `CircuitOpen` without
    /// invoking the body.
    pub fn admit(&self) -> bool {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &mut *state {
            State::Closed { .. } => true,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_duration {
                    *state = State::HalfOpen {
                        admitted: 1,
                        successes: 0,
                    };
                    tracing::info!("circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            State::HalfOpen { admitted, .. } => {
                if *admitted < self.config.probe_count {
                    *admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures = 0;
            }
            State::HalfOpen { successes, .. } => {
                *successes += 1;
                if *successes >= self.config.probe_count {
                    *state = State::Closed {
                        consecutive_failures: 0,
                    };
                    tracing::info!("circuit closed after successful probes");
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match &mut *state {
            State::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    *state = State::Open {
                        opened_at: Instant::now(),
                    };
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(consecutive_failures = *consecutive_failures, "circuit opened");
                }
            }
            State::HalfOpen { .. } => {
                *state = State::Open {
                    opened_at: Instant::now(),
                };
                self.trips.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("probe failed, circuit re-opened");
            }
            State::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerStateKind {
        match &*self.state.lock().expect("breaker mutex poisoned") {
            State::Closed { .. } => BreakerStateKind::Closed,
            State::Open { .. } => BreakerStateKind::Open,
            State::HalfOpen { .. } => BreakerStateKind::HalfOpen,
        }
    }
}
