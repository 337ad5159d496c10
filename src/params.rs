//! Well-known [`crate::core::context::Parameters`] keys read by the built-in
//! execution strategies and the resilience layer, plus the small
//! TOML/JSON-friendly DTOs used to express `Backoff`/`Jitter` choices as
//! parameter values.
//!
//! Precedence, per the engine's design: a per-node parameter override wins
//! over the run's context defaults, which win over the built-in defaults
//! coded into each strategy's constructor.

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::{Backoff, Jitter};

pub const RETRY_MAX_ATTEMPTS: &str = "retry.max_attempts";
pub const RETRY_BACKOFF: &str = "retry.backoff";
pub const RETRY_JITTER: &str = "retry.jitter";
pub const RETRY_OVERALL_TIMEOUT_MS: &str = "retry.overall_timeout_ms";
pub const RETRY_PER_ATTEMPT_TIMEOUT_MS: &str = "retry.per_attempt_timeout_ms";

pub const BREAKER_FAILURE_THRESHOLD: &str = "breaker.failure_threshold";
pub const BREAKER_OPEN_DURATION_MS: &str = "breaker.open_duration_ms";
pub const BREAKER_PROBE_COUNT: &str = "breaker.probe_count";
pub const BREAKER_ENABLED: &str = "breaker.enabled";

pub const PARALLEL_DEGREE: &str = "parallel.degree";
pub const PARALLEL_PRESERVE_ORDER: &str = "parallel.preserve_order";
pub const PARALLEL_BUFFER: &str = "parallel.buffer";

pub const BATCH_SIZE: &str = "batch.size";
pub const BATCH_TIMEOUT_MS: &str = "batch.timeout_ms";

pub const DLQ_MAX_MATERIALIZED_ITEMS: &str = "dlq.max_materialized_items";

/// Deserialisable mirror of [`Backoff`], the shape a TOML/JSON parameter
/// value takes under the `retry.backoff` key, e.g.
/// `{ kind = "exponential", base_ms = 100, multiplier = 2.0, cap_ms = 5000 }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum BackoffConfig {
    Fixed {
        delay_ms: u64,
    },
    Linear {
        base_ms: u64,
        step_ms: u64,
        cap_ms: u64,
    },
    Exponential {
        base_ms: u64,
        multiplier: f64,
        cap_ms: u64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            base_ms: 100,
            multiplier: 2.0,
            cap_ms: 5_000,
        }
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(cfg: BackoffConfig) -> Self {
        match cfg {
            BackoffConfig::Fixed { delay_ms } => Backoff::fixed(Duration::from_millis(delay_ms)),
            BackoffConfig::Linear {
                base_ms,
                step_ms,
                cap_ms,
            } => Backoff::linear(
                Duration::from_millis(base_ms),
                Duration::from_millis(step_ms),
                Duration::from_millis(cap_ms),
            ),
            BackoffConfig::Exponential {
                base_ms,
                multiplier,
                cap_ms,
            } => Backoff::exponential(
                Duration::from_millis(base_ms),
                multiplier,
                Duration::from_millis(cap_ms),
            ),
        }
    }
}

/// Deserialisable mirror of [`Jitter`], the shape a TOML/JSON parameter
/// value takes under the `retry.jitter` key.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum JitterConfig {
    #[default]
    None,
    Full,
    Equal,
    Decorrelated {
        cap_ms: u64,
    },
}

impl From<JitterConfig> for Jitter {
    fn from(cfg: JitterConfig) -> Self {
        match cfg {
            JitterConfig::None => Jitter::None,
            JitterConfig::Full => Jitter::Full,
            JitterConfig::Equal => Jitter::Equal,
            JitterConfig::Decorrelated { cap_ms } => Jitter::Decorrelated {
                cap: Duration::from_millis(cap_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_config_round_trips_from_json() {
        let value = serde_json::json!({"kind": "linear", "base_ms": 10, "step_ms": 5, "cap_ms": 100});
        let cfg: BackoffConfig = serde_json::from_value(value).unwrap();
        let backoff: Backoff = cfg.into();
        assert_eq!(backoff.delay(0), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
    }

    #[test]
    fn jitter_config_defaults_to_none() {
        let cfg = JitterConfig::default();
        assert!(matches!(cfg, JitterConfig::None));
    }
}
