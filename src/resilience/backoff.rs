//! Deterministic part of the inter-attempt delay. Jitter (see
//! [`crate::resilience::jitter`]) is layered on top of whatever this
//! produces.

use std::time::Duration;

/// The delay schedule for attempt `n` (0-indexed, the attempt that just
/// failed). `Custom` is boxed in an `Arc` so `Backoff` stays `Clone`.
#[derive(Clone)]
pub enum Backoff {
    /// Always the same delay.
    Fixed(Duration),
    /// `d0 + n * step`, capped at `cap`.
    Linear {
        base: Duration,
        step: Duration,
        cap: Duration,
    },
    /// `d0 * mult.powi(n)`, capped at `cap`.
    Exponential {
        base: Duration,
        multiplier: f64,
        cap: Duration,
    },
    /// Caller-supplied function of the attempt index.
    Custom(std::sync::Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    pub fn fixed(d: Duration) -> Self {
        Backoff::Fixed(d)
    }

    pub fn linear(base: Duration, step: Duration, cap: Duration) -> Self {
        Backoff::Linear { base, step, cap }
    }

    pub fn exponential(base: Duration, multiplier: f64, cap: Duration) -> Self {
        Backoff::Exponential {
            base,
            multiplier,
            cap,
        }
    }

    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Backoff::Custom(std::sync::Arc::new(f))
    }

    /// The base delay for attempt `n`, before jitter is applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Linear { base, step, cap } => {
                let scaled = step.saturating_mul(attempt);
                (*base + scaled).min(*cap)
            }
            Backoff::Exponential {
                base,
                multiplier,
                cap,
            } => {
                let factor = multiplier.powi(attempt as i32);
                let scaled = base.as_secs_f64() * factor;
                Duration::from_secs_f64(scaled.max(0.0)).min(*cap)
            }
            Backoff::Custom(f) => f(attempt),
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backoff::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Backoff::Linear { base, step, cap } => f
                .debug_struct("Linear")
                .field("base", base)
                .field("step", step)
                .field("cap", cap)
                .finish(),
            Backoff::Exponential {
                base,
                multiplier,
                cap,
            } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("multiplier", multiplier)
                .field("cap", cap)
                .finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_constant() {
        let b = Backoff::fixed(Duration::from_millis(50));
        assert_eq!(b.delay(0), Duration::from_millis(50));
        assert_eq!(b.delay(9), Duration::from_millis(50));
    }

    #[test]
    fn linear_caps() {
        let b = Backoff::linear(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(25),
        );
        assert_eq!(b.delay(0), Duration::from_millis(10));
        assert_eq!(b.delay(1), Duration::from_millis(20));
        assert_eq!(b.delay(2), Duration::from_millis(25));
    }

    #[test]
    fn exponential_caps() {
        let b = Backoff::exponential(Duration::from_millis(10), 2.0, Duration::from_millis(35));
        assert_eq!(b.delay(0), Duration::from_millis(10));
        assert_eq!(b.delay(1), Duration::from_millis(20));
        assert_eq!(b.delay(2), Duration::from_millis(35));
    }
}
