//! Randomised component layered on top of a [`crate::resilience::backoff::Backoff`]
//! delay.

use std::time::Duration;

use rand::Rng;

/// How much randomness to mix into the backoff-computed delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Use the backoff delay verbatim.
    #[default]
    None,
    /// Uniform in `[0, d]`.
    Full,
    /// Uniform in `[d/2, d]`.
    Equal,
    /// Uniform in `[base, min(previous * 3, cap)]`, per the decorrelated
    /// jitter algorithm (AWS architecture blog's "Exponential Backoff And
    /// Jitter"). Needs the previous attempt's delay, which the retry loop
    /// threads through.
    Decorrelated { cap: Duration },
}

impl Jitter {
    /// Applies this jitter kind to `base` (this attempt's backoff delay).
    /// `previous` is the delay actually used for the prior attempt (zero
    /// for the first); only `Decorrelated` reads it.
    pub fn apply(&self, base: Duration, previous: Duration) -> Duration {
        let mut rng = rand::rng();
        match self {
            Jitter::None => base,
            Jitter::Full => {
                let upper = base.as_secs_f64();
                Duration::from_secs_f64(rng.random_range(0.0..=upper.max(0.0)))
            }
            Jitter::Equal => {
                let half = base.as_secs_f64() / 2.0;
                Duration::from_secs_f64(half + rng.random_range(0.0..=half.max(0.0)))
            }
            Jitter::Decorrelated { cap } => {
                let lower = base.as_secs_f64();
                let upper = (previous.as_secs_f64() * 3.0).min(cap.as_secs_f64()).max(lower);
                Duration::from_secs_f64(rng.random_range(lower..=upper))
            }
        }
    }
}
