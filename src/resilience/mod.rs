//! Retry/backoff/jitter, circuit breaking, and dead-letter routing — the
//! primitives the Resilient execution strategy composes (see
//! [`crate::strategy::resilient`]), also usable standalone by a source or
//! sink body that wants the same machinery outside a strategy loop.

pub mod backoff;
pub mod breaker;
pub mod deadletter;
pub mod jitter;
pub mod retry;

pub use backoff::Backoff;
pub use breaker::{BreakerStateKind, CircuitBreaker, CircuitBreakerConfig};
pub use deadletter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink};
pub use jitter::Jitter;
pub use retry::RetryPolicy;
