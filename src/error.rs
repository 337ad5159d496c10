//! Error taxonomy for the pipeline engine.
//!
//! Every fallible operation in `conduit` ultimately produces a [`ConduitError`].
//! The variants mirror the kinds described by the engine's design: build-time
//! validation failures, cooperative cancellation, timeouts, user-body
//! failures, resilience-layer rejections, pipe mechanics faults, and failures
//! reported by external collaborators (concrete sources/sinks).

use std::fmt;
use std::time::Duration;

use crate::core::graph::GraphError;

/// The outcome of a single node body invocation, or of the pipeline as a
/// whole when it can't proceed.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ConduitError {
    /// A graph invariant was violated. Raised at build time; never retried.
    #[error("validation error: {0}")]
    Validation(#[from] GraphError),

    /// Cooperative abort via the run's cancellation signal. Not retried,
    /// propagated verbatim.
    #[error("cancelled")]
    Cancelled,

    /// A per-attempt deadline was exceeded. Retriable by default.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A node body raised while processing an item. Wraps the user error.
    #[error("transform failed: {cause}")]
    TransformFailure {
        /// Display-formatted cause, kept owned so the error stays `Clone`.
        cause: String,
    },

    /// Rejected by a circuit breaker. Terminal for the current item; not
    /// retried (retrying while Open would be pointless).
    #[error("circuit open")]
    CircuitOpen,

    /// Retries ran out, or the overall retry timeout was hit. Terminal.
    #[error("retry budget exhausted after {attempts} attempt(s): {last_error}")]
    RetryBudgetExhausted {
        attempts: u32,
        last_error: Box<ConduitError>,
    },

    /// Pipe mechanics: a dropped item under a non-wait backpressure policy,
    /// merge lateness exceeded, or a producer/consumer contract violation
    /// (e.g. publishing after completion, or subscribing twice to a
    /// single-consumer pipe).
    #[error("dataflow fault: {0}")]
    DataflowFault(String),

    /// Failure reported by a source or sink's external collaborator.
    /// Retriable per policy.
    #[error("external fault: {0}")]
    ExternalFault(String),
}

impl ConduitError {
    /// The default retriable predicate used when a [`crate::resilience::retry::RetryPolicy`]
    /// does not override `should_retry`: every kind is retried except
    /// [`ConduitError::Cancelled`] and [`ConduitError::Validation`].
    pub fn is_retriable_by_default(&self) -> bool {
        !matches!(self, ConduitError::Cancelled | ConduitError::Validation(_))
    }

    /// Builds a [`ConduitError::TransformFailure`] from any displayable cause.
    pub fn transform_failure(cause: impl fmt::Display) -> Self {
        ConduitError::TransformFailure {
            cause: cause.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate for fallible operations whose
/// error kind is the engine's own taxonomy.
pub type ConduitResult<T> = Result<T, ConduitError>;
