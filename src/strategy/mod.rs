//! How a node's driver consumes its input and invokes its body.
//!
//! The core ships five: [`sequential`], [`parallel`], [`batching`],
//! [`unbatching`], and [`resilient`] (which wraps sequential or parallel
//! with retry/breaker/timeout/DLQ). [`ExecutionStrategy`] is the build-time
//! *tag* a node or a [`crate::core::builder::GraphBuilder::with_strategy`]
//! call picks; the runner resolves a tag into a concrete [`Strategy`]
//! instance, reading its tunables out of the node's layered
//! [`crate::core::context::Parameters`] (see [`crate::params`]).

pub mod batching;
pub mod parallel;
pub mod resilient;
pub mod sequential;
pub mod unbatching;

pub use batching::BatchTransform;
pub use parallel::ParallelStrategy;
pub use resilient::ResilientStrategy;
pub use sequential::SequentialStrategy;
pub use unbatching::UnbatchTransform;

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::context::Context;
use crate::core::node::ItemTransform;
use crate::core::pipe::{PipeConsumer, PipeProducer};
use crate::error::ConduitResult;

/// The execution-strategy family a node runs under. A build-time tag, not
/// a configuration object — tunables live in `Parameters` (see
/// [`crate::params`]) and are read when the tag is resolved into a
/// concrete [`Strategy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// One item at a time, output in input order. Default for item-transforms.
    Sequential,
    /// Up to `parallel.degree` items in flight concurrently.
    Parallel,
    /// Stream-transform helper: groups items into batches.
    Batching,
    /// Stream-transform helper: unpacks batches back into items.
    Unbatching,
    /// Wraps another item-transform strategy with retry, circuit breaking,
    /// per-attempt timeout, and dead-letter routing.
    Resilient(Box<ExecutionStrategy>),
}

impl ExecutionStrategy {
    /// The default applied when neither a node nor a builder override
    /// states a preference.
    pub fn default_for_item_transform() -> Self {
        ExecutionStrategy::Sequential
    }
}

/// The Strategy SPI (see the engine's external interfaces): one method,
/// `drive`, that owns the loop pulling from `input`, invoking `body`,
/// pushing to `output`, and propagating completion/fault.
///
/// Implementations must: respect cancellation at every suspension point;
/// propagate producer completion to output completion; follow their
/// configured failure policy; leave node disposal to the caller (the
/// runner calls `body.dispose` once `drive` returns).
#[async_trait]
pub trait Strategy<In, Out>: Send + Sync
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    async fn drive(
        &self,
        input: PipeConsumer<In>,
        output: PipeProducer<Out>,
        body: Arc<dyn ItemTransform<In, Out>>,
        ctx: Context,
    ) -> ConduitResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_is_sequential() {
        assert_eq!(
            ExecutionStrategy::default_for_item_transform(),
            ExecutionStrategy::Sequential
        );
    }
}
