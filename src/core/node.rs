//! The three node contracts: `Source`, `Transform`, `Sink`.
//!
//! Split into three kind-specific contracts instead of one polymorphic
//! `process(inputs, output)` method — each node kind has a distinct shape
//! (zero inputs / one of each / zero outputs) that doesn't survive being
//! flattened into a single signature.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::context::Context;
use crate::core::pipe::{Pipe, PipeConsumer};
use crate::error::ConduitResult;
use crate::strategy::ExecutionStrategy;

/// A node that produces items and has no input. `initialize` must return
/// promptly — the pipe it returns is a lazy sequence, with items produced
/// only as downstream pulls create room in the pipe's buffer.
#[async_trait]
pub trait Source<Out: Clone + Send + 'static>: Send + Sync {
    async fn initialize(&mut self, ctx: &Context) -> ConduitResult<Pipe<Out>>;

    /// Invoked after the driver's loop exits for any reason.
    async fn dispose(&mut self) {}
}

/// A node that transforms one input item into zero-or-one output items.
/// This is the common case driven by the Sequential/Parallel/Resilient
/// strategies.
///
/// Takes `&self` rather than `&mut self`: the Parallel strategy invokes it
/// concurrently from several tasks sharing one `Arc<dyn ItemTransform>`.
/// Implementations that need per-item mutable state reach for interior
/// mutability (`Mutex`, `AtomicXxx`).
#[async_trait]
pub trait ItemTransform<In, Out>: Send + Sync {
    /// Transforms a single item. Returning `Ok(None)` drops the item
    /// (a filter); returning `Err` reports a `TransformFailure` to the
    /// active execution strategy for retry/DLQ handling.
    async fn transform(&self, item: In, ctx: &Context) -> ConduitResult<Option<Out>>;

    /// The strategy hint this node prefers when none is set explicitly at
    /// build time. Defaults to `None`, meaning the graph builder's default
    /// (Sequential) applies.
    fn preferred_strategy(&self) -> Option<ExecutionStrategy> {
        None
    }

    /// Invoked once after the owning strategy's drive loop exits, for any
    /// reason (completion, fault, or cancellation).
    async fn dispose(&self, _ctx: &Context) {}
}

/// A node whose cardinality changes: it consumes a whole input pipe and
/// produces a whole output pipe, rather than one item at a time. Used for
/// batch/unbatch/join-style transforms. Stream-transforms are expected to
/// provide their own resilience if they need it — the Resilient strategy
/// only wraps item-transforms.
#[async_trait]
pub trait StreamTransform<In: Clone + Send + 'static, Out: Clone + Send + 'static>: Send + Sync {
    async fn drive(
        &mut self,
        input: PipeConsumer<In>,
        ctx: &Context,
        cancel: &CancellationToken,
    ) -> ConduitResult<Pipe<Out>>;

    /// Invoked once the returned pipe has reached a terminal state.
    async fn dispose(&mut self) {}
}

/// Either flavour of transform a node may declare. The scheduler picks the
/// matching driver based on which variant a node's factory produces.
pub enum Transform<In, Out>
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    Item(Box<dyn ItemTransform<In, Out>>),
    Stream(Box<dyn StreamTransform<In, Out>>),
}

/// A node that consumes items to exhaustion and produces no output.
#[async_trait]
pub trait Sink<In: Clone + Send + 'static>: Send + Sync {
    /// Consumes `input` until it terminates. Returns only once the pipe
    /// has reached a terminal state.
    async fn execute(&mut self, input: PipeConsumer<In>, ctx: &Context) -> ConduitResult<()>;

    async fn dispose(&mut self) {}
}
