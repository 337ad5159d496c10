//! The Scheduler/Runner: turns a [`CompiledGraph`] into running driver
//! tasks and aggregates their outcome.
//!
//! One task per node, started in reverse-topological order as a scheduling
//! optimisation only (consumers block on `subscribe` until their producer
//! publishes, so start order never affects correctness), a shared
//! cancellation signal, and a per-node outcome list rather than one
//! aggregate error.

use std::sync::Arc;

use crate::core::builder::CompiledGraph;
use crate::core::context::Context;
use crate::core::graph::NodeId;
use crate::core::wiring::PipeRegistry;
use crate::error::ConduitResult;

/// The result of one node's driver task.
pub struct NodeOutcome {
    pub node_id: NodeId,
    pub result: ConduitResult<()>,
}

/// The aggregated result of a run: success iff every driver completed
/// normally, otherwise the full list of per-node outcomes so callers can
/// see exactly which nodes failed and why.
pub struct RunOutcome {
    pub nodes: Vec<NodeOutcome>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.nodes.iter().filter(|n| n.result.is_err())
    }
}

/// Runs `compiled` to completion under `ctx`, returning once every node's
/// driver task has terminated. Does not cancel sibling nodes when one
/// fails — callers that want fail-fast semantics should call
/// `ctx.cancel()` from their own outcome inspection, or hold onto
/// `ctx.cancellation()` and cancel it from another task racing this one.
pub async fn run(compiled: CompiledGraph, ctx: Context) -> RunOutcome {
    let registry = Arc::new(PipeRegistry::new(compiled.graph.node_ids().cloned()));

    // Reverse-topological order only shortens the window a consumer spends
    // waiting on `PipeRegistry::subscribe`; correctness does not depend on
    // it, since every subscribe blocks until its producer publishes.
    let order = compiled.graph.reverse_topological_order();
    let mut nodes = compiled.nodes;

    let run_span = ctx.span().clone();
    tracing::info!(parent: &run_span, node_count = order.len(), "starting run");

    let mut handles = Vec::with_capacity(order.len());
    for id in order {
        let Some(node) = nodes.remove(&id) else {
            continue;
        };
        let registry = Arc::clone(&registry);
        let ctx = ctx.clone();
        let node_id = id.clone();
        handles.push(tokio::spawn(async move {
            let result = node.run(&registry, &ctx).await;
            NodeOutcome { node_id, result }
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(join_error) => {
                tracing::error!(%join_error, "node driver task panicked");
            }
        }
    }

    let outcome = RunOutcome { nodes: outcomes };
    if outcome.is_success() {
        tracing::info!(parent: &run_span, "run completed");
    } else {
        let failed: Vec<&str> = outcome.failures().map(|n| n.node_id.as_str()).collect();
        tracing::warn!(parent: &run_span, ?failed, "run finished with failures");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::GraphBuilder;
    use crate::core::context::Parameters;
    use crate::core::node::{ItemTransform, Sink, Source, Transform};
    use crate::core::pipe::{self, PipeConfig, PipeConsumer, PipeSignal, Terminal};
    use crate::error::{ConduitError, ConduitResult};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::CancellationToken;

    struct Counting(Vec<i32>);

    #[async_trait]
    impl Source<i32> for Counting {
        async fn initialize(&mut self, _ctx: &Context) -> ConduitResult<crate::core::pipe::Pipe<i32>> {
            let (tx, pipe) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
            let values = self.0.clone();
            tokio::spawn(async move {
                for v in values {
                    tx.publish(v).await.unwrap();
                }
                tx.complete();
            });
            Ok(pipe)
        }
    }

    struct FailingTransform;

    #[async_trait]
    impl ItemTransform<i32, i32> for FailingTransform {
        async fn transform(&self, _item: i32, _ctx: &Context) -> ConduitResult<Option<i32>> {
            Err(ConduitError::transform_failure("always fails"))
        }
    }

    struct Collect(Arc<StdMutex<Vec<i32>>>);

    #[async_trait]
    impl Sink<i32> for Collect {
        async fn execute(&mut self, mut input: PipeConsumer<i32>, _ctx: &Context) -> ConduitResult<()> {
            let cancel = CancellationToken::new();
            loop {
                match input.next(&cancel).await {
                    PipeSignal::Item(i) => self.0.lock().unwrap().push(i),
                    PipeSignal::End(Terminal::Completed) => return Ok(()),
                    PipeSignal::End(Terminal::Faulted(e)) => return Err(e),
                    PipeSignal::End(Terminal::Cancelled) => return Err(ConduitError::Cancelled),
                }
            }
        }
    }

    struct Double;

    #[async_trait]
    impl ItemTransform<i32, i32> for Double {
        async fn transform(&self, item: i32, _ctx: &Context) -> ConduitResult<Option<i32>> {
            Ok(Some(item * 2))
        }
    }

    #[tokio::test]
    async fn a_linear_pipeline_reports_success() {
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let mut builder = GraphBuilder::new();
        builder
            .add_source("src", Counting(vec![1, 2, 3]))
            .add_transform("double", Transform::Item(Box::new(Double)))
            .add_sink("sink", Collect(Arc::clone(&collected)))
            .connect("src", "double")
            .connect("double", "sink");

        let compiled = builder.build().expect("valid graph");
        let outcome = run(compiled, Context::new(Parameters::new())).await;

        assert!(outcome.is_success());
        assert_eq!(*collected.lock().unwrap(), vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn a_failing_transform_is_reported_without_panicking_the_run() {
        let mut builder = GraphBuilder::new();
        builder
            .add_source("src", Counting(vec![1]))
            .add_transform("boom", Transform::Item(Box::new(FailingTransform)))
            .add_sink("sink", Collect(Arc::new(StdMutex::new(Vec::new()))))
            .connect("src", "boom")
            .connect("boom", "sink");

        let compiled = builder.build().expect("valid graph");
        let outcome = run(compiled, Context::new(Parameters::new())).await;

        assert!(!outcome.is_success());
        let failed: Vec<&str> = outcome.failures().map(|n| n.node_id.as_str()).collect();
        assert!(failed.contains(&"boom"));
    }
}
