//! End-to-end scenarios 3 and 4: a resilient transform that fails twice
//! then succeeds, and one that always fails and is routed to a
//! dead-letter sink.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conduit::resilience::InMemoryDeadLetterSink;
use conduit::strategy::ExecutionStrategy;
use conduit::{
    Context, ConduitResult, GraphBuilder, ItemTransform, Parameters, Pipe, PipeConfig,
    PipeConsumer, PipeSignal, Sink, Source, Terminal, Transform,
};

struct Numbers(Vec<i32>);

#[async_trait]
impl Source<i32> for Numbers {
    async fn initialize(&mut self, _ctx: &Context) -> ConduitResult<Pipe<i32>> {
        let (tx, pipe) = conduit::core::pipe::channel::<i32>(PipeConfig::point_to_point(8));
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

struct FailTwiceThenSucceed {
    calls: AtomicU32,
}

#[async_trait]
impl ItemTransform<i32, i32> for FailTwiceThenSucceed {
    async fn transform(&self, item: i32, _ctx: &Context) -> ConduitResult<Option<i32>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call % 3 != 2 {
            Err(conduit::ConduitError::transform_failure("not yet"))
        } else {
            Ok(Some(item))
        }
    }
}

struct AlwaysFails {
    calls: AtomicU32,
}

#[async_trait]
impl ItemTransform<i32, i32> for AlwaysFails {
    async fn transform(&self, _item: i32, _ctx: &Context) -> ConduitResult<Option<i32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(conduit::ConduitError::transform_failure("boom"))
    }
}

struct Collect(Arc<Mutex<Vec<i32>>>);

#[async_trait]
impl Sink<i32> for Collect {
    async fn execute(&mut self, mut input: PipeConsumer<i32>, ctx: &Context) -> ConduitResult<()> {
        loop {
            match input.next(ctx.cancellation()).await {
                PipeSignal::Item(i) => self.0.lock().unwrap().push(i),
                PipeSignal::End(Terminal::Completed) => return Ok(()),
                PipeSignal::End(Terminal::Faulted(e)) => return Err(e),
                PipeSignal::End(Terminal::Cancelled) => return Err(conduit::ConduitError::Cancelled),
            }
        }
    }
}

fn retry_parameters() -> Parameters {
    let mut parameters = Parameters::new();
    parameters.set("retry.max_attempts", 3);
    parameters.set(
        "retry.backoff",
        serde_json::json!({"kind": "fixed", "delay_ms": 0}),
    );
    parameters.set("retry.jitter", serde_json::json!({"kind": "none"}));
    parameters.set("breaker.enabled", false);
    parameters
}

#[tokio::test]
async fn every_item_eventually_succeeds_after_two_failures() {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut builder = GraphBuilder::new();
    builder
        .add_source("numbers", Numbers(vec![1, 2, 3]))
        .add_transform(
            "flaky",
            Transform::Item(Box::new(FailTwiceThenSucceed { calls: AtomicU32::new(0) })),
        )
        .add_sink("sink", Collect(Arc::clone(&collected)))
        .connect("numbers", "flaky")
        .connect("flaky", "sink")
        .with_strategy(
            "flaky",
            ExecutionStrategy::Resilient(Box::new(ExecutionStrategy::Sequential)),
        )
        .with_node_parameters("flaky", retry_parameters());

    let compiled = builder.build().expect("graph is valid");
    let outcome = conduit::runner::run(compiled, Context::new(Parameters::new())).await;

    assert!(outcome.is_success());
    assert_eq!(*collected.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn exhausted_retries_land_in_the_dead_letter_sink_and_the_run_still_succeeds() {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let dlq: Arc<InMemoryDeadLetterSink<i32>> = Arc::new(InMemoryDeadLetterSink::new());

    let mut builder = GraphBuilder::new();
    builder
        .add_source("numbers", Numbers(vec![1, 2]))
        .add_transform(
            "always_fails",
            Transform::Item(Box::new(AlwaysFails { calls: AtomicU32::new(0) })),
        )
        .add_sink("sink", Collect(Arc::clone(&collected)))
        .connect("numbers", "always_fails")
        .connect("always_fails", "sink")
        .with_strategy(
            "always_fails",
            ExecutionStrategy::Resilient(Box::new(ExecutionStrategy::Sequential)),
        )
        .with_node_parameters("always_fails", retry_parameters())
        .with_dead_letter_sink::<i32>("always_fails", dlq.clone());

    let compiled = builder.build().expect("graph is valid");
    let outcome = conduit::runner::run(compiled, Context::new(Parameters::new())).await;

    assert!(outcome.is_success());
    assert!(collected.lock().unwrap().is_empty());

    let letters = dlq.drain().await;
    assert_eq!(letters.len(), 2);
    for letter in &letters {
        assert!(matches!(
            letter.error,
            conduit::ConduitError::RetryBudgetExhausted { attempts: 3, .. }
        ));
    }
}
