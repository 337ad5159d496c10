//! End-to-end scenario 2: 100 integers batched by size into groups of 10.

use async_trait::async_trait;
use conduit::core::node::StreamTransform;
use conduit::strategy::BatchTransform;
use conduit::{
    Context, ConduitResult, GraphBuilder, Parameters, Pipe, PipeConfig, PipeConsumer, PipeSignal,
    Sink, Source, Terminal, Transform,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Counting;

#[async_trait]
impl Source<i32> for Counting {
    async fn initialize(&mut self, _ctx: &Context) -> ConduitResult<Pipe<i32>> {
        let (tx, pipe) = conduit::core::pipe::channel::<i32>(PipeConfig::point_to_point(128));
        tokio::spawn(async move {
            for i in 1..=100 {
                tx.publish(i).await.unwrap();
            }
            tx.complete();
        });
        Ok(pipe)
    }
}

/// Wraps [`BatchTransform`] in the `StreamTransform` shape `GraphBuilder`
/// expects, since the helper itself only implements `drive`/`dispose`
/// directly against a fixed size/timeout — no adapter is needed beyond
/// boxing it.
struct Batch10(BatchTransform<i32>);

#[async_trait]
impl StreamTransform<i32, Vec<i32>> for Batch10 {
    async fn drive(
        &mut self,
        input: PipeConsumer<i32>,
        ctx: &Context,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> ConduitResult<Pipe<Vec<i32>>> {
        self.0.drive(input, ctx, cancel).await
    }
}

struct Collect(Arc<Mutex<Vec<Vec<i32>>>>);

#[async_trait]
impl Sink<Vec<i32>> for Collect {
    async fn execute(&mut self, mut input: PipeConsumer<Vec<i32>>, ctx: &Context) -> ConduitResult<()> {
        loop {
            match input.next(ctx.cancellation()).await {
                PipeSignal::Item(batch) => self.0.lock().unwrap().push(batch),
                PipeSignal::End(Terminal::Completed) => return Ok(()),
                PipeSignal::End(Terminal::Faulted(e)) => return Err(e),
                PipeSignal::End(Terminal::Cancelled) => return Err(conduit::ConduitError::Cancelled),
            }
        }
    }
}

#[tokio::test]
async fn hundred_items_arrive_as_ten_batches_of_ten() {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let mut builder = GraphBuilder::new();
    builder
        .add_source("numbers", Counting)
        .add_transform(
            "batch",
            Transform::Stream(Box::new(Batch10(BatchTransform::new(
                10,
                Duration::from_secs(1),
            )))),
        )
        .add_sink("sink", Collect(Arc::clone(&collected)))
        .connect("numbers", "batch")
        .connect("batch", "sink");

    let compiled = builder.build().expect("graph is valid");
    let outcome = conduit::runner::run(compiled, Context::new(Parameters::new())).await;

    assert!(outcome.is_success());
    let batches = collected.lock().unwrap();
    assert_eq!(batches.len(), 10);
    for (i, batch) in batches.iter().enumerate() {
        let expected: Vec<i32> = ((i as i32 * 10 + 1)..=(i as i32 * 10 + 10)).collect();
        assert_eq!(*batch, expected);
    }
}
