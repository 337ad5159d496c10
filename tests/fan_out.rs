//! End-to-end scenario 6: one source feeds two independent sinks; both
//! observe the full sequence, and a slow sink backpressures the producer
//! under the default `Wait` policy rather than causing the other sink to
//! miss anything.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conduit::{
    Context, ConduitResult, GraphBuilder, Parameters, Pipe, PipeConfig, PipeConsumer, PipeSignal,
    Sink, Source, Terminal,
};

struct Letters;

#[async_trait]
impl Source<&'static str> for Letters {
    async fn initialize(&mut self, _ctx: &Context) -> ConduitResult<Pipe<&'static str>> {
        let (tx, pipe) = conduit::core::pipe::channel::<&'static str>(PipeConfig::fan_out(
            1,
            Default::default(),
        ));
        tokio::spawn(async move {
            for item in ["a", "b", "c"] {
                tx.publish(item).await.unwrap();
            }
            tx.complete();
        });
        Ok(pipe)
    }
}

struct Collect {
    seen: Arc<Mutex<Vec<&'static str>>>,
    delay_per_item: Duration,
}

#[async_trait]
impl Sink<&'static str> for Collect {
    async fn execute(
        &mut self,
        mut input: PipeConsumer<&'static str>,
        ctx: &Context,
    ) -> ConduitResult<()> {
        loop {
            match input.next(ctx.cancellation()).await {
                PipeSignal::Item(item) => {
                    if !self.delay_per_item.is_zero() {
                        tokio::time::sleep(self.delay_per_item).await;
                    }
                    self.seen.lock().unwrap().push(item);
                }
                PipeSignal::End(Terminal::Completed) => return Ok(()),
                PipeSignal::End(Terminal::Faulted(e)) => return Err(e),
                PipeSignal::End(Terminal::Cancelled) => return Err(conduit::ConduitError::Cancelled),
            }
        }
    }
}

#[tokio::test]
async fn both_sinks_observe_the_full_sequence() {
    let fast = Arc::new(Mutex::new(Vec::new()));
    let slow = Arc::new(Mutex::new(Vec::new()));

    let mut builder = GraphBuilder::new();
    builder
        .add_source("letters", Letters)
        .add_sink(
            "fast_sink",
            Collect { seen: Arc::clone(&fast), delay_per_item: Duration::ZERO },
        )
        .add_sink(
            "slow_sink",
            Collect { seen: Arc::clone(&slow), delay_per_item: Duration::from_millis(20) },
        )
        .connect("letters", "fast_sink")
        .connect("letters", "slow_sink");

    let compiled = builder.build().expect("graph is valid");
    let outcome = conduit::runner::run(compiled, Context::new(Parameters::new())).await;

    assert!(outcome.is_success());
    assert_eq!(*fast.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(*slow.lock().unwrap(), vec!["a", "b", "c"]);
}
