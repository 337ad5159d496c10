//! Up to `degree` items in flight concurrently, optionally reassembled
//! back into input order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::core::context::{Context, Parameters};
use crate::core::node::ItemTransform;
use crate::core::pipe::{PipeConsumer, PipeProducer, PipeSignal, Terminal};
use crate::error::{ConduitError, ConduitResult};
use crate::params;
use crate::strategy::Strategy;

#[derive(Debug, Clone, Copy)]
pub struct ParallelStrategy {
    pub degree: usize,
    pub preserve_order: bool,
    /// Additional look-ahead beyond `degree`; the window size used for
    /// backpressure is `degree + buffer`.
    pub buffer: usize,
}

impl Default for ParallelStrategy {
    fn default() -> Self {
        Self {
            degree: 4,
            preserve_order: false,
            buffer: 0,
        }
    }
}

impl ParallelStrategy {
    pub fn from_parameters(parameters: &Parameters) -> Self {
        let defaults = Self::default();
        Self {
            degree: parameters.get_or(params::PARALLEL_DEGREE, defaults.degree).max(1),
            preserve_order: parameters.get_or(params::PARALLEL_PRESERVE_ORDER, defaults.preserve_order),
            buffer: parameters.get_or(params::PARALLEL_BUFFER, defaults.buffer),
        }
    }

    fn window(&self) -> usize {
        self.degree.max(1) + self.buffer
    }
}

#[async_trait]
impl<In, Out> Strategy<In, Out> for ParallelStrategy
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
    ) -> ConduitResult<()> {
        let cancel = ctx.cancellation().clone();
        let terminal_slot: Arc<Mutex<Option<Terminal>>> = Arc::new(Mutex::new(None));
        let terminal_for_unfold = Arc::clone(&terminal_slot);

        // Pulls items off the input pipe one at a time; the terminal it ends
        // on (Completed/Faulted/Cancelled) is stashed in `terminal_slot`
        // rather than threaded through the stream itself, so it never races
        // the windowed item futures below (an instantly-resolving terminal
        // marker would otherwise overtake slower in-flight items under
        // `buffer_unordered`).
        let items = stream::unfold(Some(input), move |state| {
            let cancel = cancel.clone();
            let terminal_slot = Arc::clone(&terminal_for_unfold);
            async move {
                let mut input = state?;
                match input.next(&cancel).await {
                    PipeSignal::Item(item) => Some((item, Some(input))),
                    PipeSignal::End(terminal) => {
                        *terminal_slot.lock().expect("terminal slot poisoned") = Some(terminal);
                        None
                    }
                }
            }
        });

        let body_futures = items.map(move |item| {
            let body = Arc::clone(&body);
            let ctx = ctx.clone();
            async move { body.transform(item, &ctx).await }
        });

        let window = self.window();
        let mut results = if self.preserve_order {
            body_futures.buffered(window).boxed()
        } else {
            body_futures.buffer_unordered(window).boxed()
        };

        while let Some(result) = results.next().await {
            match result {
                Ok(Some(out_item)) => {
                    if let Err(e) = output.publish(out_item).await {
                        output.fail(e.clone());
                        return Err(e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    output.fail(e.clone());
                    return Err(e);
                }
            }
        }

        match terminal_slot.lock().expect("terminal slot poisoned").take() {
            Some(Terminal::Completed) | None => {
                output.complete();
                Ok(())
            }
            Some(Terminal::Faulted(e)) => {
                output.fail(e.clone());
                Err(e)
            }
            Some(Terminal::Cancelled) => {
                output.cancel();
                Err(ConduitError::Cancelled)
            }
        }
    }
}
