//! Stream-transform helper: the inverse of [`crate::strategy::batching::BatchTransform`].
//! Unpacks each incoming collection into its individual elements, in
//! iteration order, with no reordering across input items.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::context::Context;
use crate::core::node::StreamTransform;
use crate::core::pipe::{self, Pipe, PipeConfig, PipeConsumer, PipeSignal, Terminal};
use crate::error::ConduitResult;

pub struct UnbatchTransform<T> {
    output_capacity: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Default for UnbatchTransform<T> {
    fn default() -> Self {
        Self {
            output_capacity: 128,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> UnbatchTransform<T> {
    pub fn new(output_capacity: usize) -> Self {
        Self {
            output_capacity: output_capacity.max(1),
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, C> StreamTransform<C, T> for UnbatchTransform<T>
where
    T: Clone + Send + 'static,
    C: IntoIterator<Item = T> + Clone + Send + 'static,
    C::IntoIter: Send,
{
    async fn drive(
        &mut self,
        mut input: PipeConsumer<C>,
        ctx: &Context,
        cancel: &CancellationToken,
    ) -> ConduitResult<Pipe<T>> {
        let (out_tx, out_pipe) = pipe::channel::<T>(PipeConfig::point_to_point(self.output_capacity));
        let cancel = cancel.clone();
        let span = ctx.span().clone();

        tokio::spawn(
            async move {
                loop {
                    match input.next(&cancel).await {
                        PipeSignal::Item(collection) => {
                            for element in collection {
                                if out_tx.publish(element).await.is_err() {
                                    return;
                                }
                            }
                        }
                        PipeSignal::End(Terminal::Completed) => {
                            out_tx.complete();
                            return;
                        }
                        PipeSignal::End(Terminal::Faulted(e)) => {
                            out_tx.fail(e);
                            return;
                        }
                        PipeSignal::End(Terminal::Cancelled) => {
                            out_tx.cancel();
                            return;
                        }
                    }
                }
            }
            .instrument(span),
        );

        Ok(out_pipe)
    }
}
