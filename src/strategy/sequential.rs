//! The default item-transform strategy: one item at a time, output in
//! input order.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::context::Context;
use crate::core::node::ItemTransform;
use crate::core::pipe::{PipeConsumer, PipeProducer, PipeSignal, Terminal};
use crate::error::ConduitResult;
use crate::strategy::Strategy;

#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialStrategy;

#[async_trait]
impl<In, Out> Strategy<In, Out> for SequentialStrategy
where
    In: Clone + Send + 'static,
    Out: Clone + Send + 'static,
{
    async fn drive(
        &self,
        mut input: PipeConsumer<In>,
        output: PipeProducer<Out>,
        body: Arc<dyn ItemTransform<In, Out>>,
        ctx: Context,
    ) -> ConduitResult<()> {
        loop {
            match input.next(ctx.cancellation()).await {
                PipeSignal::Item(item) => match body.transform(item, &ctx).await {
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
                },
                PipeSignal::End(Terminal::Completed) => {
                    output.complete();
                    return Ok(());
                }
                PipeSignal::End(Terminal::Faulted(e)) => {
                    output.fail(e.clone());
                    return Err(e);
                }
                PipeSignal::End(Terminal::Cancelled) => {
                    output.cancel();
                    return Err(crate::error::ConduitError::Cancelled);
                }
            }
        }
    }
}
