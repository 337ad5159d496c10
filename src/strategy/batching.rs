//! Stream-transform helper: accumulates items into fixed-size or
//! timed-out batches.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::context::{Context, Parameters};
use crate::core::node::StreamTransform;
use crate::core::pipe::{self, Pipe, PipeConfig, PipeConsumer, PipeSignal, Terminal};
use crate::error::ConduitResult;
use crate::params;

/// Emits the accumulated batch once `batch_size` items have arrived or
/// `batch_timeout` has elapsed since the first item of the batch, whichever
/// comes first. `batch_timeout == Duration::ZERO` means size-only: a batch
/// only ever closes by reaching `batch_size`. Flushes a partial batch when
/// the input completes.
pub struct BatchTransform<T> {
    batch_size: usize,
    batch_timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BatchTransform<T> {
    pub fn new(batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_timeout,
            _marker: PhantomData,
        }
    }

    pub fn from_parameters(parameters: &Parameters) -> Self {
        let batch_size = parameters.get_or(params::BATCH_SIZE, 10usize);
        let timeout_ms = parameters.get_or(params::BATCH_TIMEOUT_MS, 0u64);
        Self::new(batch_size, Duration::from_millis(timeout_ms))
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamTransform<T, Vec<T>> for BatchTransform<T> {
    async fn drive(
        &mut self,
        mut input: PipeConsumer<T>,
        ctx: &Context,
        cancel: &CancellationToken,
    ) -> ConduitResult<Pipe<Vec<T>>> {
        let (out_tx, out_pipe) = pipe::channel::<Vec<T>>(PipeConfig::point_to_point(
            self.batch_size.max(1),
        ));
        let batch_size = self.batch_size;
        let batch_timeout = self.batch_timeout;
        let cancel = cancel.clone();
        let span = ctx.span().clone();

        tokio::spawn(async move {
            let mut batch: Vec<T> = Vec::with_capacity(batch_size);
            let mut deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        out_tx.cancel();
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        let flushed = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        deadline = None;
                        if out_tx.publish(flushed).await.is_err() {
                            return;
                        }
                    }
                    signal = input.next(&cancel) => {
                        match signal {
                            PipeSignal::Item(item) => {
                                if batch.is_empty() && !batch_timeout.is_zero() {
                                    deadline = Some(Instant::now() + batch_timeout);
                                }
                                batch.push(item);
                                if batch.len() >= batch_size {
                                    let flushed = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                                    deadline = None;
                                    if out_tx.publish(flushed).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            PipeSignal::End(Terminal::Completed) => {
                                if !batch.is_empty() {
                                    let _ = out_tx.publish(batch).await;
                                }
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
            }
        }.instrument(span));

        Ok(out_pipe)
    }
}
