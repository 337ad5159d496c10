//! Combines several input pipes feeding the same merge port into one.
//!
//! Three modes, per the engine's design: *ordered-by-arrival* (items in
//! receive order across inputs), *ordered-by-timestamp* (a watermark-based
//! reorder buffer), and *partitioned* (preserves per-input order,
//! interleaving arbitrary). The first and third share one implementation —
//! a plain fan-in that forwards whichever input has an item ready
//! satisfies both: per-input order is always preserved by construction,
//! and "arrival order" is exactly what a fan-in observes.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::context::Context;
use crate::core::pipe::{self, Pipe, PipeConfig, PipeConsumer, PipeSignal, Terminal};
use crate::error::ConduitResult;

#[derive(Clone)]
pub enum MergeMode<T> {
    /// Forward whichever input has the next item ready.
    OrderedByArrival,
    /// Forward whichever input has the next item ready (per-input order is
    /// preserved regardless, so this is the same fan-in as `OrderedByArrival`
    /// at the implementation level).
    Partitioned,
    /// Items carry a watermark; emit in non-decreasing timestamp order,
    /// buffering out-of-order arrivals up to `max_lateness` behind the
    /// highest watermark observed so far.
    OrderedByTimestamp {
        max_lateness: Duration,
        timestamp_of: Arc<dyn Fn(&T) -> SystemTime + Send + Sync>,
    },
}

struct Buffered<T> {
    timestamp: SystemTime,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Buffered<T> {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.sequence == other.sequence
    }
}
impl<T> Eq for Buffered<T> {}
impl<T> PartialOrd for Buffered<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Buffered<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap: we want the earliest timestamp
        // (then lowest sequence) to sort first.
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Spawns a fan-in driver combining `consumers` into one output pipe per
/// `mode`. The returned pipe is subscribable like any other.
pub fn merge<T: Clone + Send + 'static>(
    consumers: Vec<PipeConsumer<T>>,
    mode: MergeMode<T>,
    ctx: &Context,
) -> Pipe<T> {
    let (out_tx, out_pipe) = pipe::channel::<T>(PipeConfig::point_to_point(
        consumers.len().max(1) * 16,
    ));
    let cancel = ctx.cancellation().clone();
    let span = ctx.span().clone();

    tokio::spawn(
        async move {
            match mode {
                MergeMode::OrderedByArrival | MergeMode::Partitioned => {
                    run_fan_in(consumers, &cancel, out_tx).await;
                }
                MergeMode::OrderedByTimestamp {
                    max_lateness,
                    timestamp_of,
                } => {
                    run_timestamp_merge(consumers, &cancel, out_tx, max_lateness, timestamp_of)
                        .await;
                }
            }
        }
        .instrument(span),
    );

    out_pipe
}

async fn run_fan_in<T: Clone + Send + 'static>(
    mut consumers: Vec<PipeConsumer<T>>,
    cancel: &CancellationToken,
    out_tx: pipe::PipeProducer<T>,
) {
    let mut alive = consumers.len();
    if alive == 0 {
        out_tx.complete();
        return;
    }
    loop {
        if alive == 0 {
            out_tx.complete();
            return;
        }
        let mut polled = Vec::with_capacity(consumers.len());
        for consumer in consumers.iter_mut() {
            polled.push(consumer.next(cancel));
        }
        let (signal, index, _) = futures::future::select_all(polled.into_iter().map(Box::pin)).await;
        match signal {
            PipeSignal::Item(item) => {
                if out_tx.publish(item).await.is_err() {
                    return;
                }
            }
            PipeSignal::End(Terminal::Completed) => {
                // This input is done; drop it from rotation.
                consumers.remove(index);
                alive -= 1;
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

async fn run_timestamp_merge<T: Clone + Send + 'static>(
    mut consumers: Vec<PipeConsumer<T>>,
    cancel: &CancellationToken,
    out_tx: pipe::PipeProducer<T>,
    max_lateness: Duration,
    timestamp_of: Arc<dyn Fn(&T) -> SystemTime + Send + Sync>,
) {
    let mut buffer: BinaryHeap<Buffered<T>> = BinaryHeap::new();
    let mut watermark: Option<SystemTime> = None;
    let mut sequence: u64 = 0;
    let mut alive = consumers.len();

    loop {
        if alive > 0 {
            let mut polled = Vec::with_capacity(consumers.len());
            for consumer in consumers.iter_mut() {
                polled.push(consumer.next(cancel));
            }
            let (signal, index, _) =
                futures::future::select_all(polled.into_iter().map(Box::pin)).await;
            match signal {
                PipeSignal::Item(item) => {
                    let ts = timestamp_of(&item);
                    watermark = Some(match watermark {
                        Some(w) if w >= ts => w,
                        _ => ts,
                    });
                    buffer.push(Buffered {
                        timestamp: ts,
                        sequence,
                        item,
                    });
                    sequence += 1;
                }
                PipeSignal::End(Terminal::Completed) => {
                    consumers.remove(index);
                    alive -= 1;
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

        // Release everything behind (watermark - max_lateness); once every
        // input has completed, drain the whole buffer.
        let release_before = watermark.and_then(|w| w.checked_sub(max_lateness));
        loop {
            let ready = match (buffer.peek(), alive) {
                (Some(b), 0) => true,
                (Some(b), _) => release_before.map(|cut| b.timestamp <= cut).unwrap_or(false),
                (None, _) => false,
            };
            if !ready {
                break;
            }
            if let Some(b) = buffer.pop() {
                if out_tx.publish(b.item).await.is_err() {
                    return;
                }
            }
        }

        if alive == 0 && buffer.is_empty() {
            out_tx.complete();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Parameters;

    #[tokio::test]
    async fn fan_in_preserves_per_input_order() {
        let (tx_a, pipe_a) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
        let (tx_b, pipe_b) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
        let ctx = Context::new(Parameters::new());

        tokio::spawn(async move {
            for v in [1, 3, 5] {
                tx_a.publish(v).await.unwrap();
            }
            tx_a.complete();
        });
        tokio::spawn(async move {
            for v in [2, 4, 6] {
                tx_b.publish(v).await.unwrap();
            }
            tx_b.complete();
        });

        let consumers = vec![pipe_a.subscribe().unwrap(), pipe_b.subscribe().unwrap()];
        let merged = merge(consumers, MergeMode::OrderedByArrival, &ctx);
        let mut out = merged.subscribe().unwrap();
        let cancel = CancellationToken::new();

        let mut seen = Vec::new();
        loop {
            match out.next(&cancel).await {
                PipeSignal::Item(v) => seen.push(v),
                PipeSignal::End(_) => break,
            }
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }
}
