//! Wraps the Sequential item-by-item loop with retry, circuit breaking,
//! per-attempt timeout, and dead-letter routing.
//!
//! Per the engine's own design: item-transforms are processed one at a
//! time (the Sequential default), so Resilient's own pull loop is always
//! sequential — it is the per-item retry/breaker/timeout machinery that
//! does the heavy lifting, not a concurrent dispatch model. Wrapping a
//! Parallel-style concurrent driver is left to callers who want to compose
//! primitives from [`crate::resilience`] directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::context::{Context, Parameters};
use crate::core::node::ItemTransform;
use crate::core::pipe::{PipeConsumer, PipeProducer, PipeSignal, Terminal};
use crate::error::{ConduitError, ConduitResult};
use crate::params;
use crate::resilience::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::deadletter::{DeadLetter, DeadLetterSink};
use crate::resilience::retry::RetryPolicy;
use crate::strategy::Strategy;

pub struct ResilientStrategy<In> {
    pub retry: RetryPolicy,
    pub breaker: Option<CircuitBreakerConfig>,
    pub per_attempt_timeout: Option<Duration>,
    /// Advisory bound on in-flight items held for potential replay. The
    /// core's own driver below only ever holds the single item currently
    /// being retried, so this never actually constrains anything here; it
    /// exists for callers who plug a custom multi-item-holding strategy in
    /// through the same `Strategy` SPI, and as the value parsed from
    /// `dlq.max_materialized_items` a caller reads when choosing the
    /// capacity of an [`crate::resilience::deadletter::InMemoryDeadLetterSink::bounded`]
    /// to attach via [`ResilientStrategy::with_dead_letter_sink`].
    pub max_materialized_items: Option<usize>,
    pub dead_letter: Option<Arc<dyn DeadLetterSink<In>>>,
}

impl<In> Default for ResilientStrategy<In> {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: Some(CircuitBreakerConfig::default()),
            per_attempt_timeout: None,
            max_materialized_items: Some(1),
            dead_letter: None,
        }
    }
}

impl<In> ResilientStrategy<In> {
    pub fn from_parameters(parameters: &Parameters) -> Self {
        Self {
            retry: RetryPolicy::from_parameters(parameters),
            breaker: CircuitBreakerConfig::from_parameters(parameters),
            per_attempt_timeout: parameters
                .get_raw(params::RETRY_PER_ATTEMPT_TIMEOUT_MS)
                .and_then(|v| v.as_u64())
                .map(Duration::from_millis),
            max_materialized_items: Some(
                parameters.get_or(params::DLQ_MAX_MATERIALIZED_ITEMS, 1usize),
            ),
            dead_letter: None,
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink<In>>) -> Self {
        self.dead_letter = Some(sink);
        self
    }
}

#[async_trait]
impl<In, Out> Strategy<In, Out> for ResilientStrategy<In>
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
        let breaker = self.breaker.map(CircuitBreaker::new);
        let node_id = ctx.node_id().unwrap_or("<unscoped>").to_string();

        loop {
            match input.next(ctx.cancellation()).await {
                PipeSignal::Item(item) => {
                    let outcome = self
                        .call_with_resilience(item.clone(), &body, &ctx, breaker.as_ref())
                        .await;
                    match outcome {
                        Ok(Some(out_item)) => {
                            if let Err(e) = output.publish(out_item).await {
                                output.fail(e.clone());
                                return Err(e);
                            }
                        }
                        Ok(None) => {}
                        Err(terminal_err) => {
                            if let Some(dlq) = &self.dead_letter {
                                dlq.publish(DeadLetter {
                                    node_id: node_id.clone(),
                                    item,
                                    error: terminal_err,
                                })
                                .await;
                            } else {
                                output.fail(terminal_err.clone());
                                return Err(terminal_err);
                            }
                        }
                    }
                }
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
                    return Err(ConduitError::Cancelled);
                }
            }
        }
    }
}

impl<In> ResilientStrategy<In>
where
    In: Clone + Send + 'static,
{
    /// Runs the breaker-gate-then-retry-with-timeout sequence for a single
    /// item. Returns `Ok(None)` for a filtered item, `Ok(Some(_))` on
    /// success, or the terminal error the caller routes to the dead-letter
    /// sink (or faults the node with, if none is configured).
    async fn call_with_resilience<Out>(
        &self,
        item: In,
        body: &Arc<dyn ItemTransform<In, Out>>,
        ctx: &Context,
        breaker: Option<&CircuitBreaker>,
    ) -> ConduitResult<Option<Out>>
    where
        Out: Clone + Send + 'static,
    {
        if let Some(b) = breaker {
            if !b.admit() {
                return Err(ConduitError::CircuitOpen);
            }
        }

        let per_attempt_timeout = self.per_attempt_timeout;
        self.retry
            .run(ctx.cancellation(), |_attempt| {
                let item = item.clone();
                let body = Arc::clone(body);
                let ctx = ctx.clone();
                async move {
                    let call = body.transform(item, &ctx);
                    let attempt_result = match per_attempt_timeout {
                        Some(d) => match tokio::time::timeout(d, call).await {
                            Ok(result) => result,
                            Err(_) => Err(ConduitError::Timeout(d)),
                        },
                        None => call.await,
                    };
                    match (&attempt_result, breaker) {
                        (Ok(_), Some(b)) => b.record_success(),
                        (Err(_), Some(b)) => b.record_failure(),
                        _ => {}
                    }
                    attempt_result
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipe::{self, PipeConfig};
    use crate::resilience::backoff::Backoff;
    use crate::resilience::deadletter::InMemoryDeadLetterSink;
    use crate::resilience::jitter::Jitter;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailNTimes {
        failures_remaining: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ItemTransform<i32, i32> for FailNTimes {
        async fn transform(&self, item: i32, _ctx: &Context) -> ConduitResult<Option<i32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                Err(ConduitError::transform_failure("not yet"))
            } else {
                Ok(Some(item))
            }
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ItemTransform<i32, i32> for AlwaysFails {
        async fn transform(&self, _item: i32, _ctx: &Context) -> ConduitResult<Option<i32>> {
            Err(ConduitError::transform_failure("boom"))
        }
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let (in_tx, in_pipe) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
        let (out_tx, out_pipe) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
        let input = in_pipe.subscribe().unwrap();
        let mut output = out_pipe.subscribe().unwrap();
        let ctx = Context::new(Parameters::new());

        tokio::spawn(async move {
            in_tx.publish(1).await.unwrap();
            in_tx.complete();
        });

        let strategy = ResilientStrategy::<i32> {
            retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff(Backoff::fixed(Duration::ZERO))
                .with_jitter(Jitter::None),
            breaker: None,
            per_attempt_timeout: None,
            max_materialized_items: None,
            dead_letter: None,
        };
        let body: Arc<dyn ItemTransform<i32, i32>> = Arc::new(FailNTimes {
            failures_remaining: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        strategy.drive(input, out_tx, body, ctx).await.unwrap();

        assert!(matches!(output.next(&Default::default()).await, PipeSignal::Item(1)));
    }

    #[tokio::test]
    async fn exhausted_retries_route_to_dead_letter() {
        let (in_tx, in_pipe) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
        let (out_tx, out_pipe) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
        let input = in_pipe.subscribe().unwrap();
        let mut output = out_pipe.subscribe().unwrap();
        let ctx = Context::new(Parameters::new());
        let dlq: Arc<InMemoryDeadLetterSink<i32>> = Arc::new(InMemoryDeadLetterSink::new());

        tokio::spawn(async move {
            in_tx.publish(1).await.unwrap();
            in_tx.publish(2).await.unwrap();
            in_tx.complete();
        });

        let strategy = ResilientStrategy::<i32> {
            retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff(Backoff::fixed(Duration::ZERO))
                .with_jitter(Jitter::None),
            breaker: None,
            per_attempt_timeout: None,
            max_materialized_items: None,
            dead_letter: None,
        }
        .with_dead_letter_sink(dlq.clone());

        let body: Arc<dyn ItemTransform<i32, i32>> = Arc::new(AlwaysFails);
        strategy.drive(input, out_tx, body, ctx).await.unwrap();

        assert!(matches!(
            output.next(&Default::default()).await,
            PipeSignal::End(Terminal::Completed)
        ));
        let letters = dlq.drain().await;
        assert_eq!(letters.len(), 2);
        assert!(matches!(letters[0].error, ConduitError::RetryBudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn breaker_rejects_without_invoking_body_once_open() {
        let (in_tx, in_pipe) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
        let (out_tx, out_pipe) = pipe::channel::<i32>(PipeConfig::point_to_point(8));
        let input = in_pipe.subscribe().unwrap();
        let ctx = Context::new(Parameters::new());
        let dlq: Arc<InMemoryDeadLetterSink<i32>> = Arc::new(InMemoryDeadLetterSink::new());

        tokio::spawn(async move {
            for i in 0..6 {
                in_tx.publish(i).await.unwrap();
            }
            in_tx.complete();
        });

        let calls = Arc::new(AtomicU32::new(0));
        struct CountingFail(Arc<AtomicU32>);
        #[async_trait]
        impl ItemTransform<i32, i32> for CountingFail {
            async fn transform(&self, _item: i32, _ctx: &Context) -> ConduitResult<Option<i32>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(ConduitError::transform_failure("boom"))
            }
        }

        let strategy = ResilientStrategy::<i32> {
            retry: RetryPolicy::default().with_max_attempts(1),
            breaker: Some(CircuitBreakerConfig {
                failure_threshold: 5,
                open_duration: Duration::from_secs(30),
                probe_count: 1,
            }),
            per_attempt_timeout: None,
            max_materialized_items: None,
            dead_letter: None,
        }
        .with_dead_letter_sink(dlq.clone());

        let body: Arc<dyn ItemTransform<i32, i32>> = Arc::new(CountingFail(Arc::clone(&calls)));
        strategy.drive(input, out_tx, body, ctx).await.unwrap();

        // 6 items in: 5 invoke the body and trip the breaker, the 6th is
        // rejected with CircuitOpen without another body invocation.
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        let letters = dlq.drain().await;
        assert_eq!(letters.len(), 6);
        assert!(matches!(letters[5].error, ConduitError::CircuitOpen));
    }
}
