//! Attempt/delay bookkeeping shared by every resilient call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::context::Parameters;
use crate::error::ConduitError;
use crate::params;
use crate::resilience::backoff::Backoff;
use crate::resilience::jitter::Jitter;

/// `max_attempts` total calls, sleeping `delay(n)` between attempt `n` and
/// `n+1`. `should_retry` is consulted before every sleep; when it returns
/// `false` the original error is returned as-is (not wrapped — it never
/// entered a retry budget to exhaust).
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: Jitter,
    pub overall_timeout: Option<Duration>,
    pub should_retry: Arc<dyn Fn(&ConduitError, u32) -> bool + Send + Sync>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(
                Duration::from_millis(100),
                2.0,
                Duration::from_secs(5),
            ),
            jitter: Jitter::Full,
            overall_timeout: None,
            should_retry: Arc::new(|err, _attempt| err.is_retriable_by_default()),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    pub fn with_should_retry(
        mut self,
        predicate: impl Fn(&ConduitError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Builds a policy from a node's already-layered [`Parameters`],
    /// falling back to [`RetryPolicy::default`] for any key left unset.
    pub fn from_parameters(parameters: &Parameters) -> Self {
        let mut policy = RetryPolicy::default();
        policy.max_attempts = parameters.get_or(params::RETRY_MAX_ATTEMPTS, policy.max_attempts);
        policy.backoff = parameters
            .get_raw(params::RETRY_BACKOFF)
            .and_then(|v| serde_json::from_value::<crate::params::BackoffConfig>(v.clone()).ok())
            .map(Into::into)
            .unwrap_or(policy.backoff);
        policy.jitter = parameters
            .get_raw(params::RETRY_JITTER)
            .and_then(|v| serde_json::from_value::<crate::params::JitterConfig>(v.clone()).ok())
            .map(Into::into)
            .unwrap_or(policy.jitter);
        if let Some(ms) = parameters.get_raw(params::RETRY_OVERALL_TIMEOUT_MS) {
            if let Some(ms) = ms.as_u64() {
                policy.overall_timeout = Some(Duration::from_millis(ms));
            }
        }
        policy
    }

    /// Runs `attempt` (given the 0-indexed attempt number) up to
    /// `max_attempts` times. Returns the first success, the raw error if
    /// `should_retry` refuses a retry, or [`ConduitError::RetryBudgetExhausted`]
    /// once attempts or `overall_timeout` run out.
    pub async fn run<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, ConduitError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ConduitError>>,
    {
        let start = Instant::now();
        let mut previous_delay = Duration::ZERO;

        for attempt_idx in 0..self.max_attempts {
            if cancel.is_cancelled() {
                return Err(ConduitError::Cancelled);
            }

            let err = match attempt(attempt_idx).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let attempts_made = attempt_idx + 1;
            if !(self.should_retry)(&err, attempt_idx) {
                tracing::debug!(attempt = attempts_made, error = %err, "not retrying");
                return Err(err);
            }
            if attempts_made == self.max_attempts {
                tracing::warn!(attempts = attempts_made, error = %err, "retry budget exhausted");
                return Err(ConduitError::RetryBudgetExhausted {
                    attempts: attempts_made,
                    last_error: Box::new(err),
                });
            }

            let base = self.backoff.delay(attempt_idx);
            let delay = self.jitter.apply(base, previous_delay);
            previous_delay = delay;
            tracing::debug!(attempt = attempts_made, delay_ms = delay.as_millis() as u64, error = %err, "retrying after backoff");

            if let Some(overall) = self.overall_timeout {
                if start.elapsed() + delay >= overall {
                    return Err(ConduitError::RetryBudgetExhausted {
                        attempts: attempts_made,
                        last_error: Box::new(err),
                    });
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConduitError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        unreachable!("loop above always returns before exhausting max_attempts iterations")
    }
}
