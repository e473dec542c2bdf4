//! Retry stage with configurable backoff and failure aggregation.

use crate::cancellation::CancelToken;
use crate::errors::{BuildError, DispatchError, RetryExhaustedError};
use crate::handler::{DispatchResult, DynHandler, Handler};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Backoff {
    /// delay = base (constant)
    #[default]
    Constant,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base * 2^attempt
    Exponential,
}

/// Jitter strategy to spread correlated retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Jitter {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the initial one.
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: Backoff,
    /// Jitter strategy.
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff: Backoff::Constant,
            jitter: Jitter::None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_attempts` is zero.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::invalid_config(
                "max_attempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// Computes the delay after the given 0-indexed failed attempt.
    #[must_use]
    pub fn delay_for(&self, failure_index: usize) -> Duration {
        let base = self.base_delay_ms;
        let capped = match self.backoff {
            Backoff::Constant => base,
            Backoff::Linear => base.saturating_mul(failure_index as u64 + 1),
            Backoff::Exponential => {
                base.saturating_mul(2_u64.saturating_pow(u32::try_from(failure_index).unwrap_or(u32::MAX)))
            }
        }
        .min(self.max_delay_ms);

        let jittered = match self.jitter {
            Jitter::None => capped,
            Jitter::Full => {
                if capped == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=capped)
                }
            }
            Jitter::Equal => {
                let half = capped / 2;
                if half == 0 {
                    capped
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Callback invoked after each failed attempt that will be retried:
/// `(error, attempt, max_attempts, delay)`.
pub type RetryFailureCallback = Arc<dyn Fn(&DispatchError, usize, usize, Duration) + Send + Sync>;

/// Callback invoked once a retried dispatch succeeds, with the attempt
/// number that succeeded.
pub type RetrySuccessCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Notification sink substituted for the callback pair when wiring a
/// retry policy onto a pre-existing handler type.
#[async_trait]
pub trait RetrySink: Send + Sync {
    /// Called after a failed attempt that will be retried.
    async fn on_retry(
        &self,
        error: &DispatchError,
        attempt: usize,
        max_attempts: usize,
        delay: Duration,
    );

    /// Called once an attempt succeeds.
    async fn on_success(&self, attempt: usize);
}

enum RetryNotify {
    None,
    Callbacks {
        on_failure: Option<RetryFailureCallback>,
        on_success: Option<RetrySuccessCallback>,
    },
    Sink(Arc<dyn RetrySink>),
}

/// Re-invokes a failing inner handler with backoff.
///
/// Attempt 1 runs directly; each subsequent attempt waits the policy's
/// delay first. Cancellation failures are never retried and pass through
/// unchanged, and the backoff wait itself aborts on cancellation.
/// Exhaustion raises [`RetryExhaustedError`] carrying every attempt's
/// cause in order.
pub struct RetryStage<M: Clone + Send + 'static> {
    next: DynHandler<M>,
    policy: RetryPolicy,
    notify: RetryNotify,
}

impl<M: Clone + Send + 'static> RetryStage<M> {
    pub(crate) fn stage(next: DynHandler<M>, policy: RetryPolicy) -> DynHandler<M> {
        Arc::new(Self {
            next,
            policy,
            notify: RetryNotify::None,
        })
    }

    pub(crate) fn stage_with_callbacks(
        next: DynHandler<M>,
        policy: RetryPolicy,
        on_failure: Option<RetryFailureCallback>,
        on_success: Option<RetrySuccessCallback>,
    ) -> DynHandler<M> {
        Arc::new(Self {
            next,
            policy,
            notify: RetryNotify::Callbacks {
                on_failure,
                on_success,
            },
        })
    }

    pub(crate) fn stage_with_sink(
        next: DynHandler<M>,
        policy: RetryPolicy,
        sink: Arc<dyn RetrySink>,
    ) -> DynHandler<M> {
        Arc::new(Self {
            next,
            policy,
            notify: RetryNotify::Sink(sink),
        })
    }

    async fn notify_failure(
        &self,
        error: &DispatchError,
        attempt: usize,
        delay: Duration,
    ) {
        match &self.notify {
            RetryNotify::None => {}
            RetryNotify::Callbacks { on_failure, .. } => {
                if let Some(callback) = on_failure {
                    callback(error, attempt, self.policy.max_attempts, delay);
                }
            }
            RetryNotify::Sink(sink) => {
                sink.on_retry(error, attempt, self.policy.max_attempts, delay)
                    .await;
            }
        }
    }

    async fn notify_success(&self, attempt: usize) {
        match &self.notify {
            RetryNotify::None => {}
            RetryNotify::Callbacks { on_success, .. } => {
                if let Some(callback) = on_success {
                    callback(attempt);
                }
            }
            RetryNotify::Sink(sink) => sink.on_success(attempt).await,
        }
    }
}

#[async_trait]
impl<M: Clone + Send + 'static> Handler<M> for RetryStage<M> {
    async fn handle(&self, message: M, cancel: CancelToken) -> DispatchResult {
        let max_attempts = self.policy.max_attempts;
        let mut causes = Vec::new();

        for attempt in 1..=max_attempts {
            match self.next.handle(message.clone(), cancel.clone()).await {
                Ok(()) => {
                    self.notify_success(attempt).await;
                    return Ok(());
                }
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    if attempt < max_attempts {
                        let delay = self.policy.delay_for(attempt - 1);
                        self.notify_failure(&error, attempt, delay).await;
                        causes.push(error);
                        tokio::select! {
                            () = cancel.cancelled() => return Err(cancel.to_error()),
                            () = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        causes.push(error);
                    }
                }
            }
        }

        Err(RetryExhaustedError {
            causes,
            attempts: max_attempts,
            delay_ms: self.policy.base_delay_ms,
        }
        .into())
    }
}
