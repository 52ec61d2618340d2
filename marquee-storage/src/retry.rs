//! Bounded retry for transient origin failures.
//!
//! Attempt `n` (1-based) that fails with a retryable error is followed by a
//! `n * backoff_unit` wait. Errors the policy does not classify as retryable
//! are returned unchanged on the first failure. When every attempt fails the
//! caller gets [`MarqueeError::RetryExhausted`] carrying the last cause.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use marquee_core::{MarqueeError, MarqueeResult, RetryConfig};

/// Wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Wait `unit * attempt` after attempt `attempt` fails.
    Linear { unit: Duration },
}

impl Backoff {
    /// Delay after the given 1-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { unit } => unit.saturating_mul(attempt),
        }
    }
}

type Classifier = Arc<dyn Fn(&MarqueeError) -> bool + Send + Sync>;

/// How many times to try, how long to wait, and which errors qualify.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    is_retryable: Classifier,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::Linear {
                unit: config.backoff_unit,
            },
            is_retryable: Arc::new(MarqueeError::is_transient),
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            is_retryable: Arc::new(|_| false),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the retryable-error classifier.
    pub fn with_classifier<F>(mut self, is_retryable: F) -> Self
    where
        F: Fn(&MarqueeError) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(is_retryable);
        self
    }

    pub fn is_retryable(&self, err: &MarqueeError) -> bool {
        (self.is_retryable)(err)
    }
}

/// Runs an async operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> MarqueeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MarqueeResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !self.policy.is_retryable(&err) => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    tracing::warn!(
                        attempts = attempt,
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(MarqueeError::RetryExhausted {
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = self.policy.backoff.delay(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
