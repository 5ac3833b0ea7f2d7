//! Bounded retry with exponential backoff.

use crate::error::{PipelineError, PipelineResult, StageKind};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How many times a stage is attempted and how long to wait in between.
///
/// The wait before attempt `n + 1` is `base_delay * 2^(n - 1)`: with a 2s
/// base, 2s then 4s. No jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_before_retry(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Cancellation is honoured
    /// between attempts and during backoff, never in the middle of `op`.
    pub async fn run<T, F, Fut>(
        &self,
        stage: StageKind,
        cancel: &CancellationToken,
        mut op: F,
    ) -> PipelineResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(stage = %stage, attempt, "stage succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= max_attempts {
                tracing::error!(
                    stage = %stage,
                    attempts = attempt,
                    error = %err,
                    "stage failed, retry budget exhausted"
                );
                return Err(PipelineError::ResourceExhausted {
                    stage,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_before_retry(attempt);
            tracing::warn!(
                stage = %stage,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "stage attempt failed, backing off"
            );

            if cancel.is_cancelled() {
                return Err(PipelineError::Aborted);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
