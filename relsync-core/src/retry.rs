//! Bounded retry with exponential backoff for backend calls.
//!
//! Every network operation the repository performs runs through a
//! [`RetryExecutor`]. Retryable failures (see [`BlobError::is_retryable`]) are
//! attempted again after a growing delay; final failures surface immediately.
//! A [`CancellationToken`] aborts the loop at any point, including while
//! sleeping between attempts.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{BlobError, RepoResult, RepositoryError};

pub const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    attempt_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS)
    }
}

impl RetryExecutor {
    /// `attempts` is the total number of tries, including the first. Zero is treated as one.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            attempt_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Bound every single attempt. An attempt that runs longer fails with
    /// [`BlobError::TimedOut`], which is retryable.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (retry - 1).min(16);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails finally, runs out of attempts or is cancelled.
    pub async fn retry<F, Fut>(&self, description: &str, operation: F) -> RepoResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), BlobError>>,
    {
        self.retry_ret(description, operation).await
    }

    /// Like [`retry`](Self::retry) but hands back the operation's value.
    pub async fn retry_ret<T, F, Fut>(&self, description: &str, mut operation: F) -> RepoResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BlobError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(description));
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(description)),
                outcome = self.attempt(operation()) => outcome,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(RepositoryError::from_blob(description, err));
            }

            if attempt >= self.attempts {
                error!(
                    operation = description,
                    attempts = attempt,
                    error = %err,
                    "Giving up after exhausting retries"
                );
                return Err(RepositoryError::Exhausted {
                    description: description.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.delay_for_retry(attempt);
            warn!(
                operation = description,
                attempt,
                max_attempts = self.attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(description)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt<T, Fut>(&self, fut: Fut) -> Result<T, BlobError>
    where
        Fut: Future<Output = Result<T, BlobError>>,
    {
        match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BlobError::TimedOut(limit)),
            },
            None => fut.await,
        }
    }

    fn cancelled(&self, description: &str) -> RepositoryError {
        warn!(operation = description, "Operation cancelled");
        RepositoryError::Cancelled {
            description: description.to_string(),
        }
    }
}
