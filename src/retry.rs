// Shared retry-with-fixed-delay logic for every request the engine issues itself.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{DownloadError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Pause between two attempts. Fixed, no backoff or jitter.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(1500),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts the policy. The closure receives the 1-based attempt number.
///
/// Cancellation wins over every other outcome: a token fired before an
/// attempt, during the delay, or while an attempt was failing yields
/// [`DownloadError::Cancelled`].
pub async fn retry_fixed<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    what: &str,
    operation: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        attempt += 1;

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if !err.is_retryable() || attempt >= attempts {
            return Err(err);
        }

        warn!(
            attempt,
            max = attempts,
            delay_ms = policy.delay.as_millis() as u64,
            error = %err,
            "{what} failed, retrying"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

/// Race `fut` against the token; a fired token drops the future.
pub async fn cancellable<T>(token: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DownloadError::Cancelled),
        result = fut => result,
    }
}
