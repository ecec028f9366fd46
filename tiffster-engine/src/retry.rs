//! Bounded exponential-backoff retry.
//!
//! Failures are split in two: errors a retry cannot fix are returned at
//! once, everything else is retried up to `retry_count` times, waiting
//! `backoff_base^attempt` backoff units before attempt `attempt`.

use std::future::Future;

use tiffster_core::{RetryConfig, TiffsterError, TiffsterResult};

/// Run `operation` under `config`, retrying failures `is_retryable` accepts.
///
/// Generic over the error type so any fallible async operation can use it.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    label: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !is_retryable(&error) {
            tracing::debug!(label, error = %error, "Non-retryable failure");
            return Err(error);
        }

        if attempt >= config.retry_count {
            tracing::warn!(
                label,
                attempts = attempt + 1,
                error = %error,
                "Retries exhausted"
            );
            return Err(error);
        }

        attempt += 1;
        let delay = config.delay_for(attempt);
        tracing::warn!(
            label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Retry runner bound to a policy, classifying with
/// [`TiffsterError::is_retryable`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn run<T, F, Fut>(&self, label: &str, operation: F) -> TiffsterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TiffsterResult<T>>,
    {
        retry_with_backoff(&self.config, label, TiffsterError::is_retryable, operation).await
    }
}
