//! Per-request retry with linear or exponential backoff.
//!
//! Governed by the step's `on_error` settings: `max_retries`,
//! `retry_backoff`, `initial_delay`. Only retryable provider errors
//! (transport, rate limit, timeout, 5xx) are retried; rejections fail fast.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ProviderError;

/// Backoff growth strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Linear,
    Exponential,
}

/// Retry policy for a single logical request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Linear,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            initial_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = self.initial_delay.as_millis() as u64;
        let scaled = match self.backoff {
            Backoff::Linear => millis.saturating_mul(attempt as u64),
            Backoff::Exponential => millis.saturating_mul(1u64 << (attempt - 1).min(20)),
        };
        Duration::from_millis(scaled).min(self.max_delay)
    }

    /// Run `operation`, retrying retryable provider errors up to
    /// `max_retries` times. A rate-limit `retry_after` hint overrides the
    /// computed backoff when it is longer.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.max_retries || !err.is_retryable() {
                        return Err(err);
                    }
                    let mut delay = self.delay_for(attempt);
                    if let ProviderError::RateLimit {
                        retry_after: Some(hint),
                        ..
                    } = &err
                    {
                        delay = delay.max(*hint);
                    }
                    tracing::debug!(
                        attempt,
                        ?delay,
                        error = %err,
                        "retrying provider request"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
