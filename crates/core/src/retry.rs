//! Transport-level retry with exponential backoff
//!
//! Covers rate limits, connection failures, server errors, and timeouts.
//! Malformed-response handling (cache-busting, fallback models) lives in the
//! query layer; this module only retries errors the provider classifies as
//! transient.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;

/// Retry policy for transient transport errors.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first call
    pub max_attempts: u32,
    /// Base delay; attempt k sleeps `base_delay * 2^k` plus jitter
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after attempt `attempt` (0-indexed), with up to
    /// 10% random jitter added.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay * 2u32.saturating_pow(attempt);
        let jitter_fraction: f64 = rand::rng().random_range(0.0..0.1);
        exponential + exponential.mul_f64(jitter_fraction)
    }
}

/// Call `op`, retrying transient failures per `policy`. Non-retryable errors
/// surface immediately; a retryable error on the final attempt surfaces too.
pub async fn call_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "transient API error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(
                        attempts = policy.max_attempts,
                        error = %err,
                        "transient API error persisted, aborting"
                    );
                }
                return Err(err);
            }
        }
    }
}
