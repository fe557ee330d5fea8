//! Exponential backoff for transient provider failures.
//!
//! Only errors tagged [`Transient`] are retried: timeouts, refused
//! connections, rate limiting and 5xx replies. Everything else (bad requests,
//! auth failures, unparseable replies) fails on the first attempt.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// A failure worth another attempt.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Transient(pub String);

/// Backoff schedule for one provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

pub fn is_retryable(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Transient>())
}

/// Run `operation` until it succeeds, fails permanently, or the retries run out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    provider: &str,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.max_retries + 1;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}/{}", provider, attempt, attempts);
                }
                return Ok(value);
            }
            Err(e) if is_retryable(&e) && attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} attempt {}/{} failed: {:#}; retrying in {}ms",
                    provider,
                    attempt,
                    attempts,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    warn!("{} failed after {} attempts", provider, attempt);
                }
                return Err(e);
            }
        }
    }
}
