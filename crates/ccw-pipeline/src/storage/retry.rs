//! Retry with exponential backoff for object store calls
//!
//! Only [`PipelineError::is_transient`] failures are retried; everything else
//! is returned on the first attempt.

use ccw_common::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of attempts, including the first one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay before the second attempt; doubled for each attempt after that
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Upper bound for a single backoff delay
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS).max(base_delay),
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            },
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient object store failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(PipelineError::TransientStore(message)) => {
                return Err(PipelineError::TransientStore(format!(
                    "{} failed after {} attempts: {}",
                    operation, max_attempts, message
                )));
            },
            Err(e) => return Err(e),
        }
    }
}
