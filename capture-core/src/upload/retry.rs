//! Per-part retry policy with linear backoff

use std::time::Duration;
use tracing::warn;

use crate::error::CaptureError;

/// Retry policy for batch part uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per part, first try included
    pub max_attempts: u32,
    /// Delay after the first failure; grows by this amount per attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Whether a failure on 1-indexed `attempt` earns another try
    pub fn should_retry(&self, attempt: u32, error: &CaptureError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Delay after a failure on 1-indexed `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Sleep out the backoff for `attempt`
    pub async fn wait_before_retry(&self, attempt: u32, part_number: u32) {
        let delay = self.delay_for(attempt);
        warn!(
            "Part {} attempt {}/{} failed, retrying in {:?}",
            part_number, attempt, self.max_attempts, delay
        );
        tokio::time::sleep(delay).await;
    }
}
