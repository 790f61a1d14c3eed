use std::time::Duration;

use rand::Rng;

use crate::config::SessionConfig;

/// Exponential backoff with a cap and full jitter, used for transient fetch,
/// segment builder and metadata store errors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Duration,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            2,
            Duration::from_millis(config.retry_backoff_base_ms),
            Duration::from_millis(config.retry_backoff_max_ms),
        )
    }

    /// Upper bound of the wait before retry number `attempt` (zero-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        self.initial_interval
            .checked_mul(factor)
            .map_or(self.maximum_interval, |d| d.min(self.maximum_interval))
    }

    /// Time to wait before retry number `attempt`: uniformly drawn from
    /// `[ceiling / 2, ceiling]`.
    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let millis = ceiling.as_millis() as u64;
        if millis < 2 {
            return ceiling;
        }
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(100),
            maximum_interval: Duration::from_secs(10),
        }
    }
}
