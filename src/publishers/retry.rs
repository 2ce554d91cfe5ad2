use serde::Deserialize;
use std::time::Duration;

/// Bounded backoff applied to transient publish failures.
///
/// A first retry after `interval_start`, each subsequent retry
/// `interval_step` later, capped at `interval_max`, for at most
/// `max_retries` retries. Application-level remote errors are never retried
/// through this policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_retries")]
    pub max_retries: u32,
    /// Seconds to wait before the first retry.
    #[serde(default = "RetryPolicy::default_interval_start")]
    pub interval_start: u64,
    /// Seconds added to the wait on every further retry.
    #[serde(default = "RetryPolicy::default_interval_step")]
    pub interval_step: u64,
    /// Upper bound on the wait between retries, in seconds.
    #[serde(default = "RetryPolicy::default_interval_max")]
    pub interval_max: u64,
}

impl RetryPolicy {
    fn default_max_retries() -> u32 {
        3
    }
    fn default_interval_start() -> u64 {
        0
    }
    fn default_interval_step() -> u64 {
        2
    }
    fn default_interval_max() -> u64 {
        30
    }

    /// The wait before retry number `retry` (1-based).
    pub fn interval(&self, retry: u32) -> Duration {
        let secs = self
            .interval_start
            .saturating_add(self.interval_step.saturating_mul(retry.saturating_sub(1) as u64))
            .min(self.interval_max);
        Duration::from_secs(secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            interval_start: Self::default_interval_start(),
            interval_step: Self::default_interval_step(),
            interval_max: Self::default_interval_max(),
        }
    }
}
