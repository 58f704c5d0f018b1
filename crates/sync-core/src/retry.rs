use std::time::Duration;

/// Linear reconnect backoff with a bounded number of consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    max_retries: u32,
}

impl ReconnectPolicy {
    /// `max_retries` is clamped to at least 1.
    pub fn new(base_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_retries: max_retries.max(1),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the attempt following failure number `failure_count`.
    ///
    /// `base * failure_count`, so the sequence never decreases for a handle.
    pub fn delay_for_failure(&self, failure_count: u32) -> Duration {
        let multiplier = u64::from(failure_count.max(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }

    /// Whether another attempt is allowed after `failure_count` failures.
    pub fn should_retry(&self, failure_count: u32) -> bool {
        failure_count < self.max_retries
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(1_000, 3)
    }
}
