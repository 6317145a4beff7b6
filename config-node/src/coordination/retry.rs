use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff for connecting to the coordination service
///
/// Retry `n` (0-based) waits `base_delay * 2^n`, capped at `max_delay`.
/// With the defaults the three retries wait 1s, 2s and 4s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Upper bound for a single delay (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_retries: 3,
            max_delay_ms: 4000,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retries_done` retries
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
