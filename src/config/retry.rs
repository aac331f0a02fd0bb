use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnection policy settings.
///
/// `count` is the number of retries after the first attempt, so `count = 2`
/// allows three connect attempts in total. `forever` ignores `count`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub count: u32,
    pub forever: bool,
    pub frequency_ms: u64,
    /// Run the retry loop as a separate task and return to the caller at once
    pub asynchronous: bool,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            count: 2,
            forever: false,
            frequency_ms: 2000,
            asynchronous: false,
        }
    }
}

impl RetryPolicyConfig {
    /// Process-wide fallback used when a connector has no policy: one
    /// attempt, on the caller.
    pub fn no_retry() -> Self {
        Self {
            count: 0,
            forever: false,
            frequency_ms: 0,
            asynchronous: false,
        }
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }
}
