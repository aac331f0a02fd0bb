//! Per-role task pool sizing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a task pool does when all workers are busy and the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenExhausted {
    /// Wait for queue space, up to `thread_wait_timeout_ms`
    Wait,
    /// Silently drop the new work
    Discard,
    /// Drop the oldest queued work and enqueue the new one
    DiscardOldest,
    /// Reject the new work with an error
    Abort,
    /// Run the work on the submitting task
    #[default]
    Run,
}

/// Sizing and exhaustion policy for one of the connector's task pools
/// (receiving, dispatching or requesting).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreadingProfile {
    pub max_threads_active: usize,
    pub max_threads_idle: usize,
    pub thread_ttl_ms: u64,
    /// Queue capacity; 0 means unbounded
    pub max_buffer_size: usize,
    pub thread_wait_timeout_ms: u64,
    pub pool_exhausted_action: WhenExhausted,
}

impl Default for ThreadingProfile {
    fn default() -> Self {
        Self {
            max_threads_active: 16,
            max_threads_idle: 1,
            thread_ttl_ms: 60_000,
            max_buffer_size: 0,
            thread_wait_timeout_ms: 30_000,
            pool_exhausted_action: WhenExhausted::Run,
        }
    }
}

impl ThreadingProfile {
    pub fn thread_ttl(&self) -> Duration {
        Duration::from_millis(self.thread_ttl_ms)
    }

    pub fn thread_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.thread_wait_timeout_ms)
    }

    pub(crate) fn validate(&self, role: &str) -> Result<(), String> {
        if self.max_threads_active == 0 {
            return Err(format!("{role} profile: max_threads_active must be at least 1"));
        }
        if self.max_threads_idle > self.max_threads_active {
            return Err(format!(
                "{role} profile: max_threads_idle ({}) exceeds max_threads_active ({})",
                self.max_threads_idle, self.max_threads_active
            ));
        }
        Ok(())
    }
}
