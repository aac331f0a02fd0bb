//! Shutdown timeout shared by task pools, the scheduler and poll drains.

use std::time::Duration;

use crate::error::{ConnectorError, ConnectorResult};

/// Bounded wait applied to every graceful shutdown step of a connector.
///
/// One value is used uniformly for task pool disposal, scheduler shutdown
/// and the wait for an in-flight poll to finish when a polling receiver is
/// stopped. When it expires the remaining work is cancelled.
///
/// # Valid Range
///
/// - Minimum: 0 (do not wait; cancel immediately)
/// - Maximum: 10 minutes
/// - Default: 5 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTimeout(Duration);

impl ShutdownTimeout {
    const DEFAULT_MILLIS: u64 = 5000;

    const MAX_SECS: u64 = 600;

    /// Wait granted to cancelled scheduler tasks after the graceful timeout
    /// has already expired.
    pub const FORCED: ShutdownTimeout = ShutdownTimeout(Duration::from_millis(5000));

    pub fn new(duration: Duration) -> ConnectorResult<Self> {
        if duration > Duration::from_secs(Self::MAX_SECS) {
            return Err(ConnectorError::config(format!(
                "shutdown timeout must be at most {}s, got {:?}",
                Self::MAX_SECS,
                duration
            )));
        }
        Ok(Self(duration))
    }

    pub fn from_millis(millis: u64) -> ConnectorResult<Self> {
        Self::new(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for ShutdownTimeout {
    fn default() -> Self {
        Self(Duration::from_millis(Self::DEFAULT_MILLIS))
    }
}
