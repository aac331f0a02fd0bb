use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::ExhaustedAction;

/// Settings for a dispatcher or requester object pool.
///
/// Per-key capacity is not configured here; it follows the matching
/// threading profile so every worker can hold one pooled object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ObjectPoolConfig {
    pub exhausted_action: ExhaustedAction,
    /// Upper bound on a `Block` borrow; unset waits until an object is returned
    pub max_wait_ms: Option<u64>,
}

impl ObjectPoolConfig {
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }
}
