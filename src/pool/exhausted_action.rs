use std::fmt;

use serde::{Deserialize, Serialize};

/// What `borrow` does when a key (or the whole pool) is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Fail immediately with `ResourceUnavailable`
    Fail,
    /// Wait for an object to be returned, up to the pool's max wait
    Block,
    /// Create a new object beyond the configured caps
    #[default]
    Grow,
}

impl fmt::Display for ExhaustedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExhaustedAction::Fail => "fail",
            ExhaustedAction::Block => "block",
            ExhaustedAction::Grow => "grow",
        };
        f.write_str(name)
    }
}
