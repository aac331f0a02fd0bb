//! Resolved configuration for connectors, receivers and the runtime.
//!
//! Everything here is plain serde data with defaults, so a TOML file only
//! needs to name the values it changes:
//!
//! ```toml
//! [runtime]
//! shutdown_timeout_ms = 2000
//!
//! [connector]
//! name = "orders"
//! protocol = "memory"
//!
//! [connector.retry]
//! count = 5
//! asynchronous = true
//! ```

pub mod pool;
pub mod retry;
pub mod threading;
pub mod user;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, ConnectorResult};

pub use pool::ObjectPoolConfig;
pub use retry::RetryPolicyConfig;
pub use threading::{ThreadingProfile, WhenExhausted};
pub use user::user_config_path;

/// Runtime-wide values shared by every connector.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bound for task pool disposal, scheduler shutdown and poll drain
    pub shutdown_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5000,
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub name: String,
    pub protocol: String,
    /// Extra protocols this connector accepts, e.g. `"memory:async"`
    pub supported_protocols: Vec<String>,
    /// Operator override: `start()` does nothing until changed
    pub initial_state_stopped: bool,
    /// Re-validate the failed component before a retry instead of reconnecting everything
    pub validate_connections: bool,
    pub create_multiple_transacted_receivers: bool,
    pub number_of_concurrent_transacted_receivers: usize,
    /// How long receivers wait for the runtime to start under an asynchronous retry policy
    pub context_start_timeout_ms: u64,
    pub receiver_threading: ThreadingProfile,
    pub dispatcher_threading: ThreadingProfile,
    pub requester_threading: ThreadingProfile,
    pub dispatcher_pool: ObjectPoolConfig,
    pub requester_pool: ObjectPoolConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyConfig>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: "connector".to_string(),
            protocol: "memory".to_string(),
            supported_protocols: Vec::new(),
            initial_state_stopped: false,
            validate_connections: true,
            create_multiple_transacted_receivers: true,
            number_of_concurrent_transacted_receivers: 4,
            context_start_timeout_ms: 15_000,
            receiver_threading: ThreadingProfile::default(),
            dispatcher_threading: ThreadingProfile::default(),
            requester_threading: ThreadingProfile::default(),
            dispatcher_pool: ObjectPoolConfig::default(),
            requester_pool: ObjectPoolConfig::default(),
            retry: None,
        }
    }
}

impl ConnectorConfig {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            ..Default::default()
        }
    }

    pub fn context_start_timeout(&self) -> Duration {
        Duration::from_millis(self.context_start_timeout_ms)
    }

    pub fn validate(&self) -> ConnectorResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConnectorError::config("connector name must not be empty"));
        }
        if self.protocol.trim().is_empty() {
            return Err(ConnectorError::config(format!(
                "connector '{}' has no protocol",
                self.name
            )));
        }
        if self.number_of_concurrent_transacted_receivers == 0 {
            return Err(ConnectorError::config(
                "number_of_concurrent_transacted_receivers must be at least 1",
            ));
        }
        for (role, profile) in [
            ("receiver", &self.receiver_threading),
            ("dispatcher", &self.dispatcher_threading),
            ("requester", &self.requester_threading),
        ] {
            profile.validate(role).map_err(ConnectorError::config)?;
        }
        Ok(())
    }
}

/// Polling receiver settings used by the command line runner.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub address: String,
    pub frequency_ms: u64,
    pub transacted: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            address: "in".to_string(),
            frequency_ms: 1000,
            transacted: false,
        }
    }
}

impl ReceiverConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }
}

/// Top-level layout of a configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub runtime: RuntimeConfig,
    pub connector: ConnectorConfig,
    pub receiver: ReceiverConfig,
}

impl Settings {
    pub fn validate(&self) -> ConnectorResult<()> {
        self.connector.validate()?;
        if self.receiver.frequency_ms == 0 {
            return Err(ConnectorError::config("receiver frequency_ms must be positive"));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> ConnectorResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConnectorError::config(e.to_string()))
    }
}

/// Parse and validate settings from TOML text.
pub fn parse_config(text: &str) -> ConnectorResult<Settings> {
    let settings: Settings =
        toml::from_str(text).map_err(|e| ConnectorError::config(e.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from a TOML file.
pub fn load_config(path: &Path) -> ConnectorResult<Settings> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text).map_err(|e| match e {
        ConnectorError::Config { message } => {
            ConnectorError::config(format!("{}: {}", path.display(), message))
        }
        other => other,
    })
}

/// Resolve settings: an explicit file wins, then the user config file if it
/// exists, then built-in defaults.
pub fn load_settings(explicit: Option<&Path>) -> ConnectorResult<Settings> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    match user_config_path() {
        Some(path) if path.is_file() => {
            log::debug!(
                target: "connector_runtime::config",
                "Loading user config from {}",
                path.display()
            );
            load_config(&path)
        }
        _ => Ok(Settings::default()),
    }
}
