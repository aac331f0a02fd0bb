//! Error handling types for the connector runtime.
//!
//! This module provides the error taxonomy shared by connectors, receivers,
//! pools and work managers.

use std::fmt;
use std::sync::{Arc, PoisonError};

use thiserror::Error;

use crate::lifecycle::{LifecyclePhase, LifecycleState};

/// Boxed error returned by transport hooks and pooled objects.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Component that failed to connect.
///
/// Carried by [`ConnectorError::Connect`] so that a retry attempt can
/// re-validate the failed component instead of repeating a full connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Connectable {
    /// The connector itself (`do_connect` failed)
    Connector(String),
    /// A receiver registered on the connector, identified by its receiver key
    Receiver(String),
}

impl fmt::Display for Connectable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectable::Connector(name) => write!(f, "connector '{}'", name),
            Connectable::Receiver(key) => write!(f, "receiver '{}'", key),
        }
    }
}

/// Comprehensive error type for connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Initialisation failed; the component is unusable
    #[error("Failed to initialise {component}: {message}")]
    Initialisation {
        component: String,
        message: String,
        #[source]
        source: Option<Box<ConnectorError>>,
    },

    /// A lifecycle phase was requested out of order
    #[error("Illegal lifecycle transition for {component}: cannot fire {requested} while {current}")]
    IllegalLifecycleTransition {
        component: String,
        current: LifecycleState,
        requested: LifecyclePhase,
    },

    /// Generic lifecycle failure (use of a disposed connector, phase callback error, ...)
    #[error("Lifecycle error for {component}: {message}")]
    Lifecycle {
        component: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Connecting a connector or receiver failed
    #[error("Failed to connect {failed}: {message}")]
    Connect {
        failed: Connectable,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A pooled resource could not be obtained
    #[error("Resource unavailable: {message}")]
    ResourceUnavailable { message: String },

    /// Caller supplied an invalid argument (unsupported protocol, duplicate listener, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A task pool refused a unit of work
    #[error("Work rejected by pool '{pool}': {message}")]
    WorkRejected { pool: String, message: String },

    /// A borrowed dispatcher failed while in use
    #[error("Failed to dispatch to {endpoint}")]
    Dispatch {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    /// A borrowed requester failed while in use
    #[error("Failed to request from {endpoint}")]
    Request {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    /// A polling receiver's poll failed
    #[error("Poll failed for receiver {receiver}")]
    Poll {
        receiver: String,
        #[source]
        source: BoxError,
    },

    /// An interruptible wait was interrupted
    #[error("Interrupted while {during}")]
    Interrupted { during: String },

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure shared between the retry context and its callers
    #[error(transparent)]
    Shared(Arc<ConnectorError>),
}

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Helper trait to recover a poisoned std lock with logging.
pub trait LockResultExt<T> {
    /// Recover the guard from a poisoned lock.
    ///
    /// The context parameter identifies which operation triggered lock recovery,
    /// helping developers debug thread safety issues.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "connector_runtime::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Helper functions for common error patterns
impl ConnectorError {
    /// Create an initialisation error wrapping a lower-level failure
    pub fn initialisation(component: impl Into<String>, source: ConnectorError) -> Self {
        ConnectorError::Initialisation {
            component: component.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(component: impl Into<String>, message: impl Into<String>) -> Self {
        ConnectorError::Lifecycle {
            component: component.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a lifecycle error caused by a transport failure
    pub fn lifecycle_with_source(
        component: impl Into<String>,
        message: impl Into<String>,
        source: BoxError,
    ) -> Self {
        ConnectorError::Lifecycle {
            component: component.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a connect error for a failed component
    pub fn connect(failed: Connectable, message: impl Into<String>, source: Option<BoxError>) -> Self {
        ConnectorError::Connect {
            failed,
            message: message.into(),
            source,
        }
    }

    /// Create a resource unavailable error
    pub fn resource_unavailable(message: impl Into<String>) -> Self {
        ConnectorError::ResourceUnavailable {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        ConnectorError::InvalidArgument(message.into())
    }

    /// Create an interrupted error
    pub fn interrupted(during: impl Into<String>) -> Self {
        ConnectorError::Interrupted {
            during: during.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        ConnectorError::Config {
            message: message.into(),
        }
    }

    /// The failed component, if this is (or wraps) a connect error.
    pub fn connect_failure(&self) -> Option<&Connectable> {
        match self {
            ConnectorError::Connect { failed, .. } => Some(failed),
            ConnectorError::Shared(inner) => inner.connect_failure(),
            _ => None,
        }
    }

    /// True if this error is (or wraps) an illegal lifecycle transition.
    pub fn is_illegal_transition(&self) -> bool {
        match self {
            ConnectorError::IllegalLifecycleTransition { .. } => true,
            ConnectorError::Shared(inner) => inner.is_illegal_transition(),
            _ => false,
        }
    }
}
