//! Collaborators supplied by the surrounding runtime.
//!
//! The connector core does not own flows, the notification bus or cluster
//! membership; it consumes them through the types in this module.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::error::{ConnectorError, ConnectorResult, LockResultExt};
use crate::message::Message;
use crate::work::ShutdownTimeout;

/// Downstream consumer of the messages a receiver produces.
#[async_trait]
pub trait FlowConstruct: Send + Sync {
    fn name(&self) -> &str;

    fn is_started(&self) -> bool;

    /// Route one inbound message. Returns the response, if the flow has one.
    async fn process(&self, message: Message) -> ConnectorResult<Option<Message>>;

    /// Failure raised on behalf of this flow outside a `process` call.
    fn handle_exception(&self, error: &ConnectorError) {
        error!(
            target: "connector_runtime::receiver",
            "Unhandled error in flow {}: {}",
            self.name(),
            error
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Connected,
    ConnectFailed,
    Disconnected,
}

impl fmt::Display for ConnectionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionAction::Connected => "connected",
            ConnectionAction::ConnectFailed => "connect failed",
            ConnectionAction::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Connect/disconnect event for a connector or receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionNotification {
    /// Connector name, or `connector/receiver-key` for receivers
    pub resource_id: String,
    pub action: ConnectionAction,
}

pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, notification: &ConnectionNotification);
}

/// Runtime-wide state shared by every connector.
pub struct RuntimeContext {
    shutdown_timeout: ShutdownTimeout,
    started: watch::Sender<bool>,
    primary: watch::Sender<bool>,
    listeners: RwLock<Vec<Arc<dyn NotificationListener>>>,
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("started", &self.is_started())
            .field("primary", &self.is_primary())
            .finish()
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::with_shutdown_timeout(ShutdownTimeout::default())
    }
}

impl RuntimeContext {
    pub fn new(config: &RuntimeConfig) -> ConnectorResult<Self> {
        Ok(Self::with_shutdown_timeout(ShutdownTimeout::new(
            config.shutdown_timeout(),
        )?))
    }

    /// Single-node context: this node is primary, the runtime not yet started.
    pub fn with_shutdown_timeout(shutdown_timeout: ShutdownTimeout) -> Self {
        Self {
            shutdown_timeout,
            started: watch::Sender::new(false),
            primary: watch::Sender::new(true),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn shutdown_timeout(&self) -> ShutdownTimeout {
        self.shutdown_timeout
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    pub fn set_started(&self, started: bool) {
        self.started.send_replace(started);
    }

    /// Wait for the runtime to report started.
    ///
    /// Returns `Ok(false)` if `timeout` elapses first.
    pub async fn wait_until_started(
        &self,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> ConnectorResult<bool> {
        let mut started = self.started.subscribe();
        tokio::select! {
            _ = interrupt.cancelled() => {
                Err(ConnectorError::interrupted("waiting for the runtime to start"))
            }
            result = tokio::time::timeout(timeout, started.wait_for(|started| *started)) => {
                Ok(matches!(result, Ok(Ok(_))))
            }
        }
    }

    pub fn is_primary(&self) -> bool {
        *self.primary.borrow()
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.send_if_modified(|current| {
            let changed = *current != primary;
            *current = primary;
            changed
        });
    }

    /// Observe cluster primary changes.
    pub fn subscribe_primary(&self) -> watch::Receiver<bool> {
        self.primary.subscribe()
    }

    pub fn register_listener(&self, listener: Arc<dyn NotificationListener>) {
        self.listeners
            .write()
            .recover_poison("RuntimeContext::register_listener()")
            .push(listener);
    }

    pub fn publish(&self, notification: ConnectionNotification) {
        debug!(
            target: "connector_runtime::connector",
            "{} {}",
            notification.resource_id,
            notification.action
        );
        let listeners = self
            .listeners
            .read()
            .recover_poison("RuntimeContext::publish()")
            .clone();
        for listener in listeners {
            listener.on_notification(&notification);
        }
    }
}
