//! Inbound message receivers.
//!
//! A [`MessageReceiver`] is the listener a connector creates for one
//! inbound endpoint. It owns the receiver's lifecycle, its connected flag
//! and the cluster rule deciding whether this node may consume at all; the
//! transport-specific work is supplied by a [`ReceiverHooks`]
//! implementation. [`PollingMessageReceiver`] is the stock hooks
//! implementation for transports that have to be polled.

mod hooks;
mod polling;
mod schedule;

pub use hooks::ReceiverHooks;
pub use polling::{PollingMessageReceiver, Poller};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, info, warn};
use tokio::task::AbortHandle;

use crate::connector::{Connector, ConnectorInner};
use crate::context::{ConnectionAction, ConnectionNotification, FlowConstruct, RuntimeContext};
use crate::endpoint::Endpoint;
use crate::error::{BoxError, Connectable, ConnectorError, ConnectorResult, LockResultExt};
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::message::Message;

pub(crate) const LOG_TARGET: &str = "connector_runtime::receiver";

/// Listener bound to one inbound endpoint on behalf of one flow.
pub struct MessageReceiver {
    key: String,
    endpoint: Endpoint,
    flow: Arc<dyn FlowConstruct>,
    connector: Weak<ConnectorInner>,
    connector_name: String,
    runtime: Arc<RuntimeContext>,
    hooks: Arc<dyn ReceiverHooks>,
    lifecycle: LifecycleManager,
    connected: AtomicBool,
    /// Task waiting for this node to become cluster primary
    primary_listener: Mutex<Option<AbortHandle>>,
}

impl fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("key", &self.key)
            .field("endpoint", &self.endpoint.uri().as_str())
            .field("flow", &self.flow.name())
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MessageReceiver {
    pub(crate) fn new(
        connector: &Connector,
        key: String,
        flow: Arc<dyn FlowConstruct>,
        endpoint: Endpoint,
        hooks: Arc<dyn ReceiverHooks>,
    ) -> Arc<Self> {
        let component = format!("{}/{}", connector.name(), key);
        Arc::new(Self {
            key,
            endpoint,
            flow,
            connector: connector.downgrade(),
            connector_name: connector.name().to_string(),
            runtime: Arc::clone(connector.runtime()),
            hooks,
            lifecycle: LifecycleManager::new(component),
            connected: AtomicBool::new(false),
            primary_listener: Mutex::new(None),
        })
    }

    /// Key the owning connector registered this receiver under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn flow(&self) -> &Arc<dyn FlowConstruct> {
        &self.flow
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    /// `connector/key`, as used in notifications and log lines.
    pub fn resource_id(&self) -> &str {
        self.lifecycle.component()
    }

    /// Owning connector, unless it has already been dropped.
    pub fn connector(&self) -> ConnectorResult<Connector> {
        Connector::from_weak(&self.connector).ok_or_else(|| {
            ConnectorError::lifecycle(
                self.resource_id(),
                format!("connector {} is no longer available", self.connector_name),
            )
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// True only in the `Started` state; a stopping receiver is not started.
    pub fn is_started(&self) -> bool {
        self.state().is_started()
    }

    /// Whether this node may connect and consume for this receiver.
    pub fn allowed_on_this_node(&self) -> bool {
        self.hooks.should_consume_in_every_node() || self.runtime.is_primary()
    }

    pub async fn initialise(self: &Arc<Self>) -> ConnectorResult<()> {
        self.lifecycle
            .fire_initialise_phase(|| async {
                self.hooks.do_initialise(self).await.map_err(|e| {
                    ConnectorError::lifecycle_with_source(self.resource_id(), "initialise failed", e)
                })?;
                if !self.hooks.should_consume_in_every_node() {
                    self.listen_for_primary();
                }
                Ok(())
            })
            .await
            .map_err(|e| {
                if e.is_illegal_transition() {
                    e
                } else {
                    ConnectorError::initialisation(self.resource_id(), e)
                }
            })
    }

    pub async fn connect(self: &Arc<Self>) -> ConnectorResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.state().is_disposed() {
            return Err(ConnectorError::lifecycle(
                self.resource_id(),
                "cannot connect a disposed receiver",
            ));
        }

        if self.allowed_on_this_node() {
            if let Err(e) = self.hooks.do_connect(self).await {
                self.notify(ConnectionAction::ConnectFailed);
                return Err(ConnectorError::connect(
                    Connectable::Receiver(self.key.clone()),
                    format!("receiver for {} could not connect", self.endpoint.uri()),
                    Some(e),
                ));
            }
        } else {
            debug!(
                target: LOG_TARGET,
                "{} is not primary; deferring transport connect",
                self.resource_id()
            );
        }

        self.connected.store(true, Ordering::Release);
        self.notify(ConnectionAction::Connected);
        Ok(())
    }

    pub async fn disconnect(self: &Arc<Self>) -> ConnectorResult<()> {
        if !self.is_connected() {
            return Ok(());
        }

        let result = self.hooks.do_disconnect(self).await;
        self.connected.store(false, Ordering::Release);
        self.notify(ConnectionAction::Disconnected);

        result.map_err(|e| {
            ConnectorError::lifecycle_with_source(self.resource_id(), "disconnect failed", e)
        })
    }

    /// Start consuming, connecting first if needed.
    pub async fn start(self: &Arc<Self>) -> ConnectorResult<()> {
        let state = self.state();
        if state.is_started() || state.is_starting() {
            return Ok(());
        }
        if !self.is_connected() {
            self.connect().await?;
        }

        self.lifecycle
            .fire_start_phase(|| async {
                if !self.allowed_on_this_node() {
                    debug!(
                        target: LOG_TARGET,
                        "{} is not primary; deferring transport start",
                        self.resource_id()
                    );
                    return Ok(());
                }
                self.hooks.do_start(self).await.map_err(|e| {
                    ConnectorError::lifecycle_with_source(self.resource_id(), "start failed", e)
                })
            })
            .await
    }

    /// Stop consuming. The receiver stays connected.
    pub async fn stop(self: &Arc<Self>) -> ConnectorResult<()> {
        self.lifecycle
            .fire_stop_phase(|| async {
                self.hooks.do_stop(self).await.map_err(|e| {
                    ConnectorError::lifecycle_with_source(self.resource_id(), "stop failed", e)
                })
            })
            .await
    }

    /// Stop, disconnect and release the receiver. Stop and disconnect
    /// failures are logged; the dispose hook's failure is returned.
    pub async fn dispose(self: &Arc<Self>) -> ConnectorResult<()> {
        if let Err(e) = self.stop().await {
            warn!(target: LOG_TARGET, "Stopping {} failed during dispose: {}", self.resource_id(), e);
        }
        if let Err(e) = self.disconnect().await {
            warn!(
                target: LOG_TARGET,
                "Disconnecting {} failed during dispose: {}",
                self.resource_id(),
                e
            );
        }
        if let Some(listener) = self
            .primary_listener
            .lock()
            .recover_poison("MessageReceiver::dispose()")
            .take()
        {
            listener.abort();
        }

        self.lifecycle
            .fire_dispose_phase(|| async {
                self.hooks.do_dispose(self).await.map_err(|e| {
                    ConnectorError::lifecycle_with_source(self.resource_id(), "dispose failed", e)
                })
            })
            .await
    }

    /// Transport liveness check, run before retrying a failed connect.
    pub async fn validate_connection(self: &Arc<Self>) -> ConnectorResult<()> {
        self.hooks.validate_connection(self).await.map_err(|e| {
            ConnectorError::connect(
                Connectable::Receiver(self.key.clone()),
                "connection validation failed",
                Some(e),
            )
        })
    }

    /// Hand an inbound message to the flow.
    pub async fn route_message(&self, message: Message) -> ConnectorResult<Option<Message>> {
        self.flow.process(message).await
    }

    /// Report a failure that happened outside a flow call.
    pub fn handle_exception(&self, error: &ConnectorError) {
        self.flow.handle_exception(error);
    }

    fn notify(&self, action: ConnectionAction) {
        self.runtime.publish(ConnectionNotification {
            resource_id: self.resource_id().to_string(),
            action,
        });
    }

    fn listen_for_primary(self: &Arc<Self>) {
        let receiver = Arc::downgrade(self);
        let mut primary = self.runtime.subscribe_primary();

        let task = tokio::spawn(async move {
            while primary.changed().await.is_ok() {
                let is_primary = *primary.borrow_and_update();
                if !is_primary {
                    continue;
                }
                let Some(receiver) = receiver.upgrade() else {
                    return;
                };
                receiver.on_promoted_to_primary().await;
            }
        });

        let previous = self
            .primary_listener
            .lock()
            .recover_poison("MessageReceiver::listen_for_primary()")
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn on_promoted_to_primary(self: &Arc<Self>) {
        if !self.is_started() {
            return;
        }
        info!(
            target: LOG_TARGET,
            "Node became primary; starting {}",
            self.resource_id()
        );

        let result: Result<(), BoxError> = async {
            self.hooks.do_connect(self).await?;
            self.hooks.do_start(self).await
        }
        .await;

        if let Err(e) = result {
            self.handle_exception(&ConnectorError::lifecycle_with_source(
                self.resource_id(),
                "start after primary promotion failed",
                e,
            ));
        }
    }
}
