//! The connector aggregate.
//!
//! A [`Connector`] manages one transport's connectivity and shared
//! resources: its lifecycle, the connect/disconnect protocol driven by a
//! [`RetryPolicy`], the registry of inbound receivers, pooled dispatchers
//! and requesters, the per-role task pools and the polling scheduler.
//!
//! Connect state is orthogonal to the lifecycle: a connector may be started
//! while a retrying connect is still in flight. Receivers are started once
//! the connect completes.
//!
//! Transport behaviour is supplied through [`TransportHooks`]. The `impl`
//! of [`Connector`] is split by concern:
//!
//! - `lifecycle.rs`: initialise / start / stop / dispose
//! - `connection.rs`: connect / disconnect and the retried connect work
//! - `registry.rs`: listener registration and supported protocols
//! - `dispatch.rs`: outbound send / dispatch / request and pool capacity

mod connection;
mod dispatch;
mod hooks;
mod lifecycle;
mod registry;

pub use dispatch::{DispatcherPool, RequesterPool};
pub use hooks::{
    DispatcherFactory, MessageDispatcher, MessageRequester, RequesterFactory, TransportHooks,
};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectorConfig;
use crate::context::{ConnectionAction, ConnectionNotification, RuntimeContext};
use crate::error::{ConnectorError, ConnectorResult};
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::receiver::MessageReceiver;
use crate::retry::RetryPolicy;
use crate::work::{BoundedTaskPool, PeriodicScheduler};

pub(crate) const LOG_TARGET: &str = "connector_runtime::connector";

/// Handle to a connector. Cloning yields another handle to the same connector.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

pub(crate) struct ConnectorInner {
    config: ConnectorConfig,
    hooks: Arc<dyn TransportHooks>,
    runtime: Arc<RuntimeContext>,
    lifecycle: LifecycleManager,
    connected: AtomicBool,
    /// Set while a connect attempt (including its retries) is in flight
    connecting: AtomicBool,
    /// Start once the in-flight connect completes
    start_on_connect: AtomicBool,
    initial_state_stopped: AtomicBool,
    retry_policy: ArcSwapOption<RetryPolicy>,
    receivers: DashMap<String, Arc<MessageReceiver>>,
    /// Serialises connect attempts with listener registration
    connection_lock: tokio::sync::Mutex<()>,
    receiver_pool: ArcSwapOption<BoundedTaskPool>,
    dispatcher_task_pool: ArcSwapOption<BoundedTaskPool>,
    requester_task_pool: ArcSwapOption<BoundedTaskPool>,
    scheduler: ArcSwapOption<PeriodicScheduler>,
    dispatchers: ArcSwapOption<DispatcherPool>,
    requesters: ArcSwapOption<RequesterPool>,
    /// Lower-cased protocols this connector accepts
    supported_protocols: RwLock<BTreeSet<String>>,
    /// Cancelled on dispose; aborts retry back-off, runtime-start waits and
    /// blocked pool borrows
    interrupt: CancellationToken,
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        self.interrupt.cancel();
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name())
            .field("protocol", &self.protocol())
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .field("receivers", &self.inner.receivers.len())
            .finish()
    }
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        hooks: Arc<dyn TransportHooks>,
        runtime: Arc<RuntimeContext>,
    ) -> ConnectorResult<Self> {
        config.validate()?;

        let protocol = config.protocol.to_ascii_lowercase();
        let mut supported_protocols = BTreeSet::from([protocol.clone()]);
        for extra in &config.supported_protocols {
            supported_protocols.insert(registry::qualify_protocol(&protocol, extra));
        }

        Ok(Self {
            inner: Arc::new(ConnectorInner {
                lifecycle: LifecycleManager::new(config.name.clone()),
                initial_state_stopped: AtomicBool::new(config.initial_state_stopped),
                config,
                hooks,
                runtime,
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                start_on_connect: AtomicBool::new(false),
                retry_policy: ArcSwapOption::empty(),
                receivers: DashMap::new(),
                connection_lock: tokio::sync::Mutex::new(()),
                receiver_pool: ArcSwapOption::empty(),
                dispatcher_task_pool: ArcSwapOption::empty(),
                requester_task_pool: ArcSwapOption::empty(),
                scheduler: ArcSwapOption::empty(),
                dispatchers: ArcSwapOption::empty(),
                requesters: ArcSwapOption::empty(),
                supported_protocols: RwLock::new(supported_protocols),
                interrupt: CancellationToken::new(),
            }),
        })
    }

    pub(crate) fn from_weak(inner: &Weak<ConnectorInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectorInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn protocol(&self) -> &str {
        &self.inner.config.protocol
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.inner.runtime
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    pub fn is_started(&self) -> bool {
        self.state().is_started()
    }

    pub fn is_disposed(&self) -> bool {
        self.state().is_disposed()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::Acquire)
    }

    pub fn is_initial_state_stopped(&self) -> bool {
        self.inner.initial_state_stopped.load(Ordering::Acquire)
    }

    /// Operator override: while set, `start()` leaves the connector stopped.
    pub fn set_initial_state_stopped(&self, stopped: bool) {
        self.inner
            .initial_state_stopped
            .store(stopped, Ordering::Release);
    }

    /// Retry policy built at initialise; no retries before that.
    pub fn retry_policy(&self) -> Arc<RetryPolicy> {
        self.inner
            .retry_policy
            .load_full()
            .unwrap_or_else(|| Arc::new(RetryPolicy::default()))
    }

    /// Human readable description of what this connector connects to.
    pub fn connection_description(&self) -> String {
        self.inner
            .hooks
            .connection_description()
            .unwrap_or_else(|| format!("{} ({})", self.name(), self.protocol()))
    }

    pub fn receiver_task_pool(&self) -> ConnectorResult<Arc<BoundedTaskPool>> {
        self.inner
            .receiver_pool
            .load_full()
            .ok_or_else(|| self.not_available("receiver task pool"))
    }

    pub fn dispatcher_task_pool(&self) -> ConnectorResult<Arc<BoundedTaskPool>> {
        self.inner
            .dispatcher_task_pool
            .load_full()
            .ok_or_else(|| self.not_available("dispatcher task pool"))
    }

    pub fn requester_task_pool(&self) -> ConnectorResult<Arc<BoundedTaskPool>> {
        self.inner
            .requester_task_pool
            .load_full()
            .ok_or_else(|| self.not_available("requester task pool"))
    }

    /// Scheduler for polling receivers. Only present while started.
    pub fn scheduler(&self) -> ConnectorResult<Arc<PeriodicScheduler>> {
        self.inner
            .scheduler
            .load_full()
            .ok_or_else(|| self.not_available("scheduler"))
    }

    fn not_available(&self, what: &str) -> ConnectorError {
        ConnectorError::lifecycle(
            self.name(),
            format!("{what} is not available in state {}", self.state()),
        )
    }

    fn notify(&self, action: ConnectionAction) {
        self.inner.runtime.publish(ConnectionNotification {
            resource_id: self.name().to_string(),
            action,
        });
    }
}
