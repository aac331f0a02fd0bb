//! Connect / disconnect protocol for [`Connector`].

use std::sync::{Arc, Weak};
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;

use super::{Connector, ConnectorInner, LOG_TARGET};
use crate::context::ConnectionAction;
use crate::error::{Connectable, ConnectorError, ConnectorResult};
use crate::retry::{RetryCallback, RetryContext};

/// Connect attempt run under the connector's retry policy.
///
/// Only the connect is retried. A start pending on the connector runs
/// once it succeeds: on the caller after [`RetryPolicy::execute`] returns,
/// or at the end of the attempt when the policy runs in the background.
///
/// [`RetryPolicy::execute`]: crate::retry::RetryPolicy::execute
struct ConnectWork {
    connector: Weak<ConnectorInner>,
    description: String,
    in_background: bool,
}

impl ConnectWork {
    fn connector(&self) -> ConnectorResult<Connector> {
        Connector::from_weak(&self.connector).ok_or_else(|| {
            ConnectorError::lifecycle(&self.description, "connector dropped while connecting")
        })
    }
}

#[async_trait]
impl RetryCallback for ConnectWork {
    async fn do_work(&self, context: &RetryContext) -> ConnectorResult<()> {
        let connector = self.connector()?;
        let _connection = connector.inner.connection_lock.lock().await;

        if connector.inner.interrupt.is_cancelled() {
            return Err(ConnectorError::interrupted(format!(
                "connecting {}",
                self.description
            )));
        }
        if connector.is_connected() {
            connector.inner.connecting.store(false, Ordering::Release);
            return Ok(());
        }

        if connector.inner.config.validate_connections {
            let failed = context
                .last_failure()
                .and_then(|failure| failure.connect_failure())
                .cloned();
            if let Some(failed) = failed {
                connector.validate_connectable(&failed).await?;
            }
        }

        connector.connect_connector_and_receivers().await?;

        if self.in_background
            && !connector.inner.interrupt.is_cancelled()
            && let Err(e) = connector.start_if_pending().await
        {
            error!(
                target: LOG_TARGET,
                "Failed to start {} after connecting: {}",
                connector.name(),
                e
            );
        }
        Ok(())
    }

    fn work_description(&self) -> String {
        self.description.clone()
    }

    fn retries_exhausted(&self, context: &RetryContext) {
        let Ok(connector) = self.connector() else {
            return;
        };
        connector.inner.connecting.store(false, Ordering::Release);
        error!(
            target: LOG_TARGET,
            "Giving up connecting {} after {} attempt(s)",
            self.description,
            context.attempts()
        );
        connector.notify(ConnectionAction::ConnectFailed);
    }
}

impl Connector {
    /// Connect the transport and every registered receiver under the retry
    /// policy.
    ///
    /// Only one connect runs at a time. A call made while another is in
    /// flight returns immediately without waiting for it; callers that
    /// need the outcome observe [`is_connected`](Self::is_connected).
    pub async fn connect(&self) -> ConnectorResult<()> {
        if self.is_disposed() {
            return Err(ConnectorError::lifecycle(
                self.name(),
                "cannot connect a disposed connector",
            ));
        }
        if self.is_connected() {
            return Ok(());
        }
        if self
            .inner
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(target: LOG_TARGET, "Connect of {} already in progress", self.name());
            return Ok(());
        }

        let policy = self.retry_policy();
        let work = Arc::new(ConnectWork {
            connector: self.downgrade(),
            description: self.connection_description(),
            in_background: policy.is_asynchronous(),
        });

        match policy
            .execute(work, Some(&Handle::current()), &self.inner.interrupt)
            .await
        {
            Ok(context) => {
                if context.is_scheduled() {
                    info!(
                        target: LOG_TARGET,
                        "Connecting {} in the background",
                        self.connection_description()
                    );
                    return Ok(());
                }
                self.start_if_pending().await
            }
            Err(e) => {
                self.inner.connecting.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// One connect attempt: the transport, then every receiver. Called with
    /// the connection lock held.
    async fn connect_connector_and_receivers(&self) -> ConnectorResult<()> {
        if let Err(e) = self.inner.hooks.do_connect().await {
            return Err(ConnectorError::connect(
                Connectable::Connector(self.name().to_string()),
                format!("could not connect {}", self.connection_description()),
                Some(e),
            ));
        }

        let mut first_error = None;
        for receiver in self.receivers() {
            let result = async {
                receiver.connect().await?;
                if self.is_started() {
                    receiver.start().await?;
                }
                Ok::<(), ConnectorError>(())
            }
            .await;
            if let Err(e) = result {
                error!(
                    target: LOG_TARGET,
                    "Failed to connect receiver {}: {}",
                    receiver.resource_id(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.inner.connected.store(true, Ordering::Release);
        self.inner.connecting.store(false, Ordering::Release);
        info!(target: LOG_TARGET, "Connected: {}", self.connection_description());
        self.notify(ConnectionAction::Connected);
        Ok(())
    }

    /// Run the start a `start()` or `disconnect()` left pending, if any.
    async fn start_if_pending(&self) -> ConnectorResult<()> {
        let state = self.state();
        if self.inner.start_on_connect.load(Ordering::Acquire)
            && self.is_connected()
            && !state.is_started()
            && !state.is_starting()
        {
            self.start_after_connect().await?;
        }
        Ok(())
    }

    /// Wait for an in-flight connect attempt to finish, then hold off any
    /// later one while the connector is torn down.
    pub(crate) async fn lock_connection(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.connection_lock.lock().await
    }

    /// Disconnect receivers and the transport, stopping first if started.
    ///
    /// A connector stopped here restarts on its next successful connect.
    /// The connected flag is cleared even when disconnecting fails.
    pub async fn disconnect(&self) -> ConnectorResult<()> {
        if !self.is_connected() && !self.is_started() {
            return Ok(());
        }

        let result = async {
            if self.is_started() {
                self.inner.start_on_connect.store(true, Ordering::Release);
                self.stop().await?;
            }

            for receiver in self.receivers() {
                if let Err(e) = receiver.disconnect().await {
                    warn!(
                        target: LOG_TARGET,
                        "Failed to disconnect receiver {}: {}",
                        receiver.resource_id(),
                        e
                    );
                }
            }

            self.inner.hooks.do_disconnect().await.map_err(|e| {
                ConnectorError::lifecycle_with_source(self.name(), "transport disconnect failed", e)
            })?;

            info!(target: LOG_TARGET, "Disconnected: {}", self.connection_description());
            self.notify(ConnectionAction::Disconnected);
            Ok::<(), ConnectorError>(())
        }
        .await;

        self.inner.connected.store(false, Ordering::Release);
        result
    }

    /// Ask the transport whether its connection is still usable.
    pub async fn validate_connection(&self) -> ConnectorResult<()> {
        self.inner.hooks.validate_connection().await.map_err(|e| {
            ConnectorError::connect(
                Connectable::Connector(self.name().to_string()),
                "connection validation failed",
                Some(e),
            )
        })
    }

    async fn validate_connectable(&self, failed: &Connectable) -> ConnectorResult<()> {
        match failed {
            Connectable::Connector(_) => self.validate_connection().await,
            Connectable::Receiver(key) => match self.lookup_receiver(key) {
                Some(receiver) => receiver.validate_connection().await,
                None => Ok(()),
            },
        }
    }
}
