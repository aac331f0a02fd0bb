//! Outbound traffic through pooled dispatchers and requesters.

use std::sync::Arc;
use std::time::Duration;

use log::error;

use super::{Connector, LOG_TARGET, MessageDispatcher, MessageRequester};
use crate::context::FlowConstruct;
use crate::endpoint::{Endpoint, EndpointUri};
use crate::error::{ConnectorError, ConnectorResult};
use crate::message::Message;
use crate::pool::{ExhaustedAction, KeyedResourcePool, PooledObject};

pub type DispatcherPool = KeyedResourcePool<EndpointUri, Box<dyn MessageDispatcher>>;
pub type RequesterPool = KeyedResourcePool<EndpointUri, Box<dyn MessageRequester>>;

impl Connector {
    /// Request-response send through a pooled dispatcher.
    ///
    /// A streamed response keeps its dispatcher checked out until the
    /// stream is closed or dropped.
    pub async fn send(&self, endpoint: &Endpoint, message: Message) -> ConnectorResult<Option<Message>> {
        let dispatcher = self.borrow_dispatcher(endpoint).await?;
        match dispatcher.send(endpoint, message).await {
            Ok(Some(response)) => Ok(Some(response.release_with(dispatcher))),
            Ok(None) => Ok(None),
            Err(e) => {
                dispatcher.invalidate();
                Err(ConnectorError::Dispatch {
                    endpoint: endpoint.uri().to_string(),
                    source: e,
                })
            }
        }
    }

    /// One-way send, run on the dispatching task pool.
    ///
    /// Returns once the pool has accepted the work. A failure inside the
    /// worker goes to `flow`'s exception handler, or is logged when no flow
    /// is given.
    pub async fn dispatch(
        &self,
        endpoint: Endpoint,
        message: Message,
        flow: Option<Arc<dyn FlowConstruct>>,
    ) -> ConnectorResult<()> {
        self.check_borrowable(&endpoint, "dispatcher")?;
        let pool = self.dispatcher_task_pool()?;
        let connector = self.clone();

        pool.execute(async move {
            if let Err(e) = connector.dispatch_now(&endpoint, message).await {
                match &flow {
                    Some(flow) => flow.handle_exception(&e),
                    None => error!(target: LOG_TARGET, "{}", e),
                }
            }
        })
        .await
    }

    async fn dispatch_now(&self, endpoint: &Endpoint, message: Message) -> ConnectorResult<()> {
        let dispatcher = self.borrow_dispatcher(endpoint).await?;
        match dispatcher.dispatch(endpoint, message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                dispatcher.invalidate();
                Err(ConnectorError::Dispatch {
                    endpoint: endpoint.uri().to_string(),
                    source: e,
                })
            }
        }
    }

    /// Receive one message through a pooled requester, waiting at most
    /// `timeout`.
    ///
    /// A streamed message keeps its requester checked out until the stream
    /// is closed or dropped.
    pub async fn request(&self, endpoint: &Endpoint, timeout: Duration) -> ConnectorResult<Option<Message>> {
        self.check_borrowable(endpoint, "requester")?;
        let requester = self.requester_pool()?.borrow(endpoint.uri()).await?;
        match requester.request(endpoint, timeout).await {
            Ok(Some(message)) => Ok(Some(message.release_with(requester))),
            Ok(None) => Ok(None),
            Err(e) => {
                requester.invalidate();
                Err(ConnectorError::Request {
                    endpoint: endpoint.uri().to_string(),
                    source: e,
                })
            }
        }
    }

    async fn borrow_dispatcher(
        &self,
        endpoint: &Endpoint,
    ) -> ConnectorResult<PooledObject<EndpointUri, Box<dyn MessageDispatcher>>> {
        self.check_borrowable(endpoint, "dispatcher")?;
        self.dispatcher_pool()?.borrow(endpoint.uri()).await
    }

    fn check_borrowable(&self, endpoint: &Endpoint, role: &str) -> ConnectorResult<()> {
        if !self.is_started() {
            return Err(ConnectorError::resource_unavailable(format!(
                "connector {} is not started; cannot obtain a {} for {}",
                self.name(),
                role,
                endpoint.uri()
            )));
        }
        if !self.supports_protocol(endpoint.protocol()) {
            return Err(ConnectorError::invalid_argument(format!(
                "connector {} does not support protocol '{}' of {}",
                self.name(),
                endpoint.protocol(),
                endpoint.uri()
            )));
        }
        Ok(())
    }

    pub fn dispatcher_pool(&self) -> ConnectorResult<Arc<DispatcherPool>> {
        self.inner
            .dispatchers
            .load_full()
            .ok_or_else(|| ConnectorError::lifecycle(self.name(), "Dispatchers pool was not initialised"))
    }

    pub fn requester_pool(&self) -> ConnectorResult<Arc<RequesterPool>> {
        self.inner
            .requesters
            .load_full()
            .ok_or_else(|| ConnectorError::lifecycle(self.name(), "Requesters pool was not initialised"))
    }

    pub fn max_dispatchers_active(&self) -> ConnectorResult<usize> {
        Ok(self.dispatcher_pool()?.max_active())
    }

    /// Also sets max idle to `max_active` and the global cap to
    /// [`TOTAL_PER_ACTIVE`](crate::pool::TOTAL_PER_ACTIVE) times it.
    pub fn set_max_dispatchers_active(&self, max_active: usize) -> ConnectorResult<()> {
        self.dispatcher_pool()?.set_max_active(max_active);
        Ok(())
    }

    pub fn max_total_dispatchers(&self) -> ConnectorResult<usize> {
        Ok(self.dispatcher_pool()?.max_total())
    }

    pub fn max_requesters_active(&self) -> ConnectorResult<usize> {
        Ok(self.requester_pool()?.max_active())
    }

    pub fn set_max_requesters_active(&self, max_active: usize) -> ConnectorResult<()> {
        self.requester_pool()?.set_max_active(max_active);
        Ok(())
    }

    pub fn set_dispatcher_pool_exhausted_action(&self, action: ExhaustedAction) -> ConnectorResult<()> {
        self.dispatcher_pool()?.set_exhausted_action(action);
        Ok(())
    }

    pub fn set_dispatcher_pool_max_wait(&self, max_wait: Option<Duration>) -> ConnectorResult<()> {
        self.dispatcher_pool()?.set_max_wait(max_wait);
        Ok(())
    }

    pub fn set_requester_pool_exhausted_action(&self, action: ExhaustedAction) -> ConnectorResult<()> {
        self.requester_pool()?.set_exhausted_action(action);
        Ok(())
    }

    pub fn set_requester_pool_max_wait(&self, max_wait: Option<Duration>) -> ConnectorResult<()> {
        self.requester_pool()?.set_max_wait(max_wait);
        Ok(())
    }
}
