use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::FlowConstruct;
use crate::endpoint::{Endpoint, EndpointUri};
use crate::error::{BoxError, ConnectorResult};
use crate::message::Message;
use crate::pool::PooledObjectFactory;
use crate::receiver::ReceiverHooks;

/// Outbound client borrowed from the connector's dispatcher pool.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    /// One-way send.
    async fn dispatch(&self, endpoint: &Endpoint, message: Message) -> Result<(), BoxError>;

    /// Request-response send.
    async fn send(&self, endpoint: &Endpoint, message: Message) -> Result<Option<Message>, BoxError>;
}

/// Inbound client borrowed from the connector's requester pool.
#[async_trait]
pub trait MessageRequester: Send + Sync {
    /// Receive one message, waiting at most `timeout`.
    async fn request(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Option<Message>, BoxError>;
}

pub type DispatcherFactory = Arc<dyn PooledObjectFactory<EndpointUri, Box<dyn MessageDispatcher>>>;
pub type RequesterFactory = Arc<dyn PooledObjectFactory<EndpointUri, Box<dyn MessageRequester>>>;

/// Transport-specific behaviour plugged into a [`Connector`](super::Connector).
///
/// The connector calls these at fixed points of its lifecycle and connect
/// protocol. Only the receiver and pooled-object factories are required.
#[async_trait]
pub trait TransportHooks: Send + Sync {
    async fn do_initialise(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_stop(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_dispose(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_connect(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_disconnect(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Cheap liveness check run before retrying a failed connect.
    async fn validate_connection(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Build the receiver hooks for a newly registered listener.
    fn create_receiver(
        &self,
        flow: &Arc<dyn FlowConstruct>,
        endpoint: &Endpoint,
    ) -> ConnectorResult<Arc<dyn ReceiverHooks>>;

    fn dispatcher_factory(&self) -> DispatcherFactory;

    fn requester_factory(&self) -> RequesterFactory;

    fn connection_description(&self) -> Option<String> {
        None
    }

    /// Key a listener is registered under.
    fn receiver_key(&self, _flow: &dyn FlowConstruct, endpoint: &Endpoint) -> String {
        endpoint.uri().receiver_key().to_string()
    }

    /// Called after a listener's receiver has been destroyed.
    async fn do_unregister_listener(
        &self,
        _flow: &Arc<dyn FlowConstruct>,
        _endpoint: &Endpoint,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}
