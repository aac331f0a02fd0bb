pub mod config;
pub mod connector;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod pool;
pub mod receiver;
pub mod retry;
pub mod transport;
pub mod work;

pub use config::{ConnectorConfig, RuntimeConfig, Settings};
pub use connector::{Connector, MessageDispatcher, MessageRequester, TransportHooks};
pub use context::{
    ConnectionAction, ConnectionNotification, FlowConstruct, NotificationListener, RuntimeContext,
};
pub use endpoint::{Endpoint, EndpointUri};
pub use error::{BoxError, Connectable, ConnectorError, ConnectorResult};
pub use lifecycle::{LifecyclePhase, LifecycleState};
pub use message::{Message, Payload};
pub use receiver::{MessageReceiver, Poller, PollingMessageReceiver, ReceiverHooks};
