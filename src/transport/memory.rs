//! In-process transport backed by named queues.
//!
//! Endpoint `memory://orders` addresses the queue `orders` of a
//! [`MemoryBroker`]. Dispatchers push onto the queue, requesters pop from
//! it, and receivers poll it, routing each message to their flow.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::connector::{
    DispatcherFactory, MessageDispatcher, MessageRequester, RequesterFactory, TransportHooks,
};
use crate::context::FlowConstruct;
use crate::endpoint::{Endpoint, EndpointUri};
use crate::error::{BoxError, ConnectorError, ConnectorResult, LockResultExt};
use crate::message::Message;
use crate::pool::PooledObjectFactory;
use crate::receiver::{MessageReceiver, Poller, PollingMessageReceiver, ReceiverHooks};

const LOG_TARGET: &str = "connector_runtime::transport::memory";

/// Property naming the queue a flow's response is delivered to.
pub const REPLY_TO: &str = "reply_to";

#[derive(Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<Message>>,
    available: Notify,
}

impl MemoryQueue {
    fn push(&self, message: Message) {
        self.messages
            .lock()
            .recover_poison("MemoryQueue::push()")
            .push_back(message);
        self.available.notify_waiters();
    }

    fn pop(&self) -> Option<Message> {
        self.messages
            .lock()
            .recover_poison("MemoryQueue::pop()")
            .pop_front()
    }

    fn take(&self, max: usize) -> Vec<Message> {
        let mut messages = self.messages.lock().recover_poison("MemoryQueue::take()");
        let count = max.min(messages.len());
        messages.drain(..count).collect()
    }

    fn len(&self) -> usize {
        self.messages.lock().recover_poison("MemoryQueue::len()").len()
    }
}

/// Named message queues shared by every memory connector built on it.
///
/// Cloning yields another handle to the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<DashMap<String, Arc<MemoryQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, address: &str) -> Arc<MemoryQueue> {
        Arc::clone(
            self.queues
                .entry(address.to_string())
                .or_default()
                .value(),
        )
    }

    pub fn push(&self, address: &str, message: Message) {
        self.queue(address).push(message);
    }

    pub fn pop(&self, address: &str) -> Option<Message> {
        self.queue(address).pop()
    }

    /// Pop the next message, waiting up to `timeout` for one to arrive.
    pub async fn pop_timeout(&self, address: &str, timeout: Duration) -> Option<Message> {
        let queue = self.queue(address);
        let deadline = Instant::now() + timeout;
        loop {
            let notified = queue.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = queue.pop() {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return queue.pop();
            }
        }
    }

    /// Remove up to `max` messages from the front of the queue.
    pub fn take(&self, address: &str, max: usize) -> Vec<Message> {
        self.queue(address).take(max)
    }

    /// Number of queued messages.
    pub fn depth(&self, address: &str) -> usize {
        self.queues
            .get(address)
            .map_or(0, |queue| queue.value().len())
    }
}

/// [`TransportHooks`] for the memory transport.
pub struct MemoryTransport {
    broker: MemoryBroker,
    connected: AtomicBool,
    frequency: Duration,
    startup_delay: Duration,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            frequency: PollingMessageReceiver::DEFAULT_FREQUENCY,
            startup_delay: PollingMessageReceiver::DEFAULT_STARTUP_DELAY,
        }
    }

    /// Poll frequency for endpoints that do not set their own.
    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_startup_delay(mut self, startup_delay: Duration) -> Self {
        self.startup_delay = startup_delay;
        self
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl TransportHooks for MemoryTransport {
    async fn do_connect(&self) -> Result<(), BoxError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn do_disconnect(&self) -> Result<(), BoxError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn validate_connection(&self) -> Result<(), BoxError> {
        Ok(())
    }

    fn create_receiver(
        &self,
        flow: &Arc<dyn FlowConstruct>,
        endpoint: &Endpoint,
    ) -> ConnectorResult<Arc<dyn ReceiverHooks>> {
        let frequency = endpoint.polling_frequency().unwrap_or(self.frequency);
        if frequency.is_zero() {
            return Err(ConnectorError::invalid_argument(format!(
                "polling frequency for {} must be positive",
                endpoint.uri()
            )));
        }
        debug!(
            target: LOG_TARGET,
            "Creating receiver on {} for flow {}",
            endpoint.uri(),
            flow.name()
        );
        let poller = Arc::new(MemoryPoller {
            broker: self.broker.clone(),
        });
        Ok(Arc::new(
            PollingMessageReceiver::new(poller, frequency).with_startup_delay(self.startup_delay),
        ))
    }

    fn dispatcher_factory(&self) -> DispatcherFactory {
        Arc::new(MemoryClientFactory {
            broker: self.broker.clone(),
        })
    }

    fn requester_factory(&self) -> RequesterFactory {
        Arc::new(MemoryClientFactory {
            broker: self.broker.clone(),
        })
    }

    fn connection_description(&self) -> Option<String> {
        Some(format!("memory broker ({} queues)", self.broker.queues.len()))
    }
}

/// Drains a receiver's queue on every poll.
struct MemoryPoller {
    broker: MemoryBroker,
}

#[async_trait]
impl Poller for MemoryPoller {
    async fn poll(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        let address = receiver.endpoint().uri().address();
        let batch = PollingMessageReceiver::batch_size(receiver, self.broker.depth(address));
        if batch == 0 {
            return Ok(());
        }

        for message in self.broker.take(address, batch) {
            let reply_to = message.property(REPLY_TO).map(str::to_string);
            match receiver.route_message(message).await {
                Ok(Some(response)) => {
                    if let Some(reply_to) = reply_to {
                        self.broker.push(&reply_to, response);
                    }
                }
                Ok(None) => {}
                Err(e) => receiver.handle_exception(&e),
            }
        }
        Ok(())
    }
}

struct MemoryDispatcher {
    broker: MemoryBroker,
}

#[async_trait]
impl MessageDispatcher for MemoryDispatcher {
    async fn dispatch(&self, endpoint: &Endpoint, message: Message) -> Result<(), BoxError> {
        self.broker.push(endpoint.uri().address(), message);
        Ok(())
    }

    /// Queues the message; the memory transport has no synchronous reply.
    async fn send(&self, endpoint: &Endpoint, message: Message) -> Result<Option<Message>, BoxError> {
        self.broker.push(endpoint.uri().address(), message);
        Ok(None)
    }
}

struct MemoryRequester {
    broker: MemoryBroker,
}

#[async_trait]
impl MessageRequester for MemoryRequester {
    async fn request(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Option<Message>, BoxError> {
        Ok(self.broker.pop_timeout(endpoint.uri().address(), timeout).await)
    }
}

struct MemoryClientFactory {
    broker: MemoryBroker,
}

#[async_trait]
impl PooledObjectFactory<EndpointUri, Box<dyn MessageDispatcher>> for MemoryClientFactory {
    async fn create(&self, key: &EndpointUri) -> Result<Box<dyn MessageDispatcher>, BoxError> {
        info!(target: LOG_TARGET, "Creating dispatcher for {}", key);
        Ok(Box::new(MemoryDispatcher {
            broker: self.broker.clone(),
        }))
    }
}

#[async_trait]
impl PooledObjectFactory<EndpointUri, Box<dyn MessageRequester>> for MemoryClientFactory {
    async fn create(&self, key: &EndpointUri) -> Result<Box<dyn MessageRequester>, BoxError> {
        info!(target: LOG_TARGET, "Creating requester for {}", key);
        Ok(Box::new(MemoryRequester {
            broker: self.broker.clone(),
        }))
    }
}
