//! A transport whose hooks count their calls and fail on demand.

// Shared across several test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connector_runtime::connector::{DispatcherFactory, RequesterFactory};
use connector_runtime::pool::PooledObjectFactory;
use connector_runtime::{
    BoxError, ConnectorConfig, Endpoint, EndpointUri, FlowConstruct, Message, MessageDispatcher,
    MessageReceiver, MessageRequester, ReceiverHooks, TransportHooks,
};

/// Message property asking [`TestDispatcher`] to fail.
pub const FAIL: &str = "fail";
/// Message property asking [`TestDispatcher::send`] to answer with a stream.
pub const STREAM: &str = "stream";

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Default)]
pub struct HookCounts {
    pub initialise: AtomicUsize,
    pub start: AtomicUsize,
    pub stop: AtomicUsize,
    pub dispose: AtomicUsize,
    pub connect: AtomicUsize,
    pub disconnect: AtomicUsize,
    pub validate: AtomicUsize,
    pub unregister: AtomicUsize,
}

type ReceiverFactory = Box<dyn Fn(&Endpoint) -> Arc<dyn ReceiverHooks> + Send + Sync>;

pub struct TestTransport {
    pub counts: HookCounts,
    connect_failures: AtomicUsize,
    connect_delay: Duration,
    fail_initialise: bool,
    fail_start: bool,
    fail_stop: bool,
    fail_disconnect: bool,
    receiver_factory: Option<ReceiverFactory>,
    receivers: Mutex<Vec<(String, Arc<TestReceiverHooks>)>>,
    pub outbound: Arc<Outbound>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self {
            counts: HookCounts::default(),
            connect_failures: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
            fail_initialise: false,
            fail_start: false,
            fail_stop: false,
            fail_disconnect: false,
            receiver_factory: None,
            receivers: Mutex::new(Vec::new()),
            outbound: Arc::new(Outbound::default()),
        }
    }

    /// Fail the next `failures` transport connects.
    pub fn with_connect_failures(self, failures: usize) -> Self {
        self.connect_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing_initialise(mut self) -> Self {
        self.fail_initialise = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn failing_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    /// Build receivers with `factory` instead of [`TestReceiverHooks`].
    pub fn with_receivers<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Endpoint) -> Arc<dyn ReceiverHooks> + Send + Sync + 'static,
    {
        self.receiver_factory = Some(Box::new(factory));
        self
    }

    /// Hooks of the receiver created for `address`.
    pub fn receiver_hooks(&self, address: &str) -> Arc<TestReceiverHooks> {
        self.receivers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(key, _)| key == address)
            .map(|(_, hooks)| Arc::clone(hooks))
            .unwrap_or_else(|| panic!("no receiver created for {address}"))
    }
}

pub fn test_config(name: &str) -> ConnectorConfig {
    ConnectorConfig::new(name, "test")
}

#[async_trait]
impl TransportHooks for TestTransport {
    async fn do_initialise(&self) -> Result<(), BoxError> {
        self.counts.initialise.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialise {
            return Err("initialise refused".into());
        }
        Ok(())
    }

    async fn do_start(&self) -> Result<(), BoxError> {
        self.counts.start.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err("start refused".into());
        }
        Ok(())
    }

    async fn do_stop(&self) -> Result<(), BoxError> {
        self.counts.stop.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err("stop refused".into());
        }
        Ok(())
    }

    async fn do_dispose(&self) -> Result<(), BoxError> {
        self.counts.dispose.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_connect(&self) -> Result<(), BoxError> {
        self.counts.connect.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err("connection refused".into());
        }
        Ok(())
    }

    async fn do_disconnect(&self) -> Result<(), BoxError> {
        self.counts.disconnect.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect {
            return Err("disconnect refused".into());
        }
        Ok(())
    }

    async fn validate_connection(&self) -> Result<(), BoxError> {
        self.counts.validate.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_receiver(
        &self,
        _flow: &Arc<dyn FlowConstruct>,
        endpoint: &Endpoint,
    ) -> connector_runtime::ConnectorResult<Arc<dyn ReceiverHooks>> {
        if let Some(factory) = &self.receiver_factory {
            return Ok(factory(endpoint));
        }
        let address = endpoint.uri().address().to_string();
        let hooks = Arc::new(TestReceiverHooks::new(address.starts_with("bad")));
        self.receivers
            .lock()
            .unwrap()
            .push((address, Arc::clone(&hooks)));
        Ok(hooks)
    }

    fn dispatcher_factory(&self) -> DispatcherFactory {
        Arc::new(OutboundFactory(Arc::clone(&self.outbound)))
    }

    fn requester_factory(&self) -> RequesterFactory {
        Arc::new(OutboundFactory(Arc::clone(&self.outbound)))
    }

    async fn do_unregister_listener(
        &self,
        _flow: &Arc<dyn FlowConstruct>,
        _endpoint: &Endpoint,
    ) -> Result<(), BoxError> {
        self.counts.unregister.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Receiver hooks counting each call. Connect fails when `fail_connect`.
#[derive(Default)]
pub struct TestReceiverHooks {
    fail_connect: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub disposes: AtomicUsize,
    pub validations: AtomicUsize,
}

impl TestReceiverHooks {
    pub fn new(fail_connect: bool) -> Self {
        Self {
            fail_connect: AtomicBool::new(fail_connect),
            ..Default::default()
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReceiverHooks for TestReceiverHooks {
    async fn do_connect(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err("receiver connect refused".into());
        }
        Ok(())
    }

    async fn do_disconnect(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_start(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_stop(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_dispose(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.disposes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn validate_connection(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Everything sent through dispatchers and requesters built by [`TestTransport`].
#[derive(Default)]
pub struct Outbound {
    pub dispatchers_created: AtomicUsize,
    pub requesters_created: AtomicUsize,
    pub dispatched: Mutex<Vec<String>>,
}

struct OutboundFactory(Arc<Outbound>);

#[async_trait]
impl PooledObjectFactory<EndpointUri, Box<dyn MessageDispatcher>> for OutboundFactory {
    async fn create(&self, _key: &EndpointUri) -> Result<Box<dyn MessageDispatcher>, BoxError> {
        self.0.dispatchers_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestDispatcher(Arc::clone(&self.0))))
    }
}

#[async_trait]
impl PooledObjectFactory<EndpointUri, Box<dyn MessageRequester>> for OutboundFactory {
    async fn create(&self, _key: &EndpointUri) -> Result<Box<dyn MessageRequester>, BoxError> {
        self.0.requesters_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestRequester))
    }
}

/// Echoes sends back, as a stream when the message asks for one.
pub struct TestDispatcher(Arc<Outbound>);

#[async_trait]
impl MessageDispatcher for TestDispatcher {
    async fn dispatch(&self, _endpoint: &Endpoint, message: Message) -> Result<(), BoxError> {
        if message.property(FAIL).is_some() {
            return Err("dispatch refused".into());
        }
        self.0
            .dispatched
            .lock()
            .unwrap()
            .push(message.as_text().unwrap_or_default());
        Ok(())
    }

    async fn send(&self, _endpoint: &Endpoint, message: Message) -> Result<Option<Message>, BoxError> {
        if message.property(FAIL).is_some() {
            return Err("send refused".into());
        }
        let text = message.as_text().unwrap_or_default();
        if message.property(STREAM).is_some() {
            return Ok(Some(Message::stream(Cursor::new(text.into_bytes()))));
        }
        Ok(Some(Message::text(format!("echo {text}"))))
    }
}

pub struct TestRequester;

#[async_trait]
impl MessageRequester for TestRequester {
    async fn request(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<Option<Message>, BoxError> {
        Ok(Some(Message::text(format!(
            "from {}",
            endpoint.uri().address()
        ))))
    }
}
