//! Flow and notification doubles.

// Shared across several test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connector_runtime::{
    ConnectionAction, ConnectionNotification, ConnectorError, ConnectorResult, FlowConstruct,
    Message, NotificationListener,
};

/// Flow that records what it processes and the failures reported to it.
pub struct TestFlow {
    name: String,
    started: AtomicBool,
    processed: Mutex<Vec<String>>,
    exceptions: Mutex<Vec<String>>,
}

impl TestFlow {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            started: AtomicBool::new(true),
            processed: Mutex::new(Vec::new()),
            exceptions: Mutex::new(Vec::new()),
        })
    }

    /// A flow whose own lifecycle has not started yet.
    pub fn stopped(name: &str) -> Arc<Self> {
        let flow = Self::new(name);
        flow.started.store(false, Ordering::SeqCst);
        flow
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }

    pub fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlowConstruct for TestFlow {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn process(&self, message: Message) -> ConnectorResult<Option<Message>> {
        let text = message.as_text().unwrap_or_default();
        self.processed.lock().unwrap().push(text.clone());
        Ok(Some(Message::text(format!("processed {text}"))))
    }

    fn handle_exception(&self, error: &ConnectorError) {
        self.exceptions.lock().unwrap().push(error.to_string());
    }
}

/// Records every published connection notification.
#[derive(Default)]
pub struct NotificationRecorder {
    seen: Mutex<Vec<ConnectionNotification>>,
}

impl NotificationRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn actions_for(&self, resource_id: &str) -> Vec<ConnectionAction> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.resource_id == resource_id)
            .map(|n| n.action)
            .collect()
    }
}

impl NotificationListener for NotificationRecorder {
    fn on_notification(&self, notification: &ConnectionNotification) {
        self.seen.lock().unwrap().push(notification.clone());
    }
}

/// Await `condition` becoming true, checking every 10ms for up to `timeout`.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run `future` with a generous upper bound so a hang fails instead of
/// blocking the test binary.
pub async fn bounded<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation did not complete within 10s")
}
