//! Receivers for transports that must be polled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::Instant;

use super::schedule::{PollingScheduleEntry, PollingWorker};
use super::{LOG_TARGET, MessageReceiver, ReceiverHooks};
use crate::error::{BoxError, ConnectorResult, LockResultExt};
use crate::work::ShutdownTimeout;

/// Transport side of a polling receiver.
#[async_trait]
pub trait Poller: Send + Sync {
    /// Fetch whatever is available and route it through `receiver`.
    async fn poll(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError>;

    async fn do_connect(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_disconnect(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn do_dispose(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    async fn validate_connection(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Ok(())
    }

    fn should_consume_in_every_node(&self) -> bool {
        true
    }
}

/// Poll `receiver` unless this node may not consume for it.
pub(crate) async fn perform_poll(
    poller: &dyn Poller,
    receiver: &Arc<MessageReceiver>,
) -> Result<(), BoxError> {
    if !receiver.allowed_on_this_node() {
        return Ok(());
    }
    poller.poll(receiver).await
}

/// [`ReceiverHooks`] that poll on a fixed frequency while started.
///
/// Each schedule submits its poll to the connector's receiving task pool.
/// At most one poll per schedule runs at any time, and stopping waits for
/// the poll in progress to finish.
pub struct PollingMessageReceiver {
    poller: Arc<dyn Poller>,
    frequency: Duration,
    startup_delay: Duration,
    schedules: Mutex<Vec<PollingScheduleEntry>>,
}

impl PollingMessageReceiver {
    pub const DEFAULT_FREQUENCY: Duration = Duration::from_millis(1000);
    pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_millis(1000);

    pub fn new(poller: Arc<dyn Poller>, frequency: Duration) -> Self {
        Self {
            poller,
            frequency,
            startup_delay: Self::DEFAULT_STARTUP_DELAY,
            schedules: Mutex::new(Vec::new()),
        }
    }

    /// Delay before the first poll after start.
    pub fn with_startup_delay(mut self, startup_delay: Duration) -> Self {
        self.startup_delay = startup_delay;
        self
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    pub fn startup_delay(&self) -> Duration {
        self.startup_delay
    }

    /// Number of active schedules.
    pub fn schedule_count(&self) -> usize {
        self.schedules
            .lock()
            .recover_poison("PollingMessageReceiver::schedule_count()")
            .len()
    }

    /// True while any schedule has a poll in progress.
    pub fn is_polling(&self) -> bool {
        self.schedules
            .lock()
            .recover_poison("PollingMessageReceiver::is_polling()")
            .iter()
            .any(|entry| entry.worker.is_running())
    }

    /// How many of `available` messages one poll should take: half the
    /// receiving pool's capacity, at least one, never more than available.
    pub fn batch_size(receiver: &MessageReceiver, available: usize) -> usize {
        if available == 0 {
            return 0;
        }
        let capacity = receiver
            .connector()
            .map(|connector| connector.config().receiver_threading.max_threads_active)
            .unwrap_or(1);
        (capacity / 2).max(1).min(available)
    }

    /// Run one poll now, subject to the node's primary status.
    pub async fn perform_poll(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        perform_poll(self.poller.as_ref(), receiver).await
    }

    fn worker_count(receiver: &MessageReceiver) -> usize {
        let Ok(connector) = receiver.connector() else {
            return 1;
        };
        let config = connector.config();
        if receiver.endpoint().is_transacted() && config.create_multiple_transacted_receivers {
            config.number_of_concurrent_transacted_receivers.max(1)
        } else {
            1
        }
    }

    /// Create the receiver's poll schedules on the connector scheduler.
    pub fn schedule(&self, receiver: &Arc<MessageReceiver>) -> ConnectorResult<()> {
        let connector = receiver.connector()?;
        let scheduler = connector.scheduler()?;
        let pool = connector.receiver_task_pool()?;

        let mut schedules = self
            .schedules
            .lock()
            .recover_poison("PollingMessageReceiver::schedule()");
        if !schedules.is_empty() {
            return Ok(());
        }

        for _ in 0..Self::worker_count(receiver) {
            let worker = Arc::new(PollingWorker::new(receiver, Arc::clone(&self.poller)));
            let tick_worker = Arc::clone(&worker);
            let pool = pool.clone();
            let resource_id = receiver.resource_id().to_string();

            let handle = scheduler.schedule_with_fixed_delay(
                self.startup_delay,
                self.frequency,
                move || {
                    let worker = Arc::clone(&tick_worker);
                    let pool = pool.clone();
                    let resource_id = resource_id.clone();
                    async move {
                        if worker.is_running() {
                            return;
                        }
                        if let Err(e) = pool.execute(worker.run()).await {
                            warn!(target: LOG_TARGET, "Poll for {} rejected: {}", resource_id, e);
                        }
                    }
                },
            )?;
            schedules.push(PollingScheduleEntry { handle, worker });
        }

        debug!(
            target: LOG_TARGET,
            "Scheduled {} poller(s) for {} every {:?}",
            schedules.len(),
            receiver.resource_id(),
            self.frequency
        );
        Ok(())
    }

    /// Cancel every schedule, then wait up to `timeout` for polls in
    /// progress to finish.
    pub async fn unschedule(&self, timeout: ShutdownTimeout) {
        let entries = std::mem::take(
            &mut *self
                .schedules
                .lock()
                .recover_poison("PollingMessageReceiver::unschedule()"),
        );
        for entry in &entries {
            entry.handle.cancel(false);
        }

        let deadline = Instant::now() + timeout.as_duration();
        for entry in entries {
            if !entry.worker.wait_until_idle(deadline).await {
                warn!(
                    target: LOG_TARGET,
                    "Poll still running after {:?}; continuing shutdown",
                    timeout.as_duration()
                );
            }
        }
    }
}

#[async_trait]
impl ReceiverHooks for PollingMessageReceiver {
    async fn do_connect(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.poller.do_connect(receiver).await
    }

    async fn do_disconnect(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.poller.do_disconnect(receiver).await
    }

    async fn do_start(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.schedule(receiver)?;
        Ok(())
    }

    async fn do_stop(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.unschedule(receiver.runtime().shutdown_timeout()).await;
        Ok(())
    }

    async fn do_dispose(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.unschedule(receiver.runtime().shutdown_timeout()).await;
        self.poller.do_dispose(receiver).await
    }

    async fn validate_connection(&self, receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.poller.validate_connection(receiver).await
    }

    fn should_consume_in_every_node(&self) -> bool {
        self.poller.should_consume_in_every_node()
    }
}

