//! Scheduled poll runs for [`PollingMessageReceiver`](super::PollingMessageReceiver).

use std::sync::{Arc, Weak};

use log::{debug, trace};
use tokio::sync::watch;
use tokio::time::Instant;

use super::polling::{Poller, perform_poll};
use super::{LOG_TARGET, MessageReceiver};
use crate::error::ConnectorError;
use crate::work::ScheduleHandle;

/// One scheduled poller of a receiver: the periodic schedule plus the
/// worker it submits on every tick.
pub(crate) struct PollingScheduleEntry {
    pub(crate) handle: ScheduleHandle,
    pub(crate) worker: Arc<PollingWorker>,
}

/// Runs one poll at a time for its receiver.
///
/// Ticks arriving while a poll is still in progress are skipped rather than
/// queued.
pub(crate) struct PollingWorker {
    receiver: Weak<MessageReceiver>,
    poller: Arc<dyn Poller>,
    running: watch::Sender<bool>,
}

/// Clears the running flag when a run ends, however it ends.
struct RunningGuard<'a>(&'a watch::Sender<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl PollingWorker {
    pub(crate) fn new(receiver: &Arc<MessageReceiver>, poller: Arc<dyn Poller>) -> Self {
        Self {
            receiver: Arc::downgrade(receiver),
            poller,
            running: watch::Sender::new(false),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        let acquired = self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        });
        acquired.then(|| RunningGuard(&self.running))
    }

    /// Perform one poll unless one is already running or the receiver is
    /// not started. Poll failures go to the receiver's exception handler.
    pub(crate) async fn run(self: Arc<Self>) {
        let Some(_running) = self.try_begin() else {
            trace!(target: LOG_TARGET, "Poll already in progress; skipping tick");
            return;
        };
        let Some(receiver) = self.receiver.upgrade() else {
            return;
        };
        if !receiver.is_started() {
            debug!(
                target: LOG_TARGET,
                "Skipping poll for {} ({})",
                receiver.resource_id(),
                receiver.state()
            );
            return;
        }

        if let Err(e) = perform_poll(self.poller.as_ref(), &receiver).await {
            receiver.handle_exception(&ConnectorError::Poll {
                receiver: receiver.resource_id().to_string(),
                source: e,
            });
        }
    }

    /// Wait for an in-progress poll to finish. Returns `false` if `deadline`
    /// passes first.
    pub(crate) async fn wait_until_idle(&self, deadline: Instant) -> bool {
        let mut running = self.running.subscribe();
        matches!(
            tokio::time::timeout_at(deadline, running.wait_for(|running| !*running)).await,
            Ok(Ok(_))
        )
    }
}
