//! Connector-wide fixed-delay scheduler.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{LOG_TARGET, ShutdownTimeout, drain_join_set};
use crate::error::{ConnectorError, ConnectorResult, LockResultExt};

/// Handle to one periodic schedule.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    cancel: CancellationToken,
    abort: AbortHandle,
}

impl ScheduleHandle {
    /// Stop future runs of this schedule.
    ///
    /// With `may_interrupt == false` a run already in progress completes
    /// normally; with `true` it is aborted at its next await point.
    pub fn cancel(&self, may_interrupt: bool) {
        self.cancel.cancel();
        if may_interrupt {
            self.abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the schedule's loop has exited.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Timer service running fixed-delay schedules for one connector.
///
/// Each schedule is a task that runs the supplied closure, then sleeps
/// `delay` measured from the end of that run, so a slow run delays the next
/// one instead of queueing a burst. An optional semaphore caps how many
/// schedules may be inside a run at once.
#[derive(Debug)]
pub struct PeriodicScheduler {
    name: String,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
    permits: Option<Arc<Semaphore>>,
    is_shut_down: AtomicBool,
}

impl PeriodicScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
            permits: None,
            is_shut_down: AtomicBool::new(false),
        }
    }

    /// Scheduler on which at most `runs` schedules execute concurrently.
    pub fn with_max_concurrent_runs(name: impl Into<String>, runs: usize) -> Self {
        Self {
            permits: Some(Arc::new(Semaphore::new(runs.max(1)))),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }

    /// Number of schedules whose loop has not exited yet.
    pub fn active_schedules(&self) -> usize {
        self.tasks
            .lock()
            .recover_poison("PeriodicScheduler::active_schedules()")
            .len()
    }

    /// Run `task` after `initial_delay`, then again `delay` after each run
    /// completes, until the returned handle is cancelled or the scheduler
    /// shuts down.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        mut task: F,
    ) -> ConnectorResult<ScheduleHandle>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(ConnectorError::WorkRejected {
                pool: self.name.clone(),
                message: "scheduler is shut down".to_string(),
            });
        }

        let cancel = self.shutdown.child_token();
        let loop_cancel = cancel.clone();
        let permits = self.permits.clone();

        let abort = {
            let mut tasks = self
                .tasks
                .lock()
                .recover_poison("PeriodicScheduler::schedule_with_fixed_delay()");
            while tasks.try_join_next().is_some() {}

            tasks.spawn(async move {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = tokio::time::sleep(initial_delay) => {}
                }

                loop {
                    let permit = match &permits {
                        Some(permits) => tokio::select! {
                            _ = loop_cancel.cancelled() => return,
                            permit = Arc::clone(permits).acquire_owned() => match permit {
                                Ok(permit) => Some(permit),
                                Err(_) => return,
                            },
                        },
                        None => None,
                    };

                    task().await;
                    drop(permit);

                    tokio::select! {
                        _ = loop_cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            })
        };

        Ok(ScheduleHandle { cancel, abort })
    }

    /// Shut the scheduler down.
    ///
    /// No new runs start; runs already in progress get `timeout` to finish.
    /// After that every remaining schedule is aborted and given a further
    /// [`ShutdownTimeout::FORCED`] to unwind.
    pub async fn shutdown(&self, timeout: ShutdownTimeout) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let mut tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .recover_poison("PeriodicScheduler::shutdown()"),
        );

        let graceful = tokio::time::timeout(
            timeout.as_duration(),
            drain_join_set(&mut tasks, "Scheduled task"),
        )
        .await;

        if graceful.is_ok() {
            debug!(target: LOG_TARGET, "Scheduler {} shut down", self.name);
            return;
        }

        warn!(
            target: LOG_TARGET,
            "Scheduler {} did not terminate within {:?}; forcing shutdown, {} scheduled tasks cancelled",
            self.name,
            timeout.as_duration(),
            tasks.len()
        );
        tasks.abort_all();

        let forced = tokio::time::timeout(
            ShutdownTimeout::FORCED.as_duration(),
            drain_join_set(&mut tasks, "Scheduled task"),
        )
        .await;
        if forced.is_err() {
            warn!(
                target: LOG_TARGET,
                "Scheduler {} still has {} tasks after forced shutdown",
                self.name,
                tasks.len()
            );
        }
    }
}
