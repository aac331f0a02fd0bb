//! Bounded worker pool with a configurable exhaustion policy.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{LOG_TARGET, ShutdownTimeout, drain_join_set};
use crate::config::{ThreadingProfile, WhenExhausted};
use crate::error::{ConnectorError, ConnectorResult, LockResultExt};

/// A unit of work accepted by a [`BoundedTaskPool`].
pub type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Work>,
    /// Live worker tasks
    workers: usize,
    /// Workers parked waiting for the queue
    idle: usize,
    disposed: bool,
}

struct PoolShared {
    name: String,
    profile: ThreadingProfile,
    state: Mutex<PoolState>,
    /// Signalled when work is queued
    work_available: Notify,
    /// Signalled when a queued item is taken
    space_available: Notify,
    closed: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

enum Admission {
    Accepted,
    Exhausted(Work),
}

/// Named, sized pool of worker tasks dedicated to one connector role.
///
/// Workers are spawned lazily up to `max_threads_active`. A worker that has
/// been idle for `thread_ttl` exits as long as more than `max_threads_idle`
/// workers remain. When every worker is busy, work is queued up to
/// `max_buffer_size` (0 = unbounded); beyond that the profile's
/// [`WhenExhausted`] action decides.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct BoundedTaskPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for BoundedTaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedTaskPool")
            .field("name", &self.shared.name)
            .field("max_threads_active", &self.shared.profile.max_threads_active)
            .finish()
    }
}

/// Keeps the worker count correct however the worker task ends.
struct WorkerGuard {
    shared: Arc<PoolShared>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut state = self
            .shared
            .state
            .lock()
            .recover_poison("BoundedTaskPool worker exit");
        state.workers = state.workers.saturating_sub(1);
    }
}

impl BoundedTaskPool {
    pub fn new(name: impl Into<String>, profile: ThreadingProfile) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                profile,
                state: Mutex::new(PoolState::default()),
                work_available: Notify::new(),
                space_available: Notify::new(),
                closed: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn profile(&self) -> &ThreadingProfile {
        &self.shared.profile
    }

    /// Maximum number of concurrently running work items.
    pub fn max_threads_active(&self) -> usize {
        self.shared.profile.max_threads_active
    }

    /// Number of live worker tasks.
    pub fn worker_count(&self) -> usize {
        self.lock_state("BoundedTaskPool::worker_count()").workers
    }

    /// Number of queued work items not yet picked up.
    pub fn queued(&self) -> usize {
        self.lock_state("BoundedTaskPool::queued()").queue.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state("BoundedTaskPool::is_disposed()").disposed
    }

    fn lock_state(&self, context: &str) -> std::sync::MutexGuard<'_, PoolState> {
        self.shared.state.lock().recover_poison(context)
    }

    /// Submit `work` to the pool.
    ///
    /// Returns once the work has been accepted (or, under the `Run` policy,
    /// once the caller has finished running it). Fails with
    /// [`ConnectorError::WorkRejected`] when the pool is disposed, under the
    /// `Abort` policy, or when a `Wait` submission times out.
    pub async fn execute<F>(&self, work: F) -> ConnectorResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut work: Work = Box::pin(work);
        let deadline = tokio::time::Instant::now() + self.shared.profile.thread_wait_timeout();

        loop {
            let space = self.shared.space_available.notified();

            work = match self.admit(work)? {
                Admission::Accepted => return Ok(()),
                Admission::Exhausted(work) => work,
            };

            match self.shared.profile.pool_exhausted_action {
                WhenExhausted::Wait => {
                    if tokio::time::timeout_at(deadline, space).await.is_err() {
                        return Err(self.rejected(format!(
                            "no capacity within {:?}",
                            self.shared.profile.thread_wait_timeout()
                        )));
                    }
                }
                WhenExhausted::Discard => {
                    debug!(
                        target: LOG_TARGET,
                        "Pool {} exhausted, discarding work",
                        self.shared.name
                    );
                    return Ok(());
                }
                WhenExhausted::DiscardOldest => {
                    let mut state = self.lock_state("BoundedTaskPool::execute()");
                    if state.disposed {
                        return Err(self.rejected("pool is disposed"));
                    }
                    if state.queue.pop_front().is_some() {
                        debug!(
                            target: LOG_TARGET,
                            "Pool {} exhausted, discarded oldest queued work",
                            self.shared.name
                        );
                    }
                    state.queue.push_back(work);
                    drop(state);
                    self.shared.work_available.notify_one();
                    return Ok(());
                }
                WhenExhausted::Abort => {
                    return Err(self.rejected("all workers busy and queue full"));
                }
                WhenExhausted::Run => {
                    work.await;
                    return Ok(());
                }
            }
        }
    }

    fn rejected(&self, message: impl Into<String>) -> ConnectorError {
        ConnectorError::WorkRejected {
            pool: self.shared.name.clone(),
            message: message.into(),
        }
    }

    fn admit(&self, work: Work) -> ConnectorResult<Admission> {
        let mut state = self.lock_state("BoundedTaskPool::admit()");
        if state.disposed {
            return Err(self.rejected("pool is disposed"));
        }

        let profile = &self.shared.profile;
        let idle_worker_free = state.queue.len() < state.idle;
        let can_grow = state.workers < profile.max_threads_active;
        let buffer_has_room =
            profile.max_buffer_size == 0 || state.queue.len() < profile.max_buffer_size;

        if !idle_worker_free && !can_grow && !buffer_has_room {
            return Ok(Admission::Exhausted(work));
        }

        state.queue.push_back(work);
        if !idle_worker_free && can_grow {
            state.workers += 1;
            drop(state);
            self.spawn_worker();
        } else {
            drop(state);
        }
        self.shared.work_available.notify_one();
        Ok(Admission::Accepted)
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let mut tasks = self
            .shared
            .tasks
            .lock()
            .recover_poison("BoundedTaskPool::spawn_worker()");

        // Reap workers that already exited
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result
                && e.is_panic()
            {
                warn!(
                    target: LOG_TARGET,
                    "Work on pool {} panicked: {}",
                    self.shared.name,
                    e
                );
            }
        }

        tasks.spawn(worker_loop(shared));
    }

    /// Dispose the pool.
    ///
    /// New work is rejected at once. Queued and running work gets `timeout`
    /// to finish; anything still outstanding after that is cancelled and the
    /// count is logged.
    pub async fn dispose(&self, timeout: ShutdownTimeout) {
        {
            let mut state = self.lock_state("BoundedTaskPool::dispose()");
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        self.shared.closed.cancel();
        self.shared.work_available.notify_waiters();
        self.shared.space_available.notify_waiters();

        let mut tasks = std::mem::take(
            &mut *self
                .shared
                .tasks
                .lock()
                .recover_poison("BoundedTaskPool::dispose()"),
        );

        let graceful = tokio::time::timeout(
            timeout.as_duration(),
            drain_join_set(&mut tasks, "Pool worker"),
        )
        .await;

        if graceful.is_err() {
            let dropped = {
                let mut state = self.lock_state("BoundedTaskPool::dispose()");
                let dropped = state.queue.len();
                state.queue.clear();
                dropped
            };
            warn!(
                target: LOG_TARGET,
                "Pool {} did not drain within {:?}; cancelling {} running and {} queued work items",
                self.shared.name,
                timeout.as_duration(),
                tasks.len(),
                dropped
            );
            tasks.abort_all();
            drain_join_set(&mut tasks, "Pool worker").await;
        } else {
            debug!(target: LOG_TARGET, "Pool {} disposed", self.shared.name);
        }
    }
}

async fn worker_loop(shared: Arc<PoolShared>) {
    let _guard = WorkerGuard {
        shared: Arc::clone(&shared),
    };

    loop {
        let Some(work) = next_work(&shared).await else {
            return;
        };
        work.await;
    }
}

/// Wait for the next queued item, or `None` when this worker should exit.
async fn next_work(shared: &PoolShared) -> Option<Work> {
    loop {
        let notified = shared.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        {
            let mut state = shared.state.lock().recover_poison("BoundedTaskPool worker");
            if let Some(work) = state.queue.pop_front() {
                drop(state);
                shared.space_available.notify_one();
                return Some(work);
            }
            if state.disposed {
                return None;
            }
            state.idle += 1;
        }

        let woken = tokio::select! {
            _ = &mut notified => true,
            _ = shared.closed.cancelled() => true,
            _ = tokio::time::sleep(shared.profile.thread_ttl()) => false,
        };

        let mut state = shared.state.lock().recover_poison("BoundedTaskPool worker");
        state.idle = state.idle.saturating_sub(1);
        if !woken && state.queue.is_empty() && state.workers > shared.profile.max_threads_idle {
            // Count is decremented by WorkerGuard
            return None;
        }
    }
}
