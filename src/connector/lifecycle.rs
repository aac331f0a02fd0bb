//! Initialise / start / stop / dispose for [`Connector`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwapOption;
use log::{debug, error, info};

use super::{Connector, LOG_TARGET};
use crate::config::{ThreadingProfile, WhenExhausted};
use crate::error::{ConnectorError, ConnectorResult};
use crate::lifecycle::LifecyclePhase;
use crate::pool::KeyedResourcePool;
use crate::receiver::MessageReceiver;
use crate::retry::RetryPolicy;
use crate::work::{BoundedTaskPool, PeriodicScheduler};

/// Concurrent scheduled runs allowed on a connector's polling scheduler.
const SCHEDULER_CONCURRENCY: usize = 4;

impl Connector {
    /// Build the retry policy, object pools and task pools, then run the
    /// transport's initialise hook.
    ///
    /// On failure everything created here is released again and the
    /// connector stays in `Created`.
    pub async fn initialise(&self) -> ConnectorResult<()> {
        self.inner
            .lifecycle
            .fire_initialise_phase(|| async {
                let policy = self
                    .inner
                    .config
                    .retry
                    .clone()
                    .map(RetryPolicy::new)
                    .unwrap_or_default();
                self.inner.retry_policy.store(Some(Arc::new(policy)));

                self.create_object_pools();
                self.create_work_managers();

                if let Err(e) = self.inner.hooks.do_initialise().await {
                    self.release_initialised_resources().await;
                    return Err(ConnectorError::lifecycle_with_source(
                        self.name(),
                        "transport initialise failed",
                        e,
                    ));
                }
                Ok(())
            })
            .await
            .map_err(|e| {
                if e.is_illegal_transition() {
                    e
                } else {
                    ConnectorError::initialisation(self.name(), e)
                }
            })
    }

    /// Start the connector.
    ///
    /// Connects first if needed; receivers are then started by the connect
    /// itself, which may complete later under an asynchronous retry policy.
    pub async fn start(&self) -> ConnectorResult<()> {
        if self.is_initial_state_stopped() {
            info!(
                target: LOG_TARGET,
                "Connector {} has initial state 'stopped'; not starting",
                self.name()
            );
            return Ok(());
        }

        let current = self.state();
        if !current.allows(LifecyclePhase::Start) {
            return Err(ConnectorError::IllegalLifecycleTransition {
                component: self.name().to_string(),
                current,
                requested: LifecyclePhase::Start,
            });
        }

        if self.is_connected() {
            self.start_after_connect().await
        } else {
            self.inner.start_on_connect.store(true, Ordering::Release);
            self.connect().await
        }
    }

    pub(crate) async fn start_after_connect(&self) -> ConnectorResult<()> {
        self.inner.start_on_connect.store(false, Ordering::Release);

        self.inner
            .lifecycle
            .fire_start_phase(|| async {
                self.create_work_managers();
                self.inner
                    .scheduler
                    .store(Some(Arc::new(PeriodicScheduler::with_max_concurrent_runs(
                        format!("{}.scheduler", self.name()),
                        SCHEDULER_CONCURRENCY,
                    ))));

                if let Err(e) = self.inner.hooks.do_start().await {
                    if let Some(scheduler) = self.inner.scheduler.swap(None) {
                        scheduler.shutdown(self.inner.runtime.shutdown_timeout()).await;
                    }
                    return Err(ConnectorError::lifecycle_with_source(
                        self.name(),
                        "transport start failed",
                        e,
                    ));
                }

                self.start_receivers().await
            })
            .await
    }

    /// Start every registered receiver. All receivers are attempted; every
    /// failure is logged and the first one returned.
    async fn start_receivers(&self) -> ConnectorResult<()> {
        let mut first_error = None;
        for receiver in self.receivers() {
            if let Err(e) = self.start_receiver(&receiver).await {
                error!(
                    target: LOG_TARGET,
                    "Failed to start receiver {}: {}",
                    receiver.resource_id(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn start_receiver(&self, receiver: &Arc<MessageReceiver>) -> ConnectorResult<()> {
        if receiver.flow().is_started() {
            return receiver.start().await;
        }
        if !self.retry_policy().is_asynchronous() {
            debug!(
                target: LOG_TARGET,
                "Flow {} not started; leaving receiver {} to start with it",
                receiver.flow().name(),
                receiver.resource_id()
            );
            return Ok(());
        }

        let started = self
            .inner
            .runtime
            .wait_until_started(self.inner.config.context_start_timeout(), &self.inner.interrupt)
            .await?;
        if started {
            receiver.start().await
        } else {
            Err(ConnectorError::lifecycle(
                receiver.resource_id(),
                "Timeout waiting for runtime to be completely started",
            ))
        }
    }

    /// Stop the connector. Receivers stay connected.
    ///
    /// Transport and receiver stop failures are logged, never returned, so
    /// every receiver gets its stop attempt.
    pub async fn stop(&self) -> ConnectorResult<()> {
        self.inner
            .lifecycle
            .fire_stop_phase(|| async {
                let timeout = self.inner.runtime.shutdown_timeout();
                if let Some(scheduler) = self.inner.scheduler.load_full() {
                    scheduler.shutdown(timeout).await;
                }

                if let Err(e) = self.inner.hooks.do_stop().await {
                    error!(target: LOG_TARGET, "Transport stop failed for {}: {}", self.name(), e);
                }

                for receiver in self.receivers() {
                    if let Err(e) = receiver.stop().await {
                        error!(
                            target: LOG_TARGET,
                            "Failed to stop receiver {}: {}",
                            receiver.resource_id(),
                            e
                        );
                    }
                }

                self.dispose_work_managers().await;
                if let Some(pool) = self.inner.dispatchers.load_full() {
                    pool.clear();
                }
                if let Some(pool) = self.inner.requesters.load_full() {
                    pool.clear();
                }
                self.inner.scheduler.store(None);
                Ok(())
            })
            .await
    }

    /// Stop and disconnect (failures logged), then release everything the
    /// connector owns. A disposed connector cannot be used again.
    ///
    /// A connect attempt already talking to the transport is waited for, so
    /// whatever it connected is disconnected here.
    pub async fn dispose(&self) -> ConnectorResult<()> {
        self.inner.interrupt.cancel();
        let _connection = self.lock_connection().await;

        if self.is_started() {
            if let Err(e) = self.stop().await {
                error!(target: LOG_TARGET, "Failed to stop {} during dispose: {}", self.name(), e);
            }
        }
        if self.is_connected() {
            if let Err(e) = self.disconnect().await {
                error!(
                    target: LOG_TARGET,
                    "Failed to disconnect {} during dispose: {}",
                    self.name(),
                    e
                );
            }
        }

        self.inner
            .lifecycle
            .fire_dispose_phase(|| async {
                if let Err(e) = self.inner.hooks.do_dispose().await {
                    error!(target: LOG_TARGET, "Transport dispose failed for {}: {}", self.name(), e);
                }

                let keys: Vec<String> = self
                    .inner
                    .receivers
                    .iter()
                    .map(|entry| entry.key().clone())
                    .collect();
                for key in keys {
                    if let Some((_, receiver)) = self.inner.receivers.remove(&key) {
                        self.destroy_receiver(&receiver).await;
                    }
                }

                if let Some(pool) = self.inner.dispatchers.load_full() {
                    pool.close();
                }
                if let Some(pool) = self.inner.requesters.load_full() {
                    pool.close();
                }
                self.dispose_work_managers().await;
                if let Some(scheduler) = self.inner.scheduler.swap(None) {
                    scheduler.shutdown(self.inner.runtime.shutdown_timeout()).await;
                }
                Ok(())
            })
            .await
    }

    /// Dispatcher pool capacity: one per dispatching worker, plus one for
    /// the caller when an exhausted pool runs work inline.
    pub(crate) fn default_dispatchers_active(&self) -> usize {
        let profile = &self.inner.config.dispatcher_threading;
        let caller_runs = usize::from(profile.pool_exhausted_action == WhenExhausted::Run);
        profile.max_threads_active + caller_runs
    }

    fn create_object_pools(&self) {
        let config = &self.inner.config;
        let dispatchers = KeyedResourcePool::new(
            format!("{}.dispatchers", self.name()),
            self.inner.hooks.dispatcher_factory(),
            self.default_dispatchers_active(),
            config.dispatcher_pool.exhausted_action,
            config.dispatcher_pool.max_wait(),
            self.inner.interrupt.clone(),
        );
        let requesters = KeyedResourcePool::new(
            format!("{}.requesters", self.name()),
            self.inner.hooks.requester_factory(),
            config.requester_threading.max_threads_active,
            config.requester_pool.exhausted_action,
            config.requester_pool.max_wait(),
            self.inner.interrupt.clone(),
        );
        self.inner.dispatchers.store(Some(Arc::new(dispatchers)));
        self.inner.requesters.store(Some(Arc::new(requesters)));
    }

    /// Create whichever task pools are missing.
    fn create_work_managers(&self) {
        let config = &self.inner.config;
        for (slot, role, profile) in [
            (&self.inner.receiver_pool, "receiver", &config.receiver_threading),
            (&self.inner.dispatcher_task_pool, "dispatcher", &config.dispatcher_threading),
            (&self.inner.requester_task_pool, "requester", &config.requester_threading),
        ] {
            self.ensure_task_pool(slot, role, profile);
        }
    }

    fn ensure_task_pool(
        &self,
        slot: &ArcSwapOption<BoundedTaskPool>,
        role: &str,
        profile: &ThreadingProfile,
    ) {
        if slot.load_full().is_none() {
            let name = format!("{}.{}", self.name(), role);
            debug!(target: LOG_TARGET, "Creating task pool {}", name);
            slot.store(Some(Arc::new(BoundedTaskPool::new(name, profile.clone()))));
        }
    }

    async fn dispose_work_managers(&self) {
        let timeout = self.inner.runtime.shutdown_timeout();
        for slot in [
            &self.inner.receiver_pool,
            &self.inner.dispatcher_task_pool,
            &self.inner.requester_task_pool,
        ] {
            if let Some(pool) = slot.swap(None) {
                pool.dispose(timeout).await;
            }
        }
    }

    async fn release_initialised_resources(&self) {
        if let Some(pool) = self.inner.dispatchers.swap(None) {
            pool.close();
        }
        if let Some(pool) = self.inner.requesters.swap(None) {
            pool.close();
        }
        self.dispose_work_managers().await;
        self.inner.retry_policy.store(None);
    }

    pub(crate) async fn destroy_receiver(&self, receiver: &Arc<MessageReceiver>) {
        if let Err(e) = receiver.dispose().await {
            error!(
                target: LOG_TARGET,
                "Failed to dispose receiver {}: {}",
                receiver.resource_id(),
                e
            );
        }
    }
}
