//! Retry policy driving connect attempts.
//!
//! A [`RetryPolicy`] runs a [`RetryCallback`] until it succeeds or the
//! configured retry count is exhausted, sleeping `frequency` between
//! attempts. In asynchronous mode the whole loop runs as a separate task on
//! the supplied runtime handle and `execute` returns at once, so a connector
//! whose transport is down does not hold up the rest of the runtime.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicyConfig;
use crate::error::{ConnectorError, ConnectorResult};

const LOG_TARGET: &str = "connector_runtime::retry";

/// State of one retry run, handed to each attempt.
#[derive(Debug, Default, Clone)]
pub struct RetryContext {
    attempts: u32,
    last_failure: Option<Arc<ConnectorError>>,
    succeeded: bool,
    scheduled: bool,
}

impl RetryContext {
    /// Number of attempts started so far, including the current one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Failure of the previous attempt, if any.
    pub fn last_failure(&self) -> Option<&Arc<ConnectorError>> {
        self.last_failure.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.succeeded
    }

    /// True when the work was handed to a background task and has not run yet.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }
}

/// Unit of work run under a retry policy.
#[async_trait]
pub trait RetryCallback: Send + Sync {
    /// Perform one attempt. An `Err` asks the policy for another attempt.
    async fn do_work(&self, context: &RetryContext) -> ConnectorResult<()>;

    /// Human readable description used in log output.
    fn work_description(&self) -> String;

    /// Called once when the policy gives up, in both execution modes.
    fn retries_exhausted(&self, _context: &RetryContext) {}
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryPolicyConfig::no_retry())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    pub fn is_asynchronous(&self) -> bool {
        self.config.asynchronous
    }

    fn allows_retry(&self, attempts: u32) -> bool {
        self.config.forever || attempts <= self.config.count
    }

    /// Run `callback` under this policy.
    ///
    /// When the policy is asynchronous and an `executor` is supplied, the
    /// retry loop is spawned there and a scheduled (empty) context is
    /// returned immediately. Otherwise the loop runs on the caller.
    ///
    /// Cancelling `interrupt` aborts a back-off sleep with
    /// [`ConnectorError::Interrupted`].
    pub async fn execute(
        &self,
        callback: Arc<dyn RetryCallback>,
        executor: Option<&Handle>,
        interrupt: &CancellationToken,
    ) -> ConnectorResult<RetryContext> {
        if self.config.asynchronous
            && let Some(executor) = executor
        {
            let policy = self.clone();
            let interrupt = interrupt.clone();
            debug!(
                target: LOG_TARGET,
                "Scheduling asynchronous retry for {}",
                callback.work_description()
            );
            executor.spawn(async move {
                let description = callback.work_description();
                if let Err(e) = policy.run(callback, &interrupt).await {
                    error!(
                        target: LOG_TARGET,
                        "Asynchronous retry for {} gave up: {}",
                        description,
                        e
                    );
                }
            });
            return Ok(RetryContext {
                scheduled: true,
                ..Default::default()
            });
        }

        self.run(callback, interrupt).await
    }

    async fn run(
        &self,
        callback: Arc<dyn RetryCallback>,
        interrupt: &CancellationToken,
    ) -> ConnectorResult<RetryContext> {
        let mut context = RetryContext::default();

        loop {
            context.attempts += 1;

            let failure = match callback.do_work(&context).await {
                Ok(()) => {
                    if context.attempts > 1 {
                        info!(
                            target: LOG_TARGET,
                            "{} succeeded after {} attempts",
                            callback.work_description(),
                            context.attempts
                        );
                    }
                    context.succeeded = true;
                    context.last_failure = None;
                    return Ok(context);
                }
                Err(e) => Arc::new(e),
            };

            warn!(
                target: LOG_TARGET,
                "Attempt {} of {} failed: {}",
                context.attempts,
                callback.work_description(),
                failure
            );
            context.last_failure = Some(Arc::clone(&failure));

            if !self.allows_retry(context.attempts) {
                callback.retries_exhausted(&context);
                drop(context);
                return Err(Arc::try_unwrap(failure).unwrap_or_else(ConnectorError::Shared));
            }

            tokio::select! {
                _ = interrupt.cancelled() => {
                    callback.retries_exhausted(&context);
                    return Err(ConnectorError::interrupted(format!(
                        "waiting to retry {}",
                        callback.work_description()
                    )));
                }
                _ = tokio::time::sleep(self.config.frequency()) => {}
            }
        }
    }
}
