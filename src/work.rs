//! Work management for connectors.
//!
//! Each connector owns three [`BoundedTaskPool`]s (receiving, dispatching,
//! requesting) sized by the matching [`ThreadingProfile`](crate::config::ThreadingProfile),
//! plus one [`PeriodicScheduler`] for fixed-delay polling. Both shut down
//! gracefully first and fall back to cancelling outstanding tasks once the
//! [`ShutdownTimeout`] expires.

mod scheduler;
mod shutdown_timeout;
mod task_pool;

pub use scheduler::{PeriodicScheduler, ScheduleHandle};
pub use shutdown_timeout::ShutdownTimeout;
pub use task_pool::{BoundedTaskPool, Work};

const LOG_TARGET: &str = "connector_runtime::work";

/// Drains a JoinSet, logging any task panics with the provided context.
pub(crate) async fn drain_join_set(join_set: &mut tokio::task::JoinSet<()>, task_context: &str) {
    while let Some(result) = join_set.join_next().await {
        if let Err(e) = result
            && e.is_panic()
        {
            log::error!(
                target: LOG_TARGET,
                "{} panicked: {}",
                task_context,
                e
            );
        }
    }
}
