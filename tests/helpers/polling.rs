//! Pollers that observe how often, and how concurrently, they are called.

// Shared across several test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use connector_runtime::{BoxError, MessageReceiver, Poller};

/// Poller that takes `duration` per poll and counts overlapping calls.
pub struct SlowPoller {
    duration: Duration,
    primary_only: bool,
    pub polls: AtomicUsize,
    pub active: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub completed: AtomicUsize,
    pub connects: AtomicUsize,
    started: AtomicBool,
}

impl SlowPoller {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self::build(duration, false))
    }

    /// A poller whose receiver only consumes on the cluster primary.
    pub fn primary_only(duration: Duration) -> Arc<Self> {
        Arc::new(Self::build(duration, true))
    }

    fn build(duration: Duration, primary_only: bool) -> Self {
        Self {
            duration,
            primary_only,
            polls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// True once any poll has begun.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Poller for SlowPoller {
    async fn poll(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(self.duration).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn do_connect(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn should_consume_in_every_node(&self) -> bool {
        !self.primary_only
    }
}

/// Poller that always fails.
pub struct FailingPoller;

#[async_trait]
impl Poller for FailingPoller {
    async fn poll(&self, _receiver: &Arc<MessageReceiver>) -> Result<(), BoxError> {
        Err("queue unavailable".into())
    }
}
