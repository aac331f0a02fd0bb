//! Lifecycle manager enforcing legal phase order for one owner.

use std::future::Future;
use std::sync::Mutex;

use log::{debug, error, info};

use super::{LifecyclePhase, LifecycleState};
use crate::error::{ConnectorError, ConnectorResult, LockResultExt};

const LOG_TARGET: &str = "connector_runtime::lifecycle";

#[derive(Debug, Default)]
struct PhaseRecord {
    state: LifecycleState,
    /// Last phase that was attempted, whether or not it completed
    current_phase: Option<LifecyclePhase>,
}

/// Enforces the Initialise → Start ↔ Stop → Dispose sequence for one owner.
///
/// Phase execution is serialised: while a callback runs the owner sits in a
/// transitional state (`Starting`, `Stopping`, ...) and any other phase
/// request is rejected with [`ConnectorError::IllegalLifecycleTransition`].
/// No lock is held across the callback, so callbacks may freely fire phases
/// on *other* managers (a connector starting its receivers).
///
/// Firing Stop on an object that is already stopped (or stopping, or
/// initialised but never started) is a silent no-op: teardown code calls
/// `stop()` defensively.
#[derive(Debug)]
pub struct LifecycleManager {
    component: String,
    record: Mutex<PhaseRecord>,
}

/// Reverts the owner to its previous state unless the phase completed.
///
/// Covers both callback errors and the phase future being dropped mid-way.
struct PhaseGuard<'a> {
    manager: &'a LifecycleManager,
    phase: LifecyclePhase,
    previous: LifecycleState,
    committed: bool,
}

impl PhaseGuard<'_> {
    fn commit(mut self) {
        self.manager.set_state(self.phase.completed_state());
        self.committed = true;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.manager.set_state(self.previous);
        }
    }
}

impl LifecycleManager {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            record: Mutex::new(PhaseRecord::default()),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.record
            .lock()
            .recover_poison("LifecycleManager::state()")
            .state
    }

    /// Last phase attempted on this owner.
    pub fn current_phase(&self) -> Option<LifecyclePhase> {
        self.record
            .lock()
            .recover_poison("LifecycleManager::current_phase()")
            .current_phase
    }

    fn set_state(&self, state: LifecycleState) {
        self.record
            .lock()
            .recover_poison("LifecycleManager::set_state()")
            .state = state;
    }

    pub async fn fire_initialise_phase<F, Fut>(&self, callback: F) -> ConnectorResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectorResult<()>>,
    {
        self.fire_phase(LifecyclePhase::Initialise, callback).await
    }

    pub async fn fire_start_phase<F, Fut>(&self, callback: F) -> ConnectorResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectorResult<()>>,
    {
        self.fire_phase(LifecyclePhase::Start, callback).await
    }

    pub async fn fire_stop_phase<F, Fut>(&self, callback: F) -> ConnectorResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectorResult<()>>,
    {
        self.fire_phase(LifecyclePhase::Stop, callback).await
    }

    pub async fn fire_dispose_phase<F, Fut>(&self, callback: F) -> ConnectorResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectorResult<()>>,
    {
        self.fire_phase(LifecyclePhase::Dispose, callback).await
    }

    /// Fire `phase`, running `callback` inside it.
    ///
    /// On callback failure the phase stays recorded as attempted
    /// ([`current_phase`](Self::current_phase)) but the state reverts, so the
    /// same phase can be retried.
    pub async fn fire_phase<F, Fut>(&self, phase: LifecyclePhase, callback: F) -> ConnectorResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ConnectorResult<()>>,
    {
        let previous = {
            let mut record = self
                .record
                .lock()
                .recover_poison("LifecycleManager::fire_phase()");
            let current = record.state;

            if phase == LifecyclePhase::Stop
                && (current.is_stopped() || current.is_stopping())
            {
                debug!(
                    target: LOG_TARGET,
                    "Ignoring stop for {} ({})",
                    self.component,
                    current
                );
                return Ok(());
            }

            if !current.allows(phase) {
                return Err(ConnectorError::IllegalLifecycleTransition {
                    component: self.component.clone(),
                    current,
                    requested: phase,
                });
            }

            record.current_phase = Some(phase);
            record.state = phase.in_progress_state();
            current
        };

        let guard = PhaseGuard {
            manager: self,
            phase,
            previous,
            committed: false,
        };

        debug!(target: LOG_TARGET, "Firing {} phase for {}", phase, self.component);

        match callback().await {
            Ok(()) => {
                guard.commit();
                info!(
                    target: LOG_TARGET,
                    "{}: {} -> {}",
                    self.component,
                    previous,
                    phase.completed_state()
                );
                Ok(())
            }
            Err(e) => {
                drop(guard);
                error!(
                    target: LOG_TARGET,
                    "{} phase failed for {}: {}",
                    phase,
                    self.component,
                    e
                );
                Err(e)
            }
        }
    }
}
