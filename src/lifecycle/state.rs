//! Lifecycle states and phases.

use std::fmt;

/// Phase that can be fired on a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    Initialise,
    Start,
    Stop,
    Dispose,
}

impl LifecyclePhase {
    /// Transitional state entered while this phase's callback runs.
    pub(crate) fn in_progress_state(self) -> LifecycleState {
        match self {
            LifecyclePhase::Initialise => LifecycleState::Initialising,
            LifecyclePhase::Start => LifecycleState::Starting,
            LifecyclePhase::Stop => LifecycleState::Stopping,
            LifecyclePhase::Dispose => LifecycleState::Disposing,
        }
    }

    /// State recorded once this phase's callback completes.
    pub(crate) fn completed_state(self) -> LifecycleState {
        match self {
            LifecyclePhase::Initialise => LifecycleState::Initialised,
            LifecyclePhase::Start => LifecycleState::Started,
            LifecyclePhase::Stop => LifecycleState::Stopped,
            LifecyclePhase::Dispose => LifecycleState::Disposed,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Initialise => "initialise",
            LifecyclePhase::Start => "start",
            LifecyclePhase::Stop => "stop",
            LifecyclePhase::Dispose => "dispose",
        };
        f.write_str(name)
    }
}

/// State of a managed object.
///
/// State transitions:
/// - Created -> Initialising -> Initialised
/// - Initialised | Stopped -> Starting -> Started
/// - Started -> Stopping -> Stopped
/// - any non-disposed state -> Disposing -> Disposed (terminal)
///
/// A failed phase callback reverts to the state held before the phase began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    Created,
    Initialising,
    Initialised,
    Starting,
    Started,
    Stopping,
    Stopped,
    Disposing,
    Disposed,
}

impl LifecycleState {
    pub fn is_initialised(self) -> bool {
        !matches!(self, LifecycleState::Created | LifecycleState::Initialising)
    }

    pub fn is_starting(self) -> bool {
        self == LifecycleState::Starting
    }

    pub fn is_started(self) -> bool {
        self == LifecycleState::Started
    }

    pub fn is_stopping(self) -> bool {
        self == LifecycleState::Stopping
    }

    /// Stopped, or initialised but never started.
    pub fn is_stopped(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Initialised)
    }

    pub fn is_disposed(self) -> bool {
        self == LifecycleState::Disposed
    }

    /// True while a phase callback is running.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            LifecycleState::Initialising
                | LifecycleState::Starting
                | LifecycleState::Stopping
                | LifecycleState::Disposing
        )
    }

    /// Whether `phase` may be fired from this state.
    pub(crate) fn allows(self, phase: LifecyclePhase) -> bool {
        match phase {
            LifecyclePhase::Initialise => self == LifecycleState::Created,
            LifecyclePhase::Start => {
                matches!(self, LifecycleState::Initialised | LifecycleState::Stopped)
            }
            LifecyclePhase::Stop => self == LifecycleState::Started,
            LifecyclePhase::Dispose => !self.is_transitional() && !self.is_disposed(),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initialising => "initialising",
            LifecycleState::Initialised => "initialised",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Disposing => "disposing",
            LifecycleState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}
