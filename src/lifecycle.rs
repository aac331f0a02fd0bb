//! Phase-based lifecycle shared by connectors and receivers.
//!
//! Every managed object walks Initialise → Start → Stop → Dispose, with
//! Start/Stop allowed to cycle. The [`LifecycleManager`] enforces the legal
//! order and serialises phase execution for its owner.

mod manager;
mod state;

pub use manager::LifecycleManager;
pub use state::{LifecyclePhase, LifecycleState};
