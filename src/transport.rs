//! Concrete transports.
//!
//! Only the in-process [`memory`] transport ships with the runtime; other
//! transports plug in through [`TransportHooks`](crate::connector::TransportHooks).

pub mod memory;

pub use memory::{MemoryBroker, MemoryTransport};
