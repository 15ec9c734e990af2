//! Async host for nearby-core: transport boundary, in-memory hub, coordinator actor.

pub mod config;
pub mod coordinator;
mod link;
pub mod memory;
pub mod transport;

pub use config::NodeConfig;
pub use coordinator::Coordinator;
pub use memory::{MemoryHub, MemoryTransport};
pub use transport::{Transport, TransportError, TransportEvent};
