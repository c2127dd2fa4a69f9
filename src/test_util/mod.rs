//! Utilities for testing code based on this crate: an in-memory network with configurable loss
//!  that can stand in for UDP.
//!
//! They are part of the crate's regular (non-#[cfg(test)]) code so integration tests and
//!  applications can use them.

pub mod memory_network;

pub use memory_network::MemoryNetwork;
