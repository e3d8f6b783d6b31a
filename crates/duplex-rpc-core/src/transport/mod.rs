//! Bundled [`Channel`](crate::channel::Channel) implementations.
//!
//! - [`memory`]: in-process pairs, used by tests and embedders.
//! - [`tcp`]: length-prefixed JSON event frames over TCP (see [`frame`]).

pub mod frame;
pub mod memory;
pub mod tcp;

pub use memory::{MemoryChannel, MemoryListener};
pub use tcp::{TcpChannel, TcpChannelListener};
