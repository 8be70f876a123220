//! # Protocol Layer
//!
//! Application-facing hooks of the multiplexer.
//!
//! ## Components
//! - **PacketHandler**: receives each reassembled packet of a connection
//! - **ConnectionFactory**: creates a handler for every accepted peer
//! - **Dispatcher**: a `PacketHandler` routing packets by opcode

pub mod dispatcher;
pub mod handler;

pub use dispatcher::Dispatcher;
pub use handler::{ConnectionFactory, PacketHandler};
