//! # packet-mux
//!
//! Length-prefixed opcode packets over non-blocking TCP, driven by a single-threaded
//! readiness multiplexer.
//!
//! ## Wire Format
//! ```text
//! +-----------------+---------------------+------------------------+
//! | opcode: u16 BE  | payload_len: u16 BE | payload: payload_len B |
//! +-----------------+---------------------+------------------------+
//! ```
//! A frame never exceeds 4096 bytes including its header.
//!
//! ## Modules
//! - [`core`]: `Packet` buffer and frame reassembly
//! - [`transport`]: connected and listening sockets, the `SocketHandler` multiplexer
//! - [`protocol`]: packet handler hooks and opcode dispatch
//! - [`service`]: identity-service interface consumed by handlers
//! - [`config`], [`utils`]: configuration, logging, metrics, timeouts
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use packet_mux::{ConnectSocket, Dispatcher, Packet, PacketHandler, SocketHandler};
//!
//! # fn main() -> packet_mux::Result<()> {
//! let mut server = SocketHandler::new()?;
//! server.initialize(100)?;
//! server.listen("127.0.0.1:9000".parse().unwrap(), |_: &ConnectSocket| {
//!     let dispatcher = Dispatcher::new().on(1, |socket, _packet| {
//!         socket.send_data(&Packet::new(2))
//!     });
//!     Some(Box::new(dispatcher) as Box<dyn PacketHandler>)
//! })?;
//!
//! loop {
//!     server.update(Some(Duration::from_millis(50)))?;
//! }
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::packet::{Packet, Placeholder, WireValue};
pub use error::{ProtocolError, Result};
pub use protocol::{ConnectionFactory, Dispatcher, PacketHandler};
pub use service::{IdentityService, MemoryDirectory};
pub use transport::{ConnectSocket, HandlerContext, ListenSocket, Socket, SocketHandler, SocketId};
