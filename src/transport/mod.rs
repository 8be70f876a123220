//! # Transport Layer
//!
//! Non-blocking TCP endpoints and the single-threaded multiplexer that drives them.
//!
//! ## Components
//! - **ConnectSocket**: one TCP connection with per-connection frame reassembly
//! - **ListenSocket**: a bound listener that admits peers through a [`ConnectionFactory`]
//! - **SocketHandler**: readiness-driven registry that updates every ready socket once per tick
//!
//! Sockets registered with a [`SocketHandler`] are owned by it and addressed by [`SocketId`].
//!
//! [`ConnectionFactory`]: crate::protocol::ConnectionFactory

use std::fmt;
use std::net::SocketAddr;

use mio::Token;

pub mod handler;
pub mod listener;
pub mod socket;

pub use handler::{HandlerContext, SocketHandler};
pub use listener::ListenSocket;
pub use socket::ConnectSocket;

/// Stable handle of a socket registered with a [`SocketHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(usize);

impl SocketId {
    pub(crate) fn new(raw: usize) -> Self {
        SocketId(raw)
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        SocketId(token.0)
    }

    /// Raw numeric value, useful as a log field
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capabilities shared by connected and listening sockets
pub trait Socket {
    /// Handle assigned on registration, if registered
    fn id(&self) -> Option<SocketId>;

    /// Local address the socket is bound to
    fn local_addr(&self) -> SocketAddr;

    /// Remote address; `None` for listeners
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Whether the socket is still usable
    fn is_connected(&self) -> bool;

    /// Close the socket. A registered socket is unregistered at the end of the current update.
    fn disconnect(&mut self);
}
