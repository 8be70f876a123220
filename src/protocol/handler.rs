//! Per-connection packet handling.
//!
//! A [`PacketHandler`] is attached to each connection registered with a
//! [`SocketHandler`](crate::transport::SocketHandler); listeners create them through a
//! [`ConnectionFactory`] as peers are accepted.

use crate::core::packet::Packet;
use crate::error::Result;
use crate::transport::{ConnectSocket, HandlerContext};

/// Receives every complete frame of one connection
pub trait PacketHandler {
    /// Handle one reassembled packet
    ///
    /// An error is logged and counted; the connection stays open. To drop the peer,
    /// call `socket.disconnect()` or `ctx.remove_current()`.
    fn on_packet(
        &mut self,
        socket: &mut ConnectSocket,
        packet: Packet,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<()>;

    /// Called once when the connection is removed from its handler
    fn on_disconnect(&mut self, _socket: &ConnectSocket) {}
}

/// Builds the handler for each accepted connection
pub trait ConnectionFactory {
    /// Return `None` to refuse the connection
    fn on_connect(&mut self, socket: &ConnectSocket) -> Option<Box<dyn PacketHandler>>;
}

impl<F> ConnectionFactory for F
where
    F: FnMut(&ConnectSocket) -> Option<Box<dyn PacketHandler>>,
{
    fn on_connect(&mut self, socket: &ConnectSocket) -> Option<Box<dyn PacketHandler>> {
        self(socket)
    }
}
