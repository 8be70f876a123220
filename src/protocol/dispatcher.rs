use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::handler::PacketHandler;
use crate::transport::{ConnectSocket, HandlerContext};
use std::collections::HashMap;
use tracing::trace;

type HandlerFn = dyn FnMut(&mut ConnectSocket, &mut Packet) -> Result<()> + 'static;

/// Packet handler that routes each packet to the closure registered for its opcode.
pub struct Dispatcher {
    handlers: HashMap<u16, Box<HandlerFn>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<u16> = self.handlers.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("Dispatcher").field("opcodes", &opcodes).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Route `opcode` to `handler`, replacing any earlier registration
    pub fn register<F>(&mut self, opcode: u16, handler: F) -> &mut Self
    where
        F: FnMut(&mut ConnectSocket, &mut Packet) -> Result<()> + 'static,
    {
        self.handlers.insert(opcode, Box::new(handler));
        self
    }

    /// Builder form of [`Dispatcher::register`]
    pub fn on<F>(mut self, opcode: u16, handler: F) -> Self
    where
        F: FnMut(&mut ConnectSocket, &mut Packet) -> Result<()> + 'static,
    {
        self.register(opcode, handler);
        self
    }

    pub fn handles(&self, opcode: u16) -> bool {
        self.handlers.contains_key(&opcode)
    }

    pub fn dispatch(&mut self, socket: &mut ConnectSocket, packet: &mut Packet) -> Result<()> {
        let opcode = packet.opcode();
        trace!(opcode, len = packet.len(), "Dispatching packet");

        self.handlers
            .get_mut(&opcode)
            .ok_or(ProtocolError::UnexpectedMessage(opcode))
            .and_then(|handler| handler(socket, packet))
    }
}

impl PacketHandler for Dispatcher {
    fn on_packet(
        &mut self,
        socket: &mut ConnectSocket,
        mut packet: Packet,
        _ctx: &mut HandlerContext<'_>,
    ) -> Result<()> {
        self.dispatch(socket, &mut packet)
    }
}
