//! # Socket Handler
//!
//! Single-threaded connection multiplexer.
//!
//! The handler owns every registered socket in a table keyed by [`SocketId`]; the id doubles
//! as the mio token, so a readiness event maps straight back to its socket. One call to
//! [`SocketHandler::update`] waits for readiness once and updates each ready socket exactly
//! once.
//!
//! ## Fairness
//! A connection gets one read per update and a listener a bounded number of accepts. A
//! socket that may still have input is carried over to the next update, which then polls
//! without blocking, so a flooding peer cannot starve the others.
//!
//! ## Removal
//! A socket is taken out of the table while it is being updated. Removal requested during
//! that update, whether through [`HandlerContext::remove_socket`] or because the connection
//! dropped, is deferred until its update returns; other sockets removed mid-tick are never
//! polled again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll};
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::core::codec::MAX_PAYLOAD_SIZE;
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::{ConnectionFactory, PacketHandler};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{DEFAULT_TIMEOUT, POLL_INTERVAL};

use super::listener::ListenSocket;
use super::socket::ConnectSocket;
use super::{Socket, SocketId};

const FIRST_SOCKET_ID: usize = 1;

/// Connections admitted from one listener per update
const ACCEPTS_PER_UPDATE: usize = 64;

/// Registered connection and the handler its frames are dispatched to
struct Connection {
    socket: ConnectSocket,
    handler: Box<dyn PacketHandler>,
}

enum Slot {
    Listener(ListenSocket),
    Connection(Connection),
}

/// Per-update view handed to packet handlers
pub struct HandlerContext<'a> {
    current: SocketId,
    removals: &'a mut Vec<SocketId>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(current: SocketId, removals: &'a mut Vec<SocketId>) -> Self {
        Self { current, removals }
    }

    /// Id of the socket currently being updated
    pub fn socket_id(&self) -> SocketId {
        self.current
    }

    /// Request removal of any registered socket, including the current one
    ///
    /// Takes effect once the current socket's update returns.
    pub fn remove_socket(&mut self, id: SocketId) {
        if !self.removals.contains(&id) {
            debug!(%id, current = %self.current, "Removal requested");
            self.removals.push(id);
        }
    }

    /// Request removal of the socket currently being updated
    pub fn remove_current(&mut self) {
        self.remove_socket(self.current);
    }

    pub fn is_removal_pending(&self, id: SocketId) -> bool {
        self.removals.contains(&id)
    }
}

/// Readiness-driven registry of listeners and connections
pub struct SocketHandler {
    poll: Poll,
    events: Events,
    slots: HashMap<SocketId, Slot>,
    max_connections: usize,
    initialized: bool,
    /// Socket taken out of the table for its update
    updating: Option<SocketId>,
    pending_removal: Vec<SocketId>,
    /// Sockets that may still have input after their last update
    carry_over: Vec<SocketId>,
    connections: usize,
    next_id: usize,
    max_payload: usize,
    io_timeout: Duration,
    poll_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for SocketHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandler")
            .field("sockets", &self.slots.len())
            .field("max_connections", &self.max_connections)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl SocketHandler {
    /// Create an uninitialized handler
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|e| ProtocolError::InitFailed(e.to_string()))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1),
            slots: HashMap::new(),
            max_connections: 0,
            initialized: false,
            updating: None,
            pending_removal: Vec::new(),
            carry_over: Vec::new(),
            connections: 0,
            next_id: FIRST_SOCKET_ID,
            max_payload: MAX_PAYLOAD_SIZE,
            io_timeout: DEFAULT_TIMEOUT,
            poll_timeout: POLL_INTERVAL,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Create and initialize a handler from configuration
    ///
    /// Applies the connection limit, poll timeout, payload limit and I/O timeout. Use
    /// [`serve`](Self::serve) to also listen on the configured server address.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let mut handler = Self::new()?;
        handler.max_payload = config.transport.max_payload_size;
        handler.io_timeout = config.client.io_timeout;
        handler.poll_timeout = config.server.poll_timeout;
        handler.initialize(config.server.max_connections)?;
        Ok(handler)
    }

    /// Create a handler from configuration with a listener on `server.address`
    pub fn serve<F>(config: &NetworkConfig, factory: F) -> Result<(Self, SocketId)>
    where
        F: ConnectionFactory + 'static,
    {
        let addr = config.server.socket_addr()?;
        let mut handler = Self::from_config(config)?;
        let id = handler.listen(addr, factory)?;
        Ok((handler, id))
    }

    /// Size the readiness set for `max_connections` connections plus a listener
    pub fn initialize(&mut self, max_connections: usize) -> Result<()> {
        if max_connections == 0 {
            return Err(ProtocolError::InitFailed(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        self.events = Events::with_capacity(max_connections.saturating_add(1));
        self.max_connections = max_connections;
        self.initialized = true;
        info!(max_connections, "Socket handler initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Payload limit applied to accepted connections
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// I/O timeout applied to accepted connections
    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Wait used by [`tick`](Self::tick)
    pub fn set_poll_timeout(&mut self, timeout: Duration) {
        self.poll_timeout = timeout;
    }

    /// Whether some socket will be updated again without a new readiness event
    pub fn has_pending_input(&self) -> bool {
        !self.carry_over.is_empty()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Registered connections, excluding listeners
    pub fn connection_count(&self) -> usize {
        self.connections
    }

    pub fn listener_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Listener(_)))
            .count()
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Ids of every registered socket, in ascending order
    pub fn socket_ids(&self) -> Vec<SocketId> {
        let mut ids: Vec<SocketId> = self.slots.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn local_addr(&self, id: SocketId) -> Option<SocketAddr> {
        match self.slots.get(&id)? {
            Slot::Listener(listener) => Some(listener.local_addr()),
            Slot::Connection(conn) => Some(conn.socket.local_addr()),
        }
    }

    /// Bound address of a registered listener
    pub fn listener_addr(&self, id: SocketId) -> Option<SocketAddr> {
        match self.slots.get(&id)? {
            Slot::Listener(listener) => Some(listener.local_addr()),
            Slot::Connection(_) => None,
        }
    }

    pub fn peer_addr(&self, id: SocketId) -> Option<SocketAddr> {
        match self.slots.get(&id)? {
            Slot::Listener(_) => None,
            Slot::Connection(conn) => conn.socket.peer_addr(),
        }
    }

    /// Bind a listener on `addr` and register it
    pub fn listen<F>(&mut self, addr: SocketAddr, factory: F) -> Result<SocketId>
    where
        F: ConnectionFactory + 'static,
    {
        if !self.initialized {
            return Err(ProtocolError::NotInitialized);
        }
        let listener = ListenSocket::bind(addr, factory)?;
        self.add_listener(listener)
    }

    /// Register an already bound listener
    pub fn add_listener(&mut self, mut listener: ListenSocket) -> Result<SocketId> {
        if !self.initialized {
            return Err(ProtocolError::NotInitialized);
        }
        let id = self.allocate_id();
        self.poll
            .registry()
            .register(listener.source(), id.token(), Interest::READABLE)
            .map_err(|e| ProtocolError::SocketInvalid(format!("register listener: {e}")))?;
        listener.set_id(id);
        info!(%id, local_addr = %listener.local_addr(), "Registered listener");
        self.slots.insert(id, Slot::Listener(listener));
        Ok(id)
    }

    /// Register an established connection with the handler for its frames
    pub fn add_connection<H>(&mut self, socket: ConnectSocket, handler: H) -> Result<SocketId>
    where
        H: PacketHandler + 'static,
    {
        if !self.initialized {
            return Err(ProtocolError::NotInitialized);
        }
        if !socket.is_connected() {
            return Err(ProtocolError::SocketInvalid(constants::ERR_NOT_CONNECTED.to_string()));
        }
        if self.connection_count() >= self.max_connections {
            self.metrics.connection_rejected();
            return Err(ProtocolError::ConnectionFailed(format!(
                "connection limit {} reached",
                self.max_connections
            )));
        }
        self.register_connection(socket, Box::new(handler))
    }

    /// Remove a socket; returns whether it was registered
    ///
    /// Packet handlers remove sockets through [`HandlerContext`] instead, which defers the
    /// removal of the socket being updated until its update returns.
    pub fn remove_socket(&mut self, id: SocketId) -> bool {
        match self.slots.remove(&id) {
            Some(slot) => {
                self.destroy(id, slot);
                true
            }
            None => false,
        }
    }

    /// Send one packet on a registered connection
    pub fn send_to(&mut self, id: SocketId, packet: &Packet) -> Result<()> {
        let result = match self.slots.get_mut(&id) {
            Some(Slot::Connection(conn)) => conn.socket.send_data(packet),
            Some(Slot::Listener(_)) => {
                return Err(ProtocolError::SocketInvalid(format!("{id} is a listener")))
            }
            None => return Err(ProtocolError::SocketInvalid(format!("{id} is not registered"))),
        };
        if let Some(Slot::Connection(conn)) = self.slots.get(&id) {
            if !conn.socket.is_connected() {
                self.remove_socket(id);
            }
        }
        result
    }

    /// Update every ready socket once, waiting at most the configured poll timeout
    pub fn tick(&mut self) -> Result<usize> {
        self.update(Some(self.poll_timeout))
    }

    /// Wait up to `timeout` for readiness and update every ready socket once
    ///
    /// `None` blocks until at least one socket is ready. Sockets carried over from the
    /// previous update count as ready and make the wait zero. Returns the number of sockets
    /// updated.
    pub fn update(&mut self, timeout: Option<Duration>) -> Result<usize> {
        if !self.initialized {
            return Err(ProtocolError::NotInitialized);
        }

        let mut ready = std::mem::take(&mut self.carry_over);
        let timeout = if ready.is_empty() { timeout } else { Some(Duration::ZERO) };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {
                for event in self.events.iter() {
                    let id = SocketId::from_token(event.token());
                    if !ready.contains(&id) {
                        ready.push(id);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                self.carry_over = ready;
                error!(error = %e, "Readiness poll failed");
                return Err(ProtocolError::PollFailed(e.to_string()));
            }
        }

        let mut updated = 0;
        for id in ready {
            // Removed earlier in this tick
            let Some(slot) = self.slots.remove(&id) else {
                continue;
            };
            updated += 1;
            let more = match slot {
                Slot::Listener(listener) => self.update_listener(id, listener),
                Slot::Connection(conn) => self.update_connection(id, conn),
            };
            if more {
                self.carry_over.push(id);
            }
            self.flush_removals();
        }
        // Carried sockets removed by a later socket in the same tick
        let slots = &self.slots;
        self.carry_over.retain(|id| slots.contains_key(id));
        Ok(updated)
    }

    /// Remove every socket, firing disconnect callbacks
    pub fn close_all(&mut self) {
        let ids = self.socket_ids();
        for id in ids {
            self.remove_socket(id);
        }
        self.carry_over.clear();
        info!("Closed all sockets");
        self.metrics.log_metrics();
    }

    /// Returns whether the backlog may still hold connections
    fn update_listener(&mut self, id: SocketId, mut listener: ListenSocket) -> bool {
        self.updating = Some(id);
        let mut accepted = 0;
        while accepted < ACCEPTS_PER_UPDATE {
            let Some((stream, peer_addr)) = listener.accept() else {
                break;
            };
            accepted += 1;
            self.admit(&mut listener, stream, peer_addr);
        }
        self.updating = None;

        if listener.is_connected() && !self.pending_removal.contains(&id) {
            self.slots.insert(id, Slot::Listener(listener));
            accepted == ACCEPTS_PER_UPDATE
        } else {
            self.pending_removal.retain(|pending| *pending != id);
            self.destroy(id, Slot::Listener(listener));
            false
        }
    }

    /// Returns whether the connection may still have unread input
    fn update_connection(&mut self, id: SocketId, mut conn: Connection) -> bool {
        self.updating = Some(id);
        let more = {
            let mut ctx = HandlerContext::new(id, &mut self.pending_removal);
            conn.socket.update(conn.handler.as_mut(), &mut ctx)
        };
        self.updating = None;

        if conn.socket.is_connected() && !self.pending_removal.contains(&id) {
            self.slots.insert(id, Slot::Connection(conn));
            more
        } else {
            self.pending_removal.retain(|pending| *pending != id);
            self.destroy(id, Slot::Connection(conn));
            false
        }
    }

    fn admit(
        &mut self,
        listener: &mut ListenSocket,
        stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
    ) {
        if self.connections >= self.max_connections {
            warn!(
                %peer_addr,
                max_connections = self.max_connections,
                "Connection limit reached, rejecting"
            );
            self.metrics.connection_rejected();
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }

        let mut socket = match ConnectSocket::from_stream(stream, peer_addr) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(%peer_addr, error = %e, "Failed to set up accepted connection");
                self.metrics.connection_error();
                return;
            }
        };
        socket.set_max_payload(self.max_payload);
        socket.set_io_timeout(self.io_timeout);

        let Some(handler) = listener.on_connect(&socket) else {
            info!(%peer_addr, "Connection refused by factory");
            self.metrics.connection_rejected();
            socket.disconnect();
            return;
        };

        if let Err(e) = self.register_connection(socket, handler) {
            warn!(%peer_addr, error = %e, "Failed to register accepted connection");
            self.metrics.connection_error();
        }
    }

    fn register_connection(
        &mut self,
        mut socket: ConnectSocket,
        handler: Box<dyn PacketHandler>,
    ) -> Result<SocketId> {
        let id = self.allocate_id();
        self.poll
            .registry()
            .register(socket.source(), id.token(), Interest::READABLE)
            .map_err(|e| ProtocolError::SocketInvalid(format!("register connection: {e}")))?;
        socket.attach(id, Arc::clone(&self.metrics));
        self.connections += 1;
        self.metrics.connection_established();
        info!(
            %id,
            peer_addr = ?socket.peer_addr(),
            local_addr = %socket.local_addr(),
            "Registered connection"
        );
        self.slots.insert(id, Slot::Connection(Connection { socket, handler }));
        Ok(id)
    }

    fn flush_removals(&mut self) {
        let pending = std::mem::take(&mut self.pending_removal);
        for id in pending {
            if let Some(slot) = self.slots.remove(&id) {
                self.destroy(id, slot);
            }
        }
    }

    fn destroy(&mut self, id: SocketId, slot: Slot) {
        match slot {
            Slot::Listener(mut listener) => {
                if let Err(e) = self.poll.registry().deregister(listener.source()) {
                    debug!(%id, error = %e, "Deregister listener failed");
                }
                listener.disconnect();
                info!(%id, "Removed listener");
            }
            Slot::Connection(mut conn) => {
                if let Err(e) = self.poll.registry().deregister(conn.socket.source()) {
                    debug!(%id, error = %e, "Deregister connection failed");
                }
                conn.socket.disconnect();
                conn.handler.on_disconnect(&conn.socket);
                self.connections = self.connections.saturating_sub(1);
                self.metrics.connection_closed();
                info!(%id, peer_addr = ?conn.socket.peer_addr(), "Removed connection");
            }
        }
    }

    fn allocate_id(&mut self) -> SocketId {
        loop {
            let candidate = SocketId::new(self.next_id);
            self.next_id = self.next_id.checked_add(1).unwrap_or(FIRST_SOCKET_ID);
            if !self.slots.contains_key(&candidate) && self.updating != Some(candidate) {
                return candidate;
            }
        }
    }
}
