//! # Connected Socket
//!
//! A non-blocking TCP connection carrying length-prefixed opcode frames.
//!
//! Inside a [`SocketHandler`](super::SocketHandler) the socket is readiness driven: every
//! update performs one read and hands each frame it completes to the connection's
//! [`PacketHandler`]. Outside a handler (typically on the client side) `send_data` and
//! `read_data` give a synchronous request/response style bounded by the I/O timeout.

use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::codec::{encode_frame, FrameAssembler, HEADER_LEN, MAX_PAYLOAD_SIZE};
use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::PacketHandler;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{Deadline, DEFAULT_TIMEOUT};

use super::handler::HandlerContext;
use super::{Socket, SocketId};

/// One TCP connection and its receive-side reassembly state
#[derive(Debug)]
pub struct ConnectSocket {
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    assembler: FrameAssembler,
    connected: bool,
    id: Option<SocketId>,
    io_timeout: Duration,
    last_error: Option<ProtocolError>,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectSocket {
    /// Connect to `"host:port"` within `timeout`
    ///
    /// # Errors
    /// - `BadAddress` when the port is missing or the host does not resolve
    /// - `BadPort` when the port is not a valid non-zero `u16`
    /// - `Timeout` / `ConnectionFailed` when no resolved address accepts the connection
    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| {
            ProtocolError::BadAddress(format!("{}: '{address}'", constants::ERR_MISSING_PORT))
        })?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ProtocolError::BadPort(format!("'{port}' in '{address}'")))?;
        Self::connect_to(host, port, timeout)
    }

    /// Connect to `host` on `port` within `timeout`
    #[instrument(skip(timeout), fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn connect_to(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        if port == 0 {
            return Err(ProtocolError::BadPort("port 0 cannot be connected to".to_string()));
        }
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ProtocolError::BadAddress("empty host".to_string()));
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| ProtocolError::BadAddress(format!("{host}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(ProtocolError::BadAddress(format!("{host}: no addresses resolved")));
        }

        let timeout = timeout.max(Duration::from_millis(1));
        let mut last_err = None;
        for addr in addrs {
            match std::net::TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    let socket = Self::from_stream(TcpStream::from_std(stream), addr)?;
                    info!(peer = %addr, local = %socket.local_addr, "Connected");
                    return Ok(socket);
                }
                Err(e) => {
                    debug!(peer = %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if e.kind() == ErrorKind::TimedOut => {
                warn!(host, port, "Connect timed out");
                Err(ProtocolError::Timeout)
            }
            Some(e) => {
                warn!(host, port, error = %e, "Connect failed");
                Err(ProtocolError::ConnectionFailed(format!("{host}:{port}: {e}")))
            }
            None => Err(ProtocolError::ConnectionFailed(format!("{host}:{port}"))),
        }
    }

    /// Connect to `client.address` within `client.connect_timeout`
    ///
    /// The socket takes the configured I/O timeout and payload limit.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let mut socket = Self::connect(&config.client.address, config.client.connect_timeout)?;
        socket.set_io_timeout(config.client.io_timeout);
        socket.set_max_payload(config.transport.max_payload_size);
        Ok(socket)
    }

    /// Wrap an already-connected non-blocking stream
    pub(crate) fn from_stream(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            local_addr,
            peer_addr,
            assembler: FrameAssembler::new(MAX_PAYLOAD_SIZE),
            connected: true,
            id: None,
            io_timeout: DEFAULT_TIMEOUT,
            last_error: None,
            metrics: None,
        })
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Bound for `send_data` and `read_data`
    pub fn set_io_timeout(&mut self, timeout: Duration) {
        self.io_timeout = timeout;
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn max_payload(&self) -> usize {
        self.assembler.max_payload()
    }

    /// Limit the payload length accepted from and sent to the peer
    ///
    /// Discards any partially received frame.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.assembler = FrameAssembler::new(max_payload);
    }

    /// Error that caused the connection to be dropped, if any
    pub fn last_error(&self) -> Option<&ProtocolError> {
        self.last_error.as_ref()
    }

    pub fn take_last_error(&mut self) -> Option<ProtocolError> {
        self.last_error.take()
    }

    /// Encode `packet` as one frame and write it completely
    ///
    /// Waits for socket capacity up to the I/O timeout. A frame that cannot be written
    /// completely leaves the stream unusable, so the connection is closed.
    pub fn send_data(&mut self, packet: &Packet) -> Result<()> {
        if !self.connected {
            return Err(ProtocolError::SocketInvalid(constants::ERR_NOT_CONNECTED.to_string()));
        }
        let frame = encode_frame(packet, self.assembler.max_payload())?;

        let deadline = Deadline::after(self.io_timeout);
        let mut written = 0;
        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => {
                    self.fail(ProtocolError::ConnectionClosed);
                    return Err(ProtocolError::ConnectionClosed);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Err(timeout) = deadline.wait() {
                        if written > 0 {
                            self.fail(ProtocolError::Timeout);
                        }
                        return Err(timeout);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail_io(e)),
            }
        }

        trace!(opcode = packet.opcode(), bytes = frame.len(), peer = %self.peer_addr, "Sent frame");
        if let Some(metrics) = &self.metrics {
            metrics.packet_sent(frame.len() as u64);
        }
        Ok(())
    }

    /// Wait for the next complete frame, up to the I/O timeout
    ///
    /// Frames already buffered are returned without touching the socket.
    pub fn read_data(&mut self) -> Result<Packet> {
        if !self.connected {
            return Err(ProtocolError::SocketInvalid(constants::ERR_NOT_CONNECTED.to_string()));
        }

        let deadline = Deadline::after(self.io_timeout);
        loop {
            match self.assembler.next_packet() {
                Ok(Some(packet)) => {
                    self.record_received(&packet);
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => {
                    let reason = e.to_string();
                    self.fail(e);
                    return Err(ProtocolError::DataInvalid(reason));
                }
            }

            match self.assembler.fill_from(&mut self.stream) {
                Ok(0) => {
                    self.fail(ProtocolError::ConnectionClosed);
                    return Err(ProtocolError::ConnectionClosed);
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => deadline.wait()?,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail_io(e)),
            }
        }
    }

    /// Perform one non-blocking read and dispatch every frame it completes to `handler`
    ///
    /// Returns whether the socket may still hold unread bytes; the caller has to update it
    /// again without waiting for a new readiness event.
    pub(crate) fn update(
        &mut self,
        handler: &mut dyn PacketHandler,
        ctx: &mut HandlerContext<'_>,
    ) -> bool {
        loop {
            if !self.connected || ctx.is_removal_pending(ctx.socket_id()) {
                return false;
            }
            match self.assembler.fill_from(&mut self.stream) {
                Ok(0) => {
                    info!(peer = %self.peer_addr, id = %ctx.socket_id(), "Connection closed by peer");
                    self.connected = false;
                    return false;
                }
                Ok(_) => {
                    self.dispatch_buffered(handler, ctx);
                    return self.connected && !ctx.is_removal_pending(ctx.socket_id());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = self.fail_io(e);
                    return false;
                }
            }
        }
    }

    fn dispatch_buffered(&mut self, handler: &mut dyn PacketHandler, ctx: &mut HandlerContext<'_>) {
        while self.connected && !ctx.is_removal_pending(ctx.socket_id()) {
            match self.assembler.next_packet() {
                Ok(Some(packet)) => {
                    self.record_received(&packet);
                    let opcode = packet.opcode();
                    if let Err(e) = handler.on_packet(self, packet, ctx) {
                        warn!(opcode, peer = %self.peer_addr, error = %e, "Packet handler failed");
                        if let Some(metrics) = &self.metrics {
                            metrics.protocol_error();
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(peer = %self.peer_addr, error = %e, "Framing error, dropping connection");
                    if let Some(metrics) = &self.metrics {
                        metrics.protocol_error();
                    }
                    self.fail(e);
                }
            }
        }
    }

    fn record_received(&self, packet: &Packet) {
        trace!(opcode = packet.opcode(), len = packet.len(), peer = %self.peer_addr, "Received frame");
        if let Some(metrics) = &self.metrics {
            metrics.packet_received((HEADER_LEN + packet.len()) as u64);
        }
    }

    fn fail(&mut self, err: ProtocolError) {
        self.close_stream();
        self.last_error = Some(err);
    }

    fn fail_io(&mut self, err: io::Error) -> ProtocolError {
        warn!(peer = %self.peer_addr, error = %err, "Connection error");
        if let Some(metrics) = &self.metrics {
            metrics.connection_error();
        }
        let kind = err.kind();
        self.fail(ProtocolError::Io(err));
        ProtocolError::Io(io::Error::from(kind))
    }

    fn close_stream(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn attach(&mut self, id: SocketId, metrics: Arc<Metrics>) {
        self.id = Some(id);
        self.metrics = Some(metrics);
    }

    pub(crate) fn source(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

impl Socket for ConnectSocket {
    fn id(&self) -> Option<SocketId> {
        self.id
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        if self.connected {
            info!(peer = %self.peer_addr, "Disconnecting");
        }
        self.close_stream();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_connect_missing_port() {
        let err = ConnectSocket::connect("localhost", DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, ProtocolError::BadAddress(_)));
    }

    #[test]
    fn test_connect_bad_port() {
        let err = ConnectSocket::connect("localhost:http", DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, ProtocolError::BadPort(_)));

        let err = ConnectSocket::connect("localhost:70000", DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, ProtocolError::BadPort(_)));

        let err = ConnectSocket::connect_to("127.0.0.1", 0, DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, ProtocolError::BadPort(_)));
    }

    #[test]
    fn test_connect_empty_host() {
        let err = ConnectSocket::connect(":9000", DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, ProtocolError::BadAddress(_)));
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = ConnectSocket::connect_to("127.0.0.1", port, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ConnectionFailed(_) | ProtocolError::Timeout
        ));
    }
}
