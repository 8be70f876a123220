//! Listening socket.
//!
//! Accepts inbound TCP connections and asks its [`ConnectionFactory`] for the handler of
//! each new peer.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};

use mio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::{ConnectionFactory, PacketHandler};

use super::socket::ConnectSocket;
use super::{Socket, SocketId};

/// A bound, non-blocking TCP listener
pub struct ListenSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: Box<dyn ConnectionFactory>,
    open: bool,
    id: Option<SocketId>,
}

impl std::fmt::Debug for ListenSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenSocket")
            .field("local_addr", &self.local_addr)
            .field("open", &self.open)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ListenSocket {
    /// Listen on all IPv4 interfaces at `port`
    pub fn listen<F>(port: u16, factory: F) -> Result<Self>
    where
        F: ConnectionFactory + 'static,
    {
        if port == 0 {
            return Err(ProtocolError::BadPort("port 0 cannot be listened on".to_string()));
        }
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), factory)
    }

    /// Listen on `addr`; port 0 picks an ephemeral port
    pub fn bind<F>(addr: SocketAddr, factory: F) -> Result<Self>
    where
        F: ConnectionFactory + 'static,
    {
        let listener = TcpListener::bind(addr).map_err(|e| match e.kind() {
            ErrorKind::AddrInUse | ErrorKind::PermissionDenied | ErrorKind::AddrNotAvailable => {
                ProtocolError::BadPort(format!("{addr}: {e}"))
            }
            _ => ProtocolError::SocketInvalid(format!("{addr}: {e}")),
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Listening");

        Ok(Self {
            listener,
            local_addr,
            factory: Box::new(factory),
            open: true,
            id: None,
        })
    }

    /// Accept one pending connection; `None` once the backlog is drained
    ///
    /// Transient accept failures are skipped. Any other failure closes the listener.
    pub(crate) fn accept(&mut self) -> Option<(TcpStream, SocketAddr)> {
        while self.open {
            match self.listener.accept() {
                Ok(accepted) => return Some(accepted),
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => return None,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(error = %e, local_addr = %self.local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(error = %e, local_addr = %self.local_addr, "Error accepting connection");
                        self.open = false;
                    }
                },
            }
        }
        None
    }

    /// Ask the factory for a handler; `None` refuses the connection
    pub(crate) fn on_connect(&mut self, socket: &ConnectSocket) -> Option<Box<dyn PacketHandler>> {
        self.factory.on_connect(socket)
    }

    pub(crate) fn set_id(&mut self, id: SocketId) {
        self.id = Some(id);
    }

    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.listener
    }
}

impl Socket for ListenSocket {
    fn id(&self) -> Option<SocketId> {
        self.id
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_connected(&self) -> bool {
        self.open
    }

    fn disconnect(&mut self) {
        if self.open {
            info!(local_addr = %self.local_addr, "Listener closed");
        }
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn refuse_all(_: &ConnectSocket) -> Option<Box<dyn PacketHandler>> {
        None
    }

    #[test]
    fn test_bind_ephemeral() {
        let listener = ListenSocket::bind("127.0.0.1:0".parse().unwrap(), refuse_all).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert!(listener.is_connected());
        assert!(listener.peer_addr().is_none());
    }

    #[test]
    fn test_listen_port_zero() {
        let err = ListenSocket::listen(0, refuse_all).unwrap_err();
        assert!(matches!(err, ProtocolError::BadPort(_)));
    }

    #[test]
    fn test_bind_in_use() {
        let first = ListenSocket::bind("127.0.0.1:0".parse().unwrap(), refuse_all).unwrap();
        let err = ListenSocket::bind(first.local_addr(), refuse_all).unwrap_err();
        assert!(matches!(err, ProtocolError::BadPort(_)));
    }

    #[test]
    fn test_accept_empty_backlog() {
        let mut listener = ListenSocket::bind("127.0.0.1:0".parse().unwrap(), refuse_all).unwrap();
        assert!(listener.accept().is_none());
        assert!(listener.is_connected());
    }
}
