//! # Error Types
//!
//! Error handling for the packet protocol and the connection multiplexer.
//!
//! ## Error Categories
//! - **Lifecycle Errors**: `connect`, `listen` and `initialize` failures returned to the caller
//!   (`BadAddress`, `BadPort`, `ConnectionFailed`, `InitFailed`, ...). No automatic retries.
//! - **Framing Errors**: malformed or oversized frames (`DataInvalid`). A corrupted stream
//!   cannot be resynchronized, so the offending connection is dropped.
//! - **Extraction Errors**: failed packet reads (`DataInvalid`), latched on the packet and
//!   checked once at the end of a read sequence.
//!
//! ## Example Usage
//! ```rust
//! use packet_mux::error::{ProtocolError, Result};
//! use packet_mux::Packet;
//!
//! fn read_login(packet: &mut Packet) -> Result<(u32, String)> {
//!     let id = packet.get::<u32>()?;
//!     let name = packet.read_string(64)?;
//!     Ok((id, name))
//! }
//!
//! let mut packet = Packet::new(7);
//! packet.put(42u32);
//! assert!(matches!(read_login(&mut packet), Err(ProtocolError::DataInvalid(_))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Packet extraction errors
    pub const ERR_READ_PAST_END: &str = "Read past end of packet";
    pub const ERR_PACKET_INVALID: &str = "Packet already marked invalid";
    pub const ERR_MISSING_TERMINATOR: &str = "String terminator not found within bounds";
    pub const ERR_INVALID_UTF8: &str = "String is not valid UTF-8";

    /// Placeholder errors
    pub const ERR_PLACEHOLDER_OWNER: &str = "Placeholder belongs to a different packet";
    pub const ERR_PLACEHOLDER_SIZE: &str = "Placeholder size mismatch";

    /// Framing errors
    pub const ERR_RECEIVE_BUFFER_FULL: &str = "Receive buffer full without a complete frame";

    /// Connection errors
    pub const ERR_NOT_CONNECTED: &str = "Socket is not connected";
    pub const ERR_MISSING_PORT: &str = "Address is missing a port";
}

/// Primary error type for all protocol and transport operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Socket handler not initialized")]
    NotInitialized,

    #[error("Operation timed out")]
    Timeout,

    #[error("Bad address: {0}")]
    BadAddress(String),

    #[error("Bad port: {0}")]
    BadPort(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Socket invalid: {0}")]
    SocketInvalid(String),

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("Readiness poll failed: {0}")]
    PollFailed(String),

    #[error("Invalid data: {0}")]
    DataInvalid(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected message opcode: {0}")]
    UnexpectedMessage(u16),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Identity service error: {0}")]
    Identity(String),

    #[error("Unknown error: {0}")]
    UnknownError(String),
}

impl ProtocolError {
    pub(crate) fn data_invalid(msg: impl Into<String>) -> Self {
        ProtocolError::DataInvalid(msg.into())
    }

    /// Whether this error means the peer is gone and the connection should be dropped
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed | ProtocolError::SocketInvalid(_) => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(ProtocolError::ConnectionClosed.is_disconnect());
        assert!(ProtocolError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(!ProtocolError::Timeout.is_disconnect());
        assert!(!ProtocolError::data_invalid("x").is_disconnect());
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnexpectedMessage(9);
        assert_eq!(err.to_string(), "Unexpected message opcode: 9");
    }
}
