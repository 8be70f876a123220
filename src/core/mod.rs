//! # Core Protocol Components
//!
//! Packet buffers and wire framing.
//!
//! ## Components
//! - **Packet**: growable buffer with typed insertion/extraction and placeholders
//! - **Codec**: frame header and the per-connection reassembly state machine
//!
//! ## Wire Format
//! ```text
//! [Opcode(2)] [PayloadLength(2)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 4096 bytes including the header
//! - Length validation before buffering

pub mod codec;
pub mod packet;
