//! # Frame Codec
//!
//! Maps between a TCP byte stream and discrete opcode-tagged [`Packet`]s.
//!
//! ## Wire Format
//! ```text
//! [Opcode(2)] [PayloadLength(2)] [Payload(N)]
//! ```
//! Both header fields are big-endian.
//!
//! ## Reassembly
//! [`FrameAssembler`] owns a fixed receive buffer and an explicit state machine
//! (`AwaitingHeader` / `AwaitingPayload`). Bytes may arrive split at any boundary; a
//! single read may also carry several frames, all of which are surfaced.
//!
//! ## Security
//! - Declared payload length is checked against the configured maximum before a single
//!   payload byte is buffered
//! - The receive buffer never grows past [`MAX_PACKET_SIZE`]

use std::io::{self, Read};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace, warn};

use crate::core::packet::Packet;
use crate::error::{constants, ProtocolError, Result};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 4;

/// Receive buffer capacity; one whole frame (header + payload) must fit
pub const MAX_PACKET_SIZE: usize = 4096;

/// Largest payload a frame can carry
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_LEN;

/// Fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u16,
    pub payload_len: u16,
}

impl FrameHeader {
    /// Append the encoded header to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.opcode);
        dst.put_u16(self.payload_len);
    }

    /// Decode a header from the first `HEADER_LEN` bytes of `src`
    pub fn decode(mut src: &[u8]) -> Option<Self> {
        if src.len() < HEADER_LEN {
            return None;
        }
        let opcode = src.get_u16();
        let payload_len = src.get_u16();
        Some(Self {
            opcode,
            payload_len,
        })
    }
}

/// Clamp a configured payload limit to what the receive buffer can hold
pub fn effective_max_payload(configured: usize) -> usize {
    configured.min(MAX_PAYLOAD_SIZE)
}

/// Serialize a packet into one complete frame
pub fn encode_frame(packet: &Packet, max_payload: usize) -> Result<BytesMut> {
    let max_payload = effective_max_payload(max_payload);
    let payload = packet.as_bytes();
    if payload.len() > max_payload {
        return Err(ProtocolError::data_invalid(format!(
            "payload of {} bytes exceeds maximum {max_payload}",
            payload.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    FrameHeader {
        opcode: packet.opcode(),
        payload_len: payload.len() as u16,
    }
    .encode(&mut frame);
    frame.put_slice(payload);
    Ok(frame)
}

/// Pending work of the reassembly state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    AwaitingHeader,
    AwaitingPayload { opcode: u16, payload_len: usize },
}

/// Per-connection reassembly of frames from arbitrary read boundaries
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Box<[u8]>,
    /// Start of unconsumed bytes
    head: usize,
    /// End of received bytes
    tail: usize,
    state: ReadState,
    max_payload: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl FrameAssembler {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: vec![0u8; MAX_PACKET_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
            state: ReadState::AwaitingHeader,
            max_payload: effective_max_payload(max_payload),
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Bytes received but not yet surfaced as packets
    pub fn buffered(&self) -> usize {
        self.tail - self.head
    }

    /// Header bytes still missing (zero while awaiting payload)
    pub fn remaining_header(&self) -> usize {
        match self.state {
            ReadState::AwaitingHeader => HEADER_LEN.saturating_sub(self.buffered()),
            ReadState::AwaitingPayload { .. } => 0,
        }
    }

    /// Payload bytes still missing (zero while awaiting header)
    pub fn remaining_payload(&self) -> usize {
        match self.state {
            ReadState::AwaitingHeader => 0,
            ReadState::AwaitingPayload { payload_len, .. } => {
                payload_len.saturating_sub(self.buffered())
            }
        }
    }

    /// Drop buffered bytes and return to `AwaitingHeader`
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.state = ReadState::AwaitingHeader;
    }

    /// Free space at the write offset, compacting consumed bytes first
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.head > 0 {
            self.buffer.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
        &mut self.buffer[self.tail..]
    }

    /// Record `n` bytes written into [`FrameAssembler::spare_mut`]
    pub fn commit(&mut self, n: usize) {
        self.tail = (self.tail + n).min(self.buffer.len());
    }

    /// Perform one read from `reader` into the receive buffer
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let spare = self.spare_mut();
        if spare.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                constants::ERR_RECEIVE_BUFFER_FULL,
            ));
        }
        let n = reader.read(spare)?;
        self.commit(n);
        trace!(bytes = n, buffered = self.buffered(), "Filled receive buffer");
        Ok(n)
    }

    /// Advance the state machine over buffered bytes, surfacing at most one packet
    ///
    /// Framing errors reset the assembler; the stream cannot be resynchronized.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.state {
                ReadState::AwaitingHeader => {
                    let Some(header) = FrameHeader::decode(&self.buffer[self.head..self.tail])
                    else {
                        return Ok(None);
                    };
                    let payload_len = usize::from(header.payload_len);
                    if payload_len > self.max_payload {
                        warn!(
                            opcode = header.opcode,
                            payload_len,
                            max_payload = self.max_payload,
                            "Rejecting oversized frame"
                        );
                        self.reset();
                        return Err(ProtocolError::data_invalid(format!(
                            "declared payload length {payload_len} exceeds maximum {}",
                            self.max_payload
                        )));
                    }
                    self.head += HEADER_LEN;
                    if payload_len == 0 {
                        debug!(opcode = header.opcode, "Reassembled empty frame");
                        return Ok(Some(Packet::from_bytes(header.opcode, &[])));
                    }
                    self.state = ReadState::AwaitingPayload {
                        opcode: header.opcode,
                        payload_len,
                    };
                }
                ReadState::AwaitingPayload {
                    opcode,
                    payload_len,
                } => {
                    if self.buffered() < payload_len {
                        return Ok(None);
                    }
                    let start = self.head;
                    let packet =
                        Packet::from_bytes(opcode, &self.buffer[start..start + payload_len]);
                    self.head += payload_len;
                    self.state = ReadState::AwaitingHeader;
                    if self.head == self.tail {
                        self.head = 0;
                        self.tail = 0;
                    }
                    debug!(opcode, payload_len, "Reassembled frame");
                    return Ok(Some(packet));
                }
            }
        }
    }

    /// Feed in-memory bytes and collect every packet they complete
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        while !data.is_empty() {
            let spare = self.spare_mut();
            if spare.is_empty() {
                self.reset();
                return Err(ProtocolError::data_invalid(constants::ERR_RECEIVE_BUFFER_FULL));
            }
            let n = spare.len().min(data.len());
            spare[..n].copy_from_slice(&data[..n]);
            self.commit(n);
            data = &data[n..];

            while let Some(packet) = self.next_packet()? {
                packets.push(packet);
            }
        }
        Ok(packets)
    }
}
