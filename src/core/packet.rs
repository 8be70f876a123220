//! # Packet
//!
//! Growable byte buffer with independent read and write cursors.
//!
//! A packet is used on both sides of a connection:
//! - **Send side**: created with an opcode and an initial capacity, filled with typed
//!   values, then handed to [`ConnectSocket::send_data`](crate::transport::ConnectSocket::send_data).
//! - **Receive side**: created from the payload bytes of one reassembled frame and drained
//!   with typed extractions.
//!
//! ## Growth
//! Capacity only grows, doubling until it strictly exceeds `write cursor + requested size`.
//! Previously written bytes are never lost.
//!
//! ## Failed reads
//! An extraction that would run past the written length latches the packet invalid.
//! Every later extraction fails without touching the buffer, so a read sequence can be
//! checked once at the end with [`Packet::finish`] or [`Packet::is_valid`].
//!
//! ## Placeholders
//! [`Packet::append_placeholder`] reserves bytes whose value is only known after later
//! appends (a nested length, a count). The returned [`Placeholder`] is an index range
//! bound to this packet, so it stays correct across buffer growth, and it can be filled
//! exactly once.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{constants, ProtocolError, Result};

/// Default capacity for send-side packets
pub const DEFAULT_PACKET_CAPACITY: usize = 1024;

/// Hard cap on a NUL-terminated string written with [`Packet::put_cstr`], terminator included
pub const MAX_CSTR_LEN: usize = 4096;

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// A fixed-size value with a big-endian wire representation
pub trait WireValue: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Write the encoded value into `out`, which is exactly `SIZE` bytes long
    fn write_to(&self, out: &mut [u8]);

    /// Decode a value from `input`, which is exactly `SIZE` bytes long
    fn read_from(input: &[u8]) -> Self;
}

macro_rules! impl_wire_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WireValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn write_to(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_be_bytes());
                }

                #[inline]
                fn read_from(input: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(input);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

impl_wire_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl WireValue for bool {
    const SIZE: usize = 1;

    fn write_to(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn read_from(input: &[u8]) -> Self {
        input[0] != 0
    }
}

/// Reserved byte range inside a [`Packet`], fillable exactly once
///
/// Not `Clone`: filling consumes the token.
#[derive(Debug)]
#[must_use = "a placeholder that is never filled leaves zero bytes in the packet"]
pub struct Placeholder {
    packet_id: u64,
    offset: usize,
    len: usize,
}

impl Placeholder {
    /// Number of reserved bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the reservation is zero bytes long
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Opcode-tagged packet buffer
#[derive(Debug)]
pub struct Packet {
    id: u64,
    opcode: u16,
    /// Backing storage; `data.len()` is the capacity
    data: Vec<u8>,
    wpos: usize,
    rpos: usize,
    valid: bool,
}

impl Packet {
    /// Create a send-side packet with the default capacity
    pub fn new(opcode: u16) -> Self {
        Self::with_capacity(opcode, DEFAULT_PACKET_CAPACITY)
    }

    /// Create a send-side packet with room for `capacity` bytes (at least one)
    pub fn with_capacity(opcode: u16, capacity: usize) -> Self {
        Self {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            opcode,
            data: vec![0; capacity.max(1)],
            wpos: 0,
            rpos: 0,
            valid: true,
        }
    }

    /// Create a receive-side packet holding a copy of `bytes`
    pub fn from_bytes(opcode: u16, bytes: &[u8]) -> Self {
        let mut packet = Self::with_capacity(opcode, bytes.len());
        packet.data[..bytes.len()].copy_from_slice(bytes);
        packet.wpos = bytes.len();
        packet
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Number of bytes written
    pub fn len(&self) -> usize {
        self.wpos
    }

    pub fn is_empty(&self) -> bool {
        self.wpos == 0
    }

    /// Current size of the backing buffer
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The written bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.wpos]
    }

    /// Unread bytes left before the write cursor (zero once invalid)
    pub fn remaining(&self) -> usize {
        if self.valid {
            self.wpos - self.rpos
        } else {
            0
        }
    }

    /// Current read cursor
    pub fn read_position(&self) -> usize {
        self.rpos
    }

    /// False once any extraction has failed
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Check a whole extraction sequence at once
    pub fn finish(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(ProtocolError::data_invalid(constants::ERR_PACKET_INVALID))
        }
    }

    fn ensure_room(&mut self, size: usize) {
        let needed = self.wpos + size;
        let mut capacity = self.data.len();
        while needed >= capacity {
            capacity *= 2;
        }
        if capacity != self.data.len() {
            self.data.resize(capacity, 0);
        }
    }

    /// Append raw bytes, growing the buffer as needed
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.ensure_room(bytes.len());
        self.data[self.wpos..self.wpos + bytes.len()].copy_from_slice(bytes);
        self.wpos += bytes.len();
        self
    }

    /// Append a fixed-size value
    pub fn put<T: WireValue>(&mut self, value: T) -> &mut Self {
        self.ensure_room(T::SIZE);
        value.write_to(&mut self.data[self.wpos..self.wpos + T::SIZE]);
        self.wpos += T::SIZE;
        self
    }

    /// Append raw bytes without any terminator
    pub fn put_bytes(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.append(bytes.as_ref())
    }

    /// Append a string's bytes without any terminator
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.append(s.as_bytes())
    }

    /// Append a NUL-terminated string
    ///
    /// Input is cut at its first NUL and at `MAX_CSTR_LEN - 1` bytes; a terminator is
    /// always written.
    pub fn put_cstr(&mut self, s: impl AsRef<[u8]>) -> &mut Self {
        let bytes = s.as_ref();
        let end = bytes
            .iter()
            .take(MAX_CSTR_LEN - 1)
            .position(|&b| b == 0)
            .unwrap_or_else(|| bytes.len().min(MAX_CSTR_LEN - 1));
        self.ensure_room(end + 1);
        self.append(&bytes[..end]);
        self.append(&[0])
    }

    /// Reserve `size` bytes to be written later through the returned token
    pub fn append_placeholder(&mut self, size: usize) -> Placeholder {
        self.ensure_room(size);
        let offset = self.wpos;
        self.wpos += size;
        Placeholder {
            packet_id: self.id,
            offset,
            len: size,
        }
    }

    /// Overwrite the bytes reserved by `placeholder`
    pub fn fill(&mut self, placeholder: Placeholder, bytes: &[u8]) -> Result<()> {
        if placeholder.packet_id != self.id {
            return Err(ProtocolError::data_invalid(constants::ERR_PLACEHOLDER_OWNER));
        }
        if placeholder.len != bytes.len() {
            return Err(ProtocolError::data_invalid(format!(
                "{}: reserved {} bytes, got {}",
                constants::ERR_PLACEHOLDER_SIZE,
                placeholder.len,
                bytes.len()
            )));
        }
        self.data[placeholder.offset..placeholder.offset + placeholder.len].copy_from_slice(bytes);
        Ok(())
    }

    /// Overwrite the bytes reserved by `placeholder` with an encoded value
    pub fn fill_value<T: WireValue>(&mut self, placeholder: Placeholder, value: T) -> Result<()> {
        let mut raw = vec![0u8; T::SIZE];
        value.write_to(&mut raw);
        self.fill(placeholder, &raw)
    }

    fn invalidate(&mut self) -> ProtocolError {
        let err = if self.valid {
            constants::ERR_READ_PAST_END
        } else {
            constants::ERR_PACKET_INVALID
        };
        self.valid = false;
        self.rpos = self.wpos;
        ProtocolError::data_invalid(err)
    }

    fn take(&mut self, size: usize) -> Option<&[u8]> {
        if !self.valid || size > self.wpos - self.rpos {
            return None;
        }
        let start = self.rpos;
        self.rpos += size;
        Some(&self.data[start..start + size])
    }

    /// Extract a fixed-size value, latching the packet invalid on failure
    pub fn get<T: WireValue>(&mut self) -> Result<T> {
        match self.take(T::SIZE) {
            Some(raw) => Ok(T::read_from(raw)),
            None => Err(self.invalidate()),
        }
    }

    /// Chainable extraction; check [`Packet::finish`] once the sequence is done
    ///
    /// `out` is left untouched when the read fails.
    pub fn extract<T: WireValue>(&mut self, out: &mut T) -> &mut Self {
        if let Ok(value) = self.get::<T>() {
            *out = value;
        }
        self
    }

    /// Fill `buf` completely from the packet
    pub fn read(&mut self, buf: &mut [u8]) -> bool {
        match self.take(buf.len()) {
            Some(raw) => {
                buf.copy_from_slice(raw);
                true
            }
            None => {
                self.invalidate();
                false
            }
        }
    }

    /// Read a NUL-terminated string of at most `max_size` bytes, terminator included
    ///
    /// Returns the bytes before the terminator.
    pub fn read_cstr(&mut self, max_size: usize) -> Result<Vec<u8>> {
        if !self.valid {
            return Err(self.invalidate());
        }
        let window_end = self.wpos.min(self.rpos.saturating_add(max_size));
        let window = &self.data[self.rpos..window_end];
        match window.iter().position(|&b| b == 0) {
            Some(nul) => {
                let bytes = window[..nul].to_vec();
                self.rpos += nul + 1;
                Ok(bytes)
            }
            None => {
                self.invalidate();
                Err(ProtocolError::data_invalid(constants::ERR_MISSING_TERMINATOR))
            }
        }
    }

    /// Read a NUL-terminated UTF-8 string of at most `max_size` bytes, terminator included
    pub fn read_string(&mut self, max_size: usize) -> Result<String> {
        let bytes = self.read_cstr(max_size)?;
        String::from_utf8(bytes).map_err(|_| {
            self.invalidate();
            ProtocolError::data_invalid(constants::ERR_INVALID_UTF8)
        })
    }

    /// Mark the packet fully consumed, discarding any trailing bytes
    ///
    /// An earlier failed read stays latched.
    pub fn read_end(&mut self) {
        self.rpos = self.wpos;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_typed_roundtrip() {
        let mut packet = Packet::new(1);
        packet
            .put(7u8)
            .put(-2i16)
            .put(0xDEAD_BEEFu32)
            .put(u64::MAX)
            .put(1.5f32)
            .put(true);

        assert_eq!(packet.get::<u8>().unwrap(), 7);
        assert_eq!(packet.get::<i16>().unwrap(), -2);
        assert_eq!(packet.get::<u32>().unwrap(), 0xDEAD_BEEF);
        assert_eq!(packet.get::<u64>().unwrap(), u64::MAX);
        assert_eq!(packet.get::<f32>().unwrap(), 1.5);
        assert!(packet.get::<bool>().unwrap());
        assert!(packet.is_valid());
        assert_eq!(packet.remaining(), 0);
    }

    #[test]
    fn test_values_are_big_endian() {
        let mut packet = Packet::new(0);
        packet.put(0x0102u16);
        assert_eq!(packet.as_bytes(), &[0x01, 0x02]);
    }

    #[test]
    fn test_capacity_doubles() {
        let mut packet = Packet::with_capacity(0, 4);
        packet.append(&[1, 2, 3]);
        assert_eq!(packet.capacity(), 4);

        // 3 + 1 is not strictly below 4, so the buffer doubles
        packet.append(&[4]);
        assert_eq!(packet.capacity(), 8);

        packet.append(&[0; 20]);
        assert_eq!(packet.capacity(), 32);
        assert_eq!(&packet.as_bytes()[..4], &[1, 2, 3, 4]);
        assert_eq!(packet.len(), 24);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut packet = Packet::with_capacity(0, 0);
        assert_eq!(packet.capacity(), 1);
        packet.put(9u32);
        assert_eq!(packet.get::<u32>().unwrap(), 9);
    }

    #[test]
    fn test_invalid_latch() {
        let mut packet = Packet::from_bytes(3, &[0, 1, 2]);
        assert_eq!(packet.get::<u16>().unwrap(), 1);
        assert!(packet.get::<u16>().is_err());
        assert!(!packet.is_valid());

        // The trailing byte would satisfy a u8 read, but the latch holds
        assert!(packet.get::<u8>().is_err());
        assert!(packet.finish().is_err());
    }

    #[test]
    fn test_extract_chain_checked_once() {
        let mut packet = Packet::new(0);
        packet.put(5u32).put(6u8);

        let (mut a, mut b, mut c) = (0u32, 0u8, 0u16);
        packet.extract(&mut a).extract(&mut b).extract(&mut c);
        assert_eq!((a, b, c), (5, 6, 0));
        assert!(packet.finish().is_err());
    }

    #[test]
    fn test_reads_bounded_by_written_length() {
        // Spare capacity must never be readable
        let mut packet = Packet::with_capacity(0, 64);
        packet.put(1u8);
        assert_eq!(packet.get::<u8>().unwrap(), 1);
        assert!(packet.get::<u8>().is_err());
    }

    #[test]
    fn test_placeholder_backpatch() {
        let mut packet = Packet::with_capacity(0, 2);
        let slot = packet.append_placeholder(2);
        packet.put_str("hello world");
        let body_len = (packet.len() - 2) as u16;
        packet.fill_value(slot, body_len).unwrap();

        let mut expected = Packet::new(0);
        expected.put(11u16).put_str("hello world");
        assert_eq!(packet.as_bytes(), expected.as_bytes());
    }

    #[test]
    fn test_placeholder_rejects_wrong_size_and_owner() {
        let mut a = Packet::new(0);
        let mut b = Packet::new(0);
        let slot = a.append_placeholder(4);
        assert!(a.fill(slot, &[1, 2]).is_err());

        let slot = a.append_placeholder(1);
        assert!(b.fill(slot, &[1]).is_err());
    }

    #[test]
    fn test_cstr_roundtrip_and_truncation() {
        let mut packet = Packet::new(0);
        packet.put_cstr("alice").put_cstr(b"bob\0trailing");
        assert_eq!(packet.len(), 6 + 4);
        assert_eq!(packet.read_string(32).unwrap(), "alice");
        assert_eq!(packet.read_cstr(32).unwrap(), b"bob");

        let long = vec![b'x'; MAX_CSTR_LEN * 2];
        let mut packet = Packet::new(0);
        packet.put_cstr(&long);
        assert_eq!(packet.len(), MAX_CSTR_LEN);
        assert_eq!(packet.as_bytes()[MAX_CSTR_LEN - 1], 0);
    }

    #[test]
    fn test_read_string_bounds() {
        let mut packet = Packet::new(0);
        packet.put_cstr("abcdef");

        // Terminator sits at index 6, outside a 6-byte window
        assert!(packet.read_string(6).is_err());
        assert!(!packet.is_valid());

        let mut packet = Packet::from_bytes(0, b"abc");
        assert!(packet.read_cstr(100).is_err());
    }

    #[test]
    fn test_read_end_discards_trailing_bytes() {
        let mut packet = Packet::from_bytes(0, &[1, 2, 3, 4]);
        assert_eq!(packet.get::<u8>().unwrap(), 1);
        packet.read_end();
        assert!(packet.is_valid());
        assert_eq!(packet.remaining(), 0);
    }

    #[test]
    fn test_read_fills_buffer() {
        let mut packet = Packet::from_bytes(0, b"PING");
        let mut buf = [0u8; 4];
        assert!(packet.read(&mut buf));
        assert_eq!(&buf, b"PING");
        assert!(!packet.read(&mut buf));
    }
}
