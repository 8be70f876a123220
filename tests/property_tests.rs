//! Property-based tests using proptest
//!
//! These tests validate packet and framing invariants across a wide range of randomly
//! generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use packet_mux::core::codec::{encode_frame, FrameAssembler, FrameHeader, HEADER_LEN, MAX_PAYLOAD_SIZE};
use packet_mux::core::packet::Packet;
use proptest::prelude::*;

// Property: typed values read back in insertion order
proptest! {
    #[test]
    fn prop_typed_roundtrip(a in any::<u8>(), b in any::<i16>(), c in any::<u32>(), d in any::<i64>(), e in any::<f64>(), f in any::<bool>()) {
        let mut packet = Packet::new(1);
        packet.put(a).put(b).put(c).put(d).put(e).put(f);

        prop_assert_eq!(packet.len(), 1 + 2 + 4 + 8 + 8 + 1);
        prop_assert_eq!(packet.get::<u8>().unwrap(), a);
        prop_assert_eq!(packet.get::<i16>().unwrap(), b);
        prop_assert_eq!(packet.get::<u32>().unwrap(), c);
        prop_assert_eq!(packet.get::<i64>().unwrap(), d);
        prop_assert_eq!(packet.get::<f64>().unwrap().to_bits(), e.to_bits());
        prop_assert_eq!(packet.get::<bool>().unwrap(), f);
        prop_assert!(packet.finish().is_ok());
        prop_assert_eq!(packet.remaining(), 0);
    }
}

// Property: capacity always stays strictly ahead of the written length
proptest! {
    #[test]
    fn prop_growth_keeps_contents(initial in 1usize..64, chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..20)) {
        let mut packet = Packet::with_capacity(9, initial);
        let mut expected = Vec::new();
        for chunk in &chunks {
            packet.append(chunk);
            expected.extend_from_slice(chunk);
            prop_assert!(packet.capacity() > packet.len());
        }
        prop_assert_eq!(packet.as_bytes(), expected.as_slice());
    }
}

// Property: a filled placeholder reads back at its reserved position
proptest! {
    #[test]
    fn prop_placeholder_fill(prefix in prop::collection::vec(any::<u8>(), 0..100), suffix in prop::collection::vec(any::<u8>(), 0..100), value in any::<u32>()) {
        let mut packet = Packet::new(3);
        packet.append(&prefix);
        let slot = packet.append_placeholder(4);
        packet.append(&suffix);
        packet.fill_value(slot, value).unwrap();

        let mut head = vec![0u8; prefix.len()];
        prop_assert!(packet.read(&mut head));
        prop_assert_eq!(head, prefix);
        prop_assert_eq!(packet.get::<u32>().unwrap(), value);
        prop_assert_eq!(packet.remaining(), suffix.len());
    }
}

// Property: once a read fails, every later read fails too
proptest! {
    #[test]
    fn prop_invalid_latch(payload in prop::collection::vec(any::<u8>(), 0..8), later in prop::collection::vec(any::<u8>(), 1..16)) {
        let mut packet = Packet::from_bytes(4, &payload);
        let mut buf = vec![0u8; payload.len() + 1];
        prop_assert!(!packet.read(&mut buf));
        prop_assert!(!packet.is_valid());

        // Appending more data does not revive the packet
        packet.append(&later);
        prop_assert!(packet.get::<u8>().is_err());
        prop_assert!(packet.read_cstr(64).is_err());
        packet.read_end();
        prop_assert!(packet.finish().is_err());
    }
}

// Property: reads never run past the written length, whatever the spare capacity
proptest! {
    #[test]
    fn prop_reads_bounded_by_length(payload in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut packet = Packet::with_capacity(5, 1024);
        packet.append(&payload);
        let mut buf = vec![0u8; payload.len()];
        prop_assert!(packet.read(&mut buf));
        prop_assert!(packet.get::<u8>().is_err());
    }
}

fn encode_all(frames: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut stream = Vec::new();
    for (opcode, payload) in frames {
        let frame = encode_frame(&Packet::from_bytes(*opcode, payload), MAX_PAYLOAD_SIZE).unwrap();
        stream.extend_from_slice(&frame);
    }
    stream
}

// Property: reassembly is independent of how the byte stream is split
proptest! {
    #[test]
    fn prop_arbitrary_split_reassembly(
        frames in prop::collection::vec((any::<u16>(), prop::collection::vec(any::<u8>(), 0..600)), 1..8),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let stream = encode_all(&frames);
        let mut points: Vec<usize> = cuts.iter().map(|ix| ix.index(stream.len() + 1)).collect();
        points.push(0);
        points.push(stream.len());
        points.sort_unstable();
        points.dedup();

        let mut assembler = FrameAssembler::default();
        let mut received = Vec::new();
        for window in points.windows(2) {
            received.extend(assembler.feed(&stream[window[0]..window[1]]).unwrap());
        }

        prop_assert_eq!(received.len(), frames.len());
        for (packet, (opcode, payload)) in received.iter().zip(&frames) {
            prop_assert_eq!(packet.opcode(), *opcode);
            prop_assert_eq!(packet.as_bytes(), payload.as_slice());
        }
        prop_assert_eq!(assembler.buffered(), 0);
    }
}

// Property: any declared length above the limit is rejected before its payload arrives
proptest! {
    #[test]
    fn prop_oversized_header_rejected(opcode in any::<u16>(), declared in (MAX_PAYLOAD_SIZE as u16 + 1)..=u16::MAX) {
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        FrameHeader { opcode, payload_len: declared }.encode(&mut header);

        let mut assembler = FrameAssembler::default();
        prop_assert!(assembler.feed(&header).is_err());
        prop_assert_eq!(assembler.buffered(), 0);
    }
}
