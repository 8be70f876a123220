#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_mux::core::codec::{FrameAssembler, MAX_PAYLOAD_SIZE};

fuzz_target!(|data: &[u8]| {
    // First byte picks the chunk size so arbitrary read boundaries get exercised
    let Some((&chunk, stream)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(chunk).max(1);

    let mut assembler = FrameAssembler::default();
    for piece in stream.chunks(chunk) {
        match assembler.feed(piece) {
            Ok(packets) => {
                for packet in packets {
                    assert!(packet.len() <= MAX_PAYLOAD_SIZE);
                }
            }
            Err(_) => assert_eq!(assembler.buffered(), 0),
        }
    }
});
