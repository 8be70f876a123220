#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_mux::Packet;

fuzz_target!(|data: &[u8]| {
    // Drive a mixed extraction sequence over untrusted bytes - test for panics and over-reads
    let mut packet = Packet::from_bytes(0, data);
    let _ = packet.get::<u8>();
    let _ = packet.get::<u32>();
    let _ = packet.read_string(64);
    let _ = packet.read_cstr(4096);
    let mut buf = [0u8; 16];
    let _ = packet.read(&mut buf);
    let _ = packet.get::<f64>();
    packet.read_end();
    assert!(packet.remaining() == 0);
});
