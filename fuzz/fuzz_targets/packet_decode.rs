//! Fuzz target for packet decoding
//!
//! Feeds arbitrary bytes through header parsing and the default registry.
//! Decoding must never panic, and anything accepted must re-encode to the
//! same bytes.

#![no_main]

use confidant_core::{Item, PacketHeader, Registry};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = PacketHeader::parse(data);

    let mut registry = Registry::default();
    registry.register_service(0x0001);
    if let Ok(item) = registry.decode(data) {
        if let Item::Service(_) = item {
            let bytes = item.to_bytes().expect("decoded item re-encodes");
            assert_eq!(bytes, data);
        }
    }
});
