//! Fuzz target for the TLV reader
//!
//! Walks arbitrary bytes as nested TLVs; every path must terminate cleanly.

#![no_main]

use confidant_core::tlv::Reader;
use libfuzzer_sys::fuzz_target;

fn walk(mut reader: Reader<'_>, depth: usize) {
    while !reader.is_empty() {
        let Ok((tag, value)) = reader.read_any_tlv() else {
            return;
        };
        if depth < 4 && tag & 1 == 1 {
            walk(Reader::new(value), depth + 1);
        }
        let _ = confidant_core::tlv::decode_string(value);
        let _ = confidant_core::tlv::decode_addr(value);
    }
}

fuzz_target!(|data: &[u8]| {
    walk(Reader::new(data), 0);
});
