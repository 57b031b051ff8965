//! Fuzz target for record sealing
//!
//! Opening arbitrary ciphertext must fail cleanly, and a sealed record must
//! open on the other side.

#![no_main]

use arbitrary::Arbitrary;
use confidant_crypto::RecordCipher;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct RecordInput {
    key_a: [u8; 32],
    key_b: [u8; 32],
    salt: [u8; 16],
    plaintext: Vec<u8>,
    garbage: Vec<u8>,
}

fuzz_target!(|input: RecordInput| {
    let mut alice = RecordCipher::new(input.key_a, input.key_b, input.salt);
    let mut bob = RecordCipher::new(input.key_b, input.key_a, input.salt);

    let _ = bob.open(&input.garbage);

    let mut bob = RecordCipher::new(input.key_b, input.key_a, input.salt);
    let sealed = alice.seal(&input.plaintext).expect("seal");
    let opened = bob.open(&sealed).expect("open");
    assert_eq!(opened, input.plaintext);
});
