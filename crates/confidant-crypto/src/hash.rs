//! BLAKE3 transcript hashing and session key derivation.
//!
//! The handshake binds both `Hello` messages into one transcript digest;
//! signatures cover the digest and the session keys are expanded from the
//! X25519 shared secret keyed by it.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Domain separation prefix for handshake signatures.
const SIGNATURE_CONTEXT: &[u8] = b"confidant handshake signature v1";

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Order-independent transcript of the two `Hello` messages.
///
/// Both sides of a connection must arrive at the same digest without
/// agreeing on who initiated, so the messages are absorbed in byte order.
#[must_use]
pub fn transcript(hello_a: &[u8], hello_b: &[u8]) -> HashOutput {
    let (first, second) = if hello_a <= hello_b {
        (hello_a, hello_b)
    } else {
        (hello_b, hello_a)
    };

    let mut hasher = blake3::Hasher::new();
    hasher.update(&(first.len() as u64).to_be_bytes());
    hasher.update(first);
    hasher.update(&(second.len() as u64).to_be_bytes());
    hasher.update(second);
    *hasher.finalize().as_bytes()
}

/// Message each side signs to prove possession of its certificate key.
#[must_use]
pub fn signature_payload(transcript: &HashOutput) -> Vec<u8> {
    let mut msg = Vec::with_capacity(SIGNATURE_CONTEXT.len() + transcript.len());
    msg.extend_from_slice(SIGNATURE_CONTEXT);
    msg.extend_from_slice(transcript);
    msg
}

/// Directional key material for one session.
///
/// `low` is the key used by the side whose ephemeral public key sorts
/// lower for sending; the other side uses it for receiving.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Send key of the lower-ordered side
    pub low: [u8; 32],
    /// Send key of the higher-ordered side
    pub high: [u8; 32],
    /// Nonce salt shared by both directions
    pub salt: [u8; 16],
}

/// Expand an X25519 shared secret into session keys, keyed by the transcript.
#[must_use]
pub fn derive_session_keys(shared_secret: &[u8; 32], transcript: &HashOutput) -> SessionKeys {
    let mut hasher = blake3::Hasher::new_keyed(transcript);
    hasher.update(b"confidant session keys v1");
    hasher.update(shared_secret);

    let mut okm = [0u8; 80];
    hasher.finalize_xof().fill(&mut okm);

    let mut keys = SessionKeys {
        low: [0u8; 32],
        high: [0u8; 32],
        salt: [0u8; 16],
    };
    keys.low.copy_from_slice(&okm[..32]);
    keys.high.copy_from_slice(&okm[32..64]);
    keys.salt.copy_from_slice(&okm[64..]);
    okm.zeroize();
    keys
}
