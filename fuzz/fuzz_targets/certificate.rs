//! Fuzz target for certificate parsing
//!
//! Peer certificates arrive from the network before any authentication, so
//! the parser sees attacker-controlled DER.

#![no_main]

use confidant_crypto::{CertificateInfo, TrustStore};
use confidant_crypto::handshake::PeerVerifier;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(info) = CertificateInfo::parse(data) {
        let _ = info.claimed_id();
        let _ = TrustStore::new().verify_peer(&info);
    }
});
