//! # Confidant Crypto
//!
//! Identity, trust and session cryptography for Confidant.
//!
//! This crate provides:
//! - Local identity generation (Ed25519 key + self-signed X.509 certificate)
//! - The trust store: certificate fingerprint pinning for a closed friend list
//! - The mutual-authentication handshake run over every transport
//! - `XChaCha20-Poly1305` record sealing for established sessions
//!
//! ## Trust Model
//!
//! There is no certificate authority. Every peer signs its own certificate
//! with its numeric id as both subject and issuer common name, and a peer is
//! trusted exactly when the SHA-1 fingerprint of the certificate it presents
//! is present in the local trust store.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Identity signatures | Ed25519 |
//! | Certificate fingerprint | SHA-1 (20 bytes) |
//! | Key exchange | X25519 (ephemeral) |
//! | Transcript hash / KDF | BLAKE3 |
//! | Record sealing | XChaCha20-Poly1305 |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod certificate;
pub mod error;
pub mod handshake;
pub mod hash;
pub mod identity;
pub mod trust;
pub mod x25519;

pub use aead::RecordCipher;
pub use certificate::{CertificateInfo, Fingerprint};
pub use error::CryptoError;
pub use handshake::{Handshake, HandshakeOutput, PeerVerifier};
pub use identity::{LocalIdentity, PeerId, generate_own_identity};
pub use trust::{TrustStore, TrustUpdate, TrustedPeer};

/// Certificate fingerprint size (SHA-1 digest)
pub const FINGERPRINT_SIZE: usize = 20;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// Lifetime of a freshly generated identity certificate, in days
pub const CERTIFICATE_VALIDITY_DAYS: i64 = 365;
