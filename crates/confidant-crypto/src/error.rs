//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Record counter exhausted for this session
    #[error("record counter exhausted")]
    NonceOverflow,

    /// Key generation or certificate signing failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate could not be parsed
    #[error("certificate parse error: {0}")]
    CertificateParse(String),

    /// Certificate has no usable common name
    #[error("certificate has no common name")]
    MissingCommonName,

    /// Certificate subject or issuer does not name the expected peer
    #[error("certificate names {found:?}, expected peer {expected}")]
    IdentityMismatch {
        /// Peer id the caller expected
        expected: u32,
        /// Common name found in the certificate
        found: String,
    },

    /// Certificate public key is not a valid Ed25519 key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Handshake message malformed or out of order
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Peer presented a certificate that is not in the trust store
    #[error("peer certificate {0} is not trusted")]
    Untrusted(String),

    /// Low-order X25519 point supplied by the peer
    #[error("degenerate key exchange")]
    KeyExchange,

    /// Persisted key material is malformed
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Reading or writing persisted state failed
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Persisted state could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CryptoError {
    /// Returns true if the error means the remote side failed authentication,
    /// as opposed to a malformed exchange or a local fault.
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::Untrusted(_)
                | CryptoError::IdentityMismatch { .. }
                | CryptoError::InvalidSignature
                | CryptoError::InvalidPublicKey
                | CryptoError::CertificateParse(_)
                | CryptoError::MissingCommonName
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_failures() {
        assert!(CryptoError::Untrusted("ab".into()).is_authentication_failure());
        assert!(CryptoError::InvalidSignature.is_authentication_failure());
        assert!(
            CryptoError::IdentityMismatch {
                expected: 7,
                found: "8".into()
            }
            .is_authentication_failure()
        );
        assert!(!CryptoError::DecryptionFailed.is_authentication_failure());
        assert!(!CryptoError::Handshake("short".into()).is_authentication_failure());
    }
}
