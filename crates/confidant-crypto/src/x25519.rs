//! Ephemeral X25519 key agreement for the session handshake.
//!
//! A fresh keypair is drawn for every handshake and dropped (zeroized)
//! once the session keys are derived.

use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Ephemeral X25519 keypair.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    secret: x25519_dalek::StaticSecret,
    #[zeroize(skip)]
    public: [u8; 32],
}

impl EphemeralKeyPair {
    /// Generate a new random keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rng);
        let public = *x25519_dalek::PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Public half, sent in the `Hello` message.
    #[must_use]
    pub fn public_bytes(&self) -> &[u8; 32] {
        &self.public
    }

    /// Diffie-Hellman with the peer's public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyExchange`] if the peer sent a low-order point.
    pub fn agree(&self, peer_public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let peer = x25519_dalek::PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchange);
        }
        Ok(*shared.as_bytes())
    }
}
