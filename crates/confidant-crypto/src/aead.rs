//! `XChaCha20-Poly1305` record sealing for established sessions.
//!
//! Records travel over an ordered byte stream, so nonces are never sent:
//! both ends derive them from a per-direction counter and the session salt.
//! A record that fails to open means the stream is corrupt or forged and
//! the session must be dropped.

use crate::CryptoError;
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication tag size (Poly1305)
pub const TAG_SIZE: usize = 16;

/// Nonce size (`XChaCha20` extended nonce)
pub const NONCE_SIZE: usize = 24;

/// Key size
pub const KEY_SIZE: usize = 32;

/// Records sealed under one key before the session must be re-established.
pub const MAX_RECORDS: u64 = u64::MAX >> 1;

/// Extended nonce built from a record counter and a session salt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Build the nonce for record number `counter`.
    #[must_use]
    pub fn from_counter(counter: u64, salt: &[u8; 16]) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&counter.to_le_bytes());
        bytes[8..].copy_from_slice(salt);
        Self(bytes)
    }

    /// Raw nonce bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Symmetric key for one direction of a session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Seal `plaintext`, authenticating `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher rejects the input.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .encrypt(
                XNonce::from_slice(nonce.as_bytes()),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open a sealed record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if authentication fails.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());
        cipher
            .decrypt(
                XNonce::from_slice(nonce.as_bytes()),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Bidirectional record state for one authenticated session.
#[derive(ZeroizeOnDrop)]
pub struct RecordCipher {
    send_key: AeadKey,
    recv_key: AeadKey,
    #[zeroize(skip)]
    salt: [u8; 16],
    #[zeroize(skip)]
    send_counter: u64,
    #[zeroize(skip)]
    recv_counter: u64,
}

impl RecordCipher {
    /// Create record state from directional keys and the shared nonce salt.
    #[must_use]
    pub fn new(send_key: [u8; KEY_SIZE], recv_key: [u8; KEY_SIZE], salt: [u8; 16]) -> Self {
        Self {
            send_key: AeadKey::new(send_key),
            recv_key: AeadKey::new(recv_key),
            salt,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    /// Seal the next outbound record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceOverflow`] once [`MAX_RECORDS`] have been sent.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.send_counter >= MAX_RECORDS {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.send_counter, &self.salt);
        let sealed = self.send_key.encrypt(&nonce, plaintext, &self.send_counter.to_be_bytes())?;
        self.send_counter += 1;
        Ok(sealed)
    }

    /// Open the next inbound record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the record is forged,
    /// reordered or corrupt.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.recv_counter >= MAX_RECORDS {
            return Err(CryptoError::NonceOverflow);
        }
        let nonce = Nonce::from_counter(self.recv_counter, &self.salt);
        let plain = self.recv_key.decrypt(&nonce, ciphertext, &self.recv_counter.to_be_bytes())?;
        self.recv_counter += 1;
        Ok(plain)
    }

    /// Number of records sealed so far
    #[must_use]
    pub fn records_sent(&self) -> u64 {
        self.send_counter
    }

    /// Number of records opened so far
    #[must_use]
    pub fn records_received(&self) -> u64 {
        self.recv_counter
    }
}
