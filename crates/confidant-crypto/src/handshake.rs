//! Mutual-authentication handshake.
//!
//! Symmetric two-message exchange, run identically by both ends so that a
//! simultaneous open (UDP hole punching, crossed TCP connects) needs no
//! initiator/responder election:
//!
//! ```text
//! Hello = "CFD1" || ephemeral X25519 public (32) || cert_len (u16 BE) || cert DER
//! Auth  = Ed25519 signature (64) over context || transcript(Hello_a, Hello_b)
//! ```
//!
//! After both `Hello`s each side verifies the peer certificate against its
//! [`PeerVerifier`] and sends `Auth`. Receiving a valid `Auth` completes the
//! handshake and yields a [`RecordCipher`] keyed from the ephemeral exchange.
//!
//! This type performs no I/O; the caller frames and moves the messages.

use crate::aead::RecordCipher;
use crate::certificate::{CertificateInfo, Fingerprint};
use crate::hash::{self, HashOutput, SessionKeys};
use crate::identity::{LocalIdentity, PeerId};
use crate::x25519::EphemeralKeyPair;
use crate::{CryptoError, ED25519_SIGNATURE_SIZE, X25519_PUBLIC_KEY_SIZE};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand_core::OsRng;
use tracing::{debug, trace};

const HELLO_MAGIC: &[u8; 4] = b"CFD1";
const HELLO_FIXED_LEN: usize = HELLO_MAGIC.len() + X25519_PUBLIC_KEY_SIZE + 2;

/// Decides whether a presented certificate belongs to a peer we accept.
pub trait PeerVerifier: Send + Sync {
    /// Return the id of the trusted peer owning `info`, or an
    /// authentication error.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Untrusted`] or [`CryptoError::IdentityMismatch`]
    /// when the certificate is not acceptable.
    fn verify_peer(&self, info: &CertificateInfo) -> Result<PeerId, CryptoError>;
}

/// Product of a completed handshake.
pub struct HandshakeOutput {
    /// Authenticated peer
    pub peer: PeerId,
    /// Fingerprint of the certificate the peer presented
    pub fingerprint: Fingerprint,
    /// Record state for the session
    pub cipher: RecordCipher,
}

impl std::fmt::Debug for HandshakeOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOutput")
            .field("peer", &self.peer)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

enum State {
    AwaitHello,
    AwaitAuth {
        peer: PeerId,
        fingerprint: Fingerprint,
        peer_key: [u8; 32],
        transcript: HashOutput,
        keys: SessionKeys,
        send_low: bool,
    },
    Finished,
}

/// One side of the handshake.
pub struct Handshake {
    ephemeral: EphemeralKeyPair,
    local_hello: Vec<u8>,
    expected: Option<PeerId>,
    state: State,
}

impl Handshake {
    /// Start a handshake, returning the `Hello` to send.
    ///
    /// `expected` is the peer an outbound attempt targets; `None` for an
    /// accepted connection, where the peer is identified by certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Handshake`] if our certificate is too large to frame.
    pub fn start(identity: &LocalIdentity, expected: Option<PeerId>) -> Result<(Self, Vec<u8>), CryptoError> {
        let ephemeral = EphemeralKeyPair::generate(&mut OsRng);
        let cert = identity.certificate_der();
        let cert_len =
            u16::try_from(cert.len()).map_err(|_| CryptoError::Handshake("certificate too large".into()))?;

        let mut hello = Vec::with_capacity(HELLO_FIXED_LEN + cert.len());
        hello.extend_from_slice(HELLO_MAGIC);
        hello.extend_from_slice(ephemeral.public_bytes());
        hello.extend_from_slice(&cert_len.to_be_bytes());
        hello.extend_from_slice(cert);

        let handshake = Self {
            ephemeral,
            local_hello: hello.clone(),
            expected,
            state: State::AwaitHello,
        };
        Ok((handshake, hello))
    }

    /// Peer this handshake was started for, if any
    #[must_use]
    pub fn expected_peer(&self) -> Option<PeerId> {
        self.expected
    }

    /// True once the peer's `Hello` has been accepted
    #[must_use]
    pub fn hello_received(&self) -> bool {
        !matches!(self.state, State::AwaitHello)
    }

    /// Process the peer's `Hello`, returning our `Auth`.
    ///
    /// # Errors
    ///
    /// Authentication errors (see [`CryptoError::is_authentication_failure`])
    /// if the certificate is not trusted or names the wrong peer; otherwise
    /// [`CryptoError::Handshake`] / [`CryptoError::KeyExchange`] for a
    /// malformed exchange.
    pub fn read_hello(
        &mut self,
        msg: &[u8],
        identity: &LocalIdentity,
        verifier: &dyn PeerVerifier,
    ) -> Result<Vec<u8>, CryptoError> {
        if !matches!(self.state, State::AwaitHello) {
            return Err(CryptoError::Handshake("unexpected hello".into()));
        }
        let (peer_ephemeral, cert_der) = parse_hello(msg)?;
        if &peer_ephemeral == self.ephemeral.public_bytes() {
            return Err(CryptoError::Handshake("reflected hello".into()));
        }

        let info = CertificateInfo::parse(cert_der)?;
        let peer = verifier.verify_peer(&info)?;
        if let Some(expected) = self.expected {
            if expected != peer {
                return Err(CryptoError::IdentityMismatch {
                    expected: expected.get(),
                    found: peer.to_string(),
                });
            }
        }

        let shared = zeroize::Zeroizing::new(self.ephemeral.agree(&peer_ephemeral)?);
        let transcript = hash::transcript(&self.local_hello, msg);
        let keys = hash::derive_session_keys(&shared, &transcript);
        let send_low = self.ephemeral.public_bytes() < &peer_ephemeral;

        let auth = identity.sign(&hash::signature_payload(&transcript)).to_vec();
        trace!("Hello accepted from peer {} ({})", peer, info.fingerprint);

        self.state = State::AwaitAuth {
            peer,
            fingerprint: info.fingerprint,
            peer_key: info.public_key,
            transcript,
            keys,
            send_low,
        };
        Ok(auth)
    }

    /// Process the peer's `Auth`, completing the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the peer did not prove
    /// possession of its certificate key.
    pub fn read_auth(&mut self, msg: &[u8]) -> Result<HandshakeOutput, CryptoError> {
        let State::AwaitAuth {
            peer,
            fingerprint,
            peer_key,
            transcript,
            keys,
            send_low,
        } = std::mem::replace(&mut self.state, State::Finished)
        else {
            return Err(CryptoError::Handshake("unexpected auth".into()));
        };

        let sig: [u8; ED25519_SIGNATURE_SIZE] = msg.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        let vk = VerifyingKey::from_bytes(&peer_key).map_err(|_| CryptoError::InvalidPublicKey)?;
        vk.verify(&hash::signature_payload(&transcript), &Signature::from_bytes(&sig))
            .map_err(|_| CryptoError::InvalidSignature)?;

        let cipher = if send_low {
            RecordCipher::new(keys.low, keys.high, keys.salt)
        } else {
            RecordCipher::new(keys.high, keys.low, keys.salt)
        };
        debug!("Handshake complete with peer {}", peer);
        Ok(HandshakeOutput {
            peer,
            fingerprint,
            cipher,
        })
    }
}

fn parse_hello(msg: &[u8]) -> Result<([u8; 32], &[u8]), CryptoError> {
    if msg.len() < HELLO_FIXED_LEN || &msg[..4] != HELLO_MAGIC {
        return Err(CryptoError::Handshake("malformed hello".into()));
    }
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&msg[4..36]);
    let cert_len = usize::from(u16::from_be_bytes([msg[36], msg[37]]));
    let cert = &msg[HELLO_FIXED_LEN..];
    if cert.len() != cert_len {
        return Err(CryptoError::Handshake("hello certificate length mismatch".into()));
    }
    Ok((ephemeral, cert))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustStore;

    struct Side {
        identity: LocalIdentity,
        trust: TrustStore,
    }

    fn side(id: u32) -> Side {
        Side {
            identity: LocalIdentity::generate(PeerId::new(id)).unwrap(),
            trust: TrustStore::new(),
        }
    }

    fn befriend(a: &Side, b: &Side) {
        a.trust
            .add_or_update_peer(b.identity.certificate_der(), b.identity.id(), None);
        b.trust
            .add_or_update_peer(a.identity.certificate_der(), a.identity.id(), None);
    }

    #[test]
    fn test_mutual_handshake() {
        let alice = side(1);
        let bob = side(2);
        befriend(&alice, &bob);

        let (mut ha, hello_a) = Handshake::start(&alice.identity, Some(PeerId::new(2))).unwrap();
        let (mut hb, hello_b) = Handshake::start(&bob.identity, None).unwrap();

        let auth_a = ha.read_hello(&hello_b, &alice.identity, &alice.trust).unwrap();
        let auth_b = hb.read_hello(&hello_a, &bob.identity, &bob.trust).unwrap();

        let mut out_a = ha.read_auth(&auth_b).unwrap();
        let mut out_b = hb.read_auth(&auth_a).unwrap();

        assert_eq!(out_a.peer, PeerId::new(2));
        assert_eq!(out_b.peer, PeerId::new(1));
        assert_eq!(out_b.fingerprint, alice.identity.fingerprint());

        let rec = out_a.cipher.seal(b"ping").unwrap();
        assert_eq!(out_b.cipher.open(&rec).unwrap(), b"ping");
        let rec = out_b.cipher.seal(b"pong").unwrap();
        assert_eq!(out_a.cipher.open(&rec).unwrap(), b"pong");
    }

    #[test]
    fn test_untrusted_certificate_is_auth_failure() {
        let alice = side(1);
        let bob = side(2);
        // bob trusts alice, alice does not trust bob
        bob.trust
            .add_or_update_peer(alice.identity.certificate_der(), alice.identity.id(), None);

        let (mut ha, _) = Handshake::start(&alice.identity, None).unwrap();
        let (_, hello_b) = Handshake::start(&bob.identity, None).unwrap();
        let err = ha.read_hello(&hello_b, &alice.identity, &alice.trust).unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_wrong_expected_peer() {
        let alice = side(1);
        let bob = side(2);
        befriend(&alice, &bob);

        let (mut ha, _) = Handshake::start(&alice.identity, Some(PeerId::new(3))).unwrap();
        let (_, hello_b) = Handshake::start(&bob.identity, None).unwrap();
        let err = ha.read_hello(&hello_b, &alice.identity, &alice.trust).unwrap_err();
        assert!(matches!(err, CryptoError::IdentityMismatch { expected: 3, .. }));
    }

    #[test]
    fn test_forged_auth_rejected() {
        let alice = side(1);
        let bob = side(2);
        befriend(&alice, &bob);

        let (mut ha, _) = Handshake::start(&alice.identity, None).unwrap();
        let (_, hello_b) = Handshake::start(&bob.identity, None).unwrap();
        ha.read_hello(&hello_b, &alice.identity, &alice.trust).unwrap();
        assert!(matches!(ha.read_auth(&[0u8; 64]), Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn test_malformed_hello() {
        let alice = side(1);
        let (mut ha, hello_a) = Handshake::start(&alice.identity, None).unwrap();
        assert!(ha.read_hello(b"CFD1", &alice.identity, &alice.trust).is_err());
        assert!(ha.read_hello(&hello_a[..hello_a.len() - 1], &alice.identity, &alice.trust).is_err());
        // our own hello bounced back
        let err = ha.read_hello(&hello_a, &alice.identity, &alice.trust).unwrap_err();
        assert!(!err.is_authentication_failure());
        assert!(!ha.hello_received());
    }

    #[test]
    fn test_auth_before_hello() {
        let alice = side(1);
        let (mut ha, _) = Handshake::start(&alice.identity, None).unwrap();
        assert!(matches!(ha.read_auth(&[0u8; 64]), Err(CryptoError::Handshake(_))));
    }
}
