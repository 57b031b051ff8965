//! Channels: the byte pipes a stream framer reads and writes.
//!
//! [`Channel`] is what the framer needs from a connection. [`SecureChannel`]
//! implements it over any raw [`ByteChannel`] by running the
//! mutual-authentication handshake and then sealing every write into an
//! AEAD record. On the raw transport both handshake messages and records are
//! framed as a 2-byte big-endian length followed by the body.

use crate::error::ChannelError;
use confidant_crypto::aead::{RecordCipher, TAG_SIZE};
use confidant_crypto::{Fingerprint, Handshake, LocalIdentity, PeerId, PeerVerifier};
use confidant_transport::transport::is_would_block;
use confidant_transport::{ByteChannel, TransportStats};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Largest plaintext sealed into one record
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

/// Sealed bytes queued for the socket before writes are refused
const TX_HIGH_WATER: usize = 64 * 1024;

/// Raw bytes buffered from the socket before reads pause
const RX_HIGH_WATER: usize = 256 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Non-blocking byte channel as seen by the framer.
///
/// `read` and `write` return `Ok(0)` when nothing can move right now; a
/// closed or failed channel reports an error.
pub trait Channel: Send {
    /// Read available bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] once the remote has closed and all
    /// buffered data was consumed, or any underlying failure.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError>;

    /// Write as many bytes as the channel will take now.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed or failed.
    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError>;

    /// True while the channel can carry data
    fn is_active(&self) -> bool;

    /// True when a write would accept bytes
    fn can_write(&self) -> bool;

    /// True when a read would return bytes
    fn more_to_read(&self) -> bool;

    /// Drive transport timers and flush pending output.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel has died.
    fn poll(&mut self, _now: Instant) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Close the channel. Idempotent.
    fn close(&mut self);
}

enum SecureState {
    Handshaking(Box<Handshake>),
    Established(RecordCipher),
    Closed,
}

/// Result of a handshake that just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authenticated {
    /// Authenticated peer
    pub peer: PeerId,
    /// Fingerprint of the peer's certificate
    pub fingerprint: Fingerprint,
}

/// Authenticated, encrypted channel over a raw transport.
pub struct SecureChannel {
    raw: Box<dyn ByteChannel>,
    state: SecureState,
    identity: Arc<LocalIdentity>,
    verifier: Arc<dyn PeerVerifier>,
    tx: Vec<u8>,
    tx_pos: usize,
    rx: Vec<u8>,
    plain: VecDeque<u8>,
    peer: Option<Authenticated>,
    raw_eof: bool,
}

impl SecureChannel {
    /// Wrap `raw` and queue our `Hello`.
    ///
    /// `expected` names the peer an outbound attempt targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake cannot be started.
    pub fn start(
        raw: Box<dyn ByteChannel>,
        identity: Arc<LocalIdentity>,
        verifier: Arc<dyn PeerVerifier>,
        expected: Option<PeerId>,
    ) -> Result<Self, ChannelError> {
        let (handshake, hello) = Handshake::start(&identity, expected)?;
        let mut channel = Self {
            raw,
            state: SecureState::Handshaking(Box::new(handshake)),
            identity,
            verifier,
            tx: Vec::new(),
            tx_pos: 0,
            rx: Vec::new(),
            plain: VecDeque::new(),
            peer: None,
            raw_eof: false,
        };
        channel.queue_frame(&hello)?;
        Ok(channel)
    }

    /// Remote address of the raw transport
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.raw.peer_addr()
    }

    /// The authenticated peer, once the handshake has finished
    #[must_use]
    pub fn authenticated(&self) -> Option<Authenticated> {
        self.peer
    }

    /// True once the handshake has finished
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(self.state, SecureState::Established(_))
    }

    /// True once the peer's `Hello` was accepted; from here on failures are
    /// about authentication, not reachability
    #[must_use]
    pub fn hello_received(&self) -> bool {
        match &self.state {
            SecureState::Handshaking(h) => h.hello_received(),
            _ => true,
        }
    }

    /// Raw transport counters
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.raw.stats()
    }

    fn pending_tx(&self) -> usize {
        self.tx.len() - self.tx_pos
    }

    fn queue_frame(&mut self, body: &[u8]) -> Result<(), ChannelError> {
        let len = u16::try_from(body.len()).map_err(|_| ChannelError::RecordTooLarge(body.len()))?;
        self.tx.extend_from_slice(&len.to_be_bytes());
        self.tx.extend_from_slice(body);
        Ok(())
    }

    fn flush_tx(&mut self) -> Result<(), ChannelError> {
        while self.tx_pos < self.tx.len() {
            match self.raw.write(&self.tx[self.tx_pos..]) {
                Ok(0) => break,
                Ok(n) => self.tx_pos += n,
                Err(e) if is_would_block(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        if self.tx_pos == self.tx.len() {
            self.tx.clear();
            self.tx_pos = 0;
        } else if self.tx_pos > TX_HIGH_WATER {
            self.tx.drain(..self.tx_pos);
            self.tx_pos = 0;
        }
        Ok(())
    }

    fn fill_rx(&mut self) -> Result<(), ChannelError> {
        let mut chunk = [0u8; READ_CHUNK];
        while !self.raw_eof && self.rx.len() < RX_HIGH_WATER {
            match self.raw.read(&mut chunk) {
                Ok(0) => {
                    trace!("Raw transport to {} reached EOF", self.raw.peer_addr());
                    self.raw_eof = true;
                }
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if is_would_block(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn complete_frame_len(&self) -> Option<usize> {
        if self.rx.len() < 2 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.rx[0], self.rx[1]]));
        (self.rx.len() >= 2 + len).then_some(len)
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let len = self.complete_frame_len()?;
        let frame = self.rx[2..2 + len].to_vec();
        self.rx.drain(..2 + len);
        Some(frame)
    }

    fn process_frames(&mut self) -> Result<Option<Authenticated>, ChannelError> {
        let mut completed = None;
        while let Some(frame) = self.next_frame() {
            match &mut self.state {
                SecureState::Handshaking(handshake) => {
                    if handshake.hello_received() {
                        let out = handshake.read_auth(&frame)?;
                        let auth = Authenticated {
                            peer: out.peer,
                            fingerprint: out.fingerprint,
                        };
                        debug!("Secure channel to {} authenticated as peer {}", self.raw.peer_addr(), out.peer);
                        self.state = SecureState::Established(out.cipher);
                        self.peer = Some(auth);
                        completed = Some(auth);
                    } else {
                        let reply = handshake.read_hello(&frame, &self.identity, self.verifier.as_ref())?;
                        self.queue_frame(&reply)?;
                    }
                }
                SecureState::Established(cipher) => {
                    if frame.len() > MAX_RECORD_PLAINTEXT + TAG_SIZE {
                        return Err(ChannelError::RecordTooLarge(frame.len()));
                    }
                    let plain = cipher.open(&frame)?;
                    self.plain.extend(plain);
                }
                SecureState::Closed => return Err(ChannelError::Closed),
            }
        }
        Ok(completed)
    }

    /// Move bytes in both directions and advance the handshake.
    ///
    /// Returns the peer identity exactly once, on the call that completes
    /// the handshake.
    ///
    /// # Errors
    ///
    /// Authentication failures surface as [`ChannelError::Crypto`]; a
    /// transport that closes mid-handshake gives [`ChannelError::Closed`].
    pub fn drive(&mut self, now: Instant) -> Result<Option<Authenticated>, ChannelError> {
        if matches!(self.state, SecureState::Closed) {
            return Err(ChannelError::Closed);
        }
        self.raw.poll(now)?;
        self.flush_tx()?;
        self.fill_rx()?;
        let completed = self.process_frames()?;
        self.flush_tx()?;

        if self.raw_eof && !self.is_established() {
            return Err(ChannelError::Closed);
        }
        Ok(completed)
    }
}

impl Channel for SecureChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        if self.plain.is_empty() && self.is_established() {
            self.fill_rx()?;
            self.process_frames()?;
        }
        if self.plain.is_empty() {
            if self.raw_eof || !self.raw.is_open() || matches!(self.state, SecureState::Closed) {
                return Err(ChannelError::Closed);
            }
            return Ok(0);
        }
        let n = buf.len().min(self.plain.len());
        for (dst, src) in buf.iter_mut().zip(self.plain.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        match self.state {
            SecureState::Closed => return Err(ChannelError::Closed),
            SecureState::Handshaking(_) => return Ok(0),
            SecureState::Established(_) => {}
        }
        if !self.raw.is_open() {
            return Err(ChannelError::Closed);
        }
        if self.pending_tx() >= TX_HIGH_WATER || buf.is_empty() {
            self.flush_tx()?;
            return Ok(0);
        }
        let n = buf.len().min(MAX_RECORD_PLAINTEXT);
        let SecureState::Established(cipher) = &mut self.state else {
            return Ok(0);
        };
        let record = cipher.seal(&buf[..n])?;
        self.queue_frame(&record)?;
        self.flush_tx()?;
        Ok(n)
    }

    fn is_active(&self) -> bool {
        self.is_established() && (self.raw.is_open() || !self.plain.is_empty())
    }

    fn can_write(&self) -> bool {
        self.is_established() && self.raw.is_open() && self.pending_tx() < TX_HIGH_WATER
    }

    fn more_to_read(&self) -> bool {
        !self.plain.is_empty() || self.complete_frame_len().is_some()
    }

    fn poll(&mut self, now: Instant) -> Result<(), ChannelError> {
        self.raw.poll(now)?;
        self.flush_tx()
    }

    fn close(&mut self) {
        if !matches!(self.state, SecureState::Closed) {
            let _ = self.flush_tx();
            self.raw.shutdown();
            self.state = SecureState::Closed;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use confidant_crypto::TrustStore;
    use confidant_transport::TransportResult;
    use std::io::{self, Read, Write};
    use std::sync::Mutex;

    /// In-memory duplex pipe end.
    pub(crate) struct Pipe {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<VecDeque<u8>>>,
        open: Arc<Mutex<bool>>,
        addr: SocketAddr,
    }

    pub(crate) fn pipe_pair() -> (Pipe, Pipe) {
        let a = Arc::new(Mutex::new(VecDeque::new()));
        let b = Arc::new(Mutex::new(VecDeque::new()));
        let open = Arc::new(Mutex::new(true));
        (
            Pipe {
                inbound: Arc::clone(&a),
                outbound: Arc::clone(&b),
                open: Arc::clone(&open),
                addr: "127.0.0.1:1".parse().unwrap(),
            },
            Pipe {
                inbound: b,
                outbound: a,
                open,
                addr: "127.0.0.1:2".parse().unwrap(),
            },
        )
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut q = self.inbound.lock().unwrap();
            if q.is_empty() {
                return if *self.open.lock().unwrap() {
                    Err(io::ErrorKind::WouldBlock.into())
                } else {
                    Ok(0)
                };
            }
            let n = buf.len().min(q.len());
            for (d, s) in buf.iter_mut().zip(q.drain(..n)) {
                *d = s;
            }
            Ok(n)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !*self.open.lock().unwrap() {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            self.outbound.lock().unwrap().extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ByteChannel for Pipe {
        fn peer_addr(&self) -> SocketAddr {
            self.addr
        }

        fn is_open(&self) -> bool {
            *self.open.lock().unwrap()
        }

        fn poll(&mut self, _now: Instant) -> TransportResult<()> {
            Ok(())
        }

        fn shutdown(&mut self) {
            *self.open.lock().unwrap() = false;
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    pub(crate) struct Party {
        pub identity: Arc<LocalIdentity>,
        pub trust: Arc<TrustStore>,
    }

    pub(crate) fn party(id: u32) -> Party {
        Party {
            identity: Arc::new(LocalIdentity::generate(PeerId::new(id)).unwrap()),
            trust: Arc::new(TrustStore::new()),
        }
    }

    pub(crate) fn befriend(a: &Party, b: &Party) {
        a.trust
            .add_or_update_peer(b.identity.certificate_der(), b.identity.id(), None);
        b.trust
            .add_or_update_peer(a.identity.certificate_der(), a.identity.id(), None);
    }

    /// Two established secure channels joined by a pipe.
    pub(crate) fn connected_pair(a: &Party, b: &Party) -> (SecureChannel, SecureChannel) {
        let (pa, pb) = pipe_pair();
        let mut ca = SecureChannel::start(
            Box::new(pa),
            Arc::clone(&a.identity),
            a.trust.clone(),
            Some(b.identity.id()),
        )
        .unwrap();
        let mut cb = SecureChannel::start(Box::new(pb), Arc::clone(&b.identity), b.trust.clone(), None).unwrap();

        let now = Instant::now();
        let mut done = (false, false);
        for _ in 0..4 {
            done.0 |= ca.drive(now).unwrap().is_some();
            done.1 |= cb.drive(now).unwrap().is_some();
        }
        assert!(done.0 && done.1);
        (ca, cb)
    }

    #[test]
    fn test_handshake_then_records() {
        let alice = party(1);
        let bob = party(2);
        befriend(&alice, &bob);
        let (mut ca, mut cb) = connected_pair(&alice, &bob);

        assert_eq!(ca.authenticated().unwrap().peer, PeerId::new(2));
        assert_eq!(cb.authenticated().unwrap().fingerprint, alice.identity.fingerprint());

        let big = vec![0x5Au8; MAX_RECORD_PLAINTEXT + 100];
        let mut sent = 0;
        while sent < big.len() {
            sent += ca.write(&big[sent..]).unwrap();
        }

        let mut got = Vec::new();
        let mut buf = [0u8; 4096];
        while got.len() < big.len() {
            let n = cb.read(&mut buf).unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, big);
        assert_eq!(cb.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_untrusted_peer_fails_authentication() {
        let alice = party(1);
        let bob = party(2);
        // only bob knows alice
        bob.trust
            .add_or_update_peer(alice.identity.certificate_der(), alice.identity.id(), None);

        let (pa, pb) = pipe_pair();
        let mut ca =
            SecureChannel::start(Box::new(pa), Arc::clone(&alice.identity), alice.trust.clone(), None).unwrap();
        let mut cb = SecureChannel::start(Box::new(pb), Arc::clone(&bob.identity), bob.trust.clone(), None).unwrap();

        let now = Instant::now();
        cb.drive(now).unwrap();
        let err = ca.drive(now).unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[test]
    fn test_writes_wait_for_handshake() {
        let alice = party(1);
        let (pa, _pb) = pipe_pair();
        let mut ca =
            SecureChannel::start(Box::new(pa), Arc::clone(&alice.identity), alice.trust.clone(), None).unwrap();
        assert_eq!(ca.write(b"early").unwrap(), 0);
        assert!(!ca.is_active());
        assert!(!ca.can_write());
    }

    #[test]
    fn test_remote_close_surfaces() {
        let alice = party(1);
        let bob = party(2);
        befriend(&alice, &bob);
        let (mut ca, mut cb) = connected_pair(&alice, &bob);

        ca.close();
        let mut buf = [0u8; 16];
        assert!(matches!(cb.read(&mut buf), Err(ChannelError::Closed)));
        assert!(!cb.is_active());
    }
}
