//! Ordered, retransmitting byte stream over the shared UDP socket.
//!
//! Go-back-N with cumulative acknowledgements. Segments carry a 32-bit
//! sequence number; the receiver accepts only the next expected segment and
//! acknowledges the next one it wants. When the oldest unacknowledged
//! segment has waited a full retransmission period, every segment in flight
//! is sent again.
//!
//! Both ends may send SYN at once; each answers the other's SYN with SYNACK
//! and the stream is established on either, which is what lets two peers
//! behind NATs punch through to each other.

use crate::transport::{ByteChannel, TransportError, TransportResult, TransportStats, is_would_block};
use crate::udp::{DATAGRAM_MAGIC, DatagramKind};
use crate::{MAX_SEGMENT_SIZE, SEND_WINDOW};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Consecutive unanswered retransmission rounds before the stream is dead
pub const MAX_RETRANSMITS: u32 = 20;

/// Received bytes buffered before new segments are refused
const RECV_BUFFER_LIMIT: usize = 1024 * 1024;

/// Datagrams queued for a stream before the mux starts dropping them
const INBOX_LIMIT: usize = 4 * SEND_WINDOW;

const DATA_HEADER_LEN: usize = 6;

/// Datagrams routed to one stream by the mux, awaiting its next poll.
#[derive(Default)]
pub(crate) struct Inbox {
    datagrams: VecDeque<Vec<u8>>,
}

impl Inbox {
    pub(crate) fn push(inbox: &Mutex<Inbox>, datagram: Vec<u8>) {
        let mut guard = inbox.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.datagrams.len() < INBOX_LIMIT {
            guard.datagrams.push_back(datagram);
        }
    }

    fn take(inbox: &Mutex<Inbox>) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut inbox.lock().unwrap_or_else(PoisonError::into_inner).datagrams)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    /// Our SYN is out, nothing heard yet
    SynSent,
    /// Created by a remote SYN that has not been processed yet
    Accepting,
    Established,
    Closed,
}

/// `a` precedes `b` in wrapping sequence space
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Reliable stream to one remote address.
pub struct UdpStream {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    inbox: Arc<Mutex<Inbox>>,
    state: StreamState,
    period: Duration,

    next_seq: u32,
    unacked: VecDeque<(u32, Vec<u8>)>,
    last_transmit: Option<Instant>,
    retransmits: u32,

    expected: u32,
    recv_buf: VecDeque<u8>,
    peer_closed: bool,

    stats: TransportStats,
}

impl UdpStream {
    pub(crate) fn connect(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        inbox: Arc<Mutex<Inbox>>,
        period: Duration,
    ) -> Self {
        let mut stream = Self::new(socket, remote, inbox, period, StreamState::SynSent);
        stream.send_control(DatagramKind::Syn);
        stream.last_transmit = Some(Instant::now());
        stream
    }

    pub(crate) fn accept(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        inbox: Arc<Mutex<Inbox>>,
        period: Duration,
    ) -> Self {
        let mut stream = Self::new(socket, remote, inbox, period, StreamState::Accepting);
        stream.process_inbox(Instant::now());
        stream
    }

    fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        inbox: Arc<Mutex<Inbox>>,
        period: Duration,
        state: StreamState,
    ) -> Self {
        Self {
            socket,
            remote,
            inbox,
            state,
            period,
            next_seq: 0,
            unacked: VecDeque::new(),
            last_transmit: None,
            retransmits: 0,
            expected: 0,
            recv_buf: VecDeque::new(),
            peer_closed: false,
            stats: TransportStats::new(),
        }
    }

    /// Remote address
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// True once SYN/SYNACK have been exchanged
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == StreamState::Established
    }

    /// Segments sent but not yet acknowledged
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.unacked.len()
    }

    fn send_raw(&mut self, datagram: &[u8]) {
        match self.socket.send_to(datagram, self.remote) {
            Ok(n) => self.stats.record_send(n),
            // Lost datagrams are recovered by retransmission
            Err(e) if is_would_block(&e) => {}
            Err(e) => trace!("UDP send to {} failed: {}", self.remote, e),
        }
    }

    fn send_control(&mut self, kind: DatagramKind) {
        self.send_raw(&[DATAGRAM_MAGIC, kind as u8]);
    }

    fn send_ack(&mut self) {
        let mut buf = [0u8; DATA_HEADER_LEN];
        buf[0] = DATAGRAM_MAGIC;
        buf[1] = DatagramKind::Ack as u8;
        buf[2..6].copy_from_slice(&self.expected.to_be_bytes());
        self.send_raw(&buf);
    }

    fn establish(&mut self) {
        if self.state != StreamState::Established {
            debug!("UDP stream to {} established", self.remote);
            self.state = StreamState::Established;
            self.retransmits = 0;
            self.last_transmit = None;
        }
    }

    fn process_inbox(&mut self, now: Instant) {
        let datagrams = Inbox::take(&self.inbox);
        let mut ack_needed = false;

        for datagram in datagrams {
            if self.state == StreamState::Closed {
                break;
            }
            let Some(kind) = DatagramKind::parse(&datagram) else {
                continue;
            };
            self.stats.record_recv(datagram.len());

            match kind {
                DatagramKind::Syn => {
                    self.establish();
                    self.send_control(DatagramKind::SynAck);
                }
                DatagramKind::SynAck => self.establish(),
                DatagramKind::Data => {
                    if datagram.len() < DATA_HEADER_LEN {
                        continue;
                    }
                    // Data implies the peer saw our SYN even if its SYNACK was lost
                    if self.state == StreamState::SynSent {
                        self.establish();
                    }
                    let seq = u32::from_be_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]);
                    let payload = &datagram[DATA_HEADER_LEN..];
                    if seq == self.expected && self.recv_buf.len() + payload.len() <= RECV_BUFFER_LIMIT {
                        self.recv_buf.extend(payload);
                        self.expected = self.expected.wrapping_add(1);
                    }
                    ack_needed = true;
                }
                DatagramKind::Ack => {
                    if datagram.len() < DATA_HEADER_LEN {
                        continue;
                    }
                    let ack = u32::from_be_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]);
                    let before = self.unacked.len();
                    while self.unacked.front().is_some_and(|(seq, _)| seq_before(*seq, ack)) {
                        self.unacked.pop_front();
                    }
                    if self.unacked.len() < before {
                        self.retransmits = 0;
                        self.last_transmit = (!self.unacked.is_empty()).then_some(now);
                    }
                }
                DatagramKind::Fin => {
                    debug!("UDP stream to {} closed by peer", self.remote);
                    self.peer_closed = true;
                }
                DatagramKind::ConnectBack | DatagramKind::Tunnel => {}
            }
        }

        if ack_needed {
            self.send_ack();
        }
    }

    fn close(&mut self) {
        if self.state != StreamState::Closed {
            self.send_control(DatagramKind::Fin);
            self.state = StreamState::Closed;
            self.unacked.clear();
        }
    }
}

impl Read for UdpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.process_inbox(Instant::now());
        if !self.recv_buf.is_empty() {
            let n = buf.len().min(self.recv_buf.len());
            for (dst, src) in buf.iter_mut().zip(self.recv_buf.drain(..n)) {
                *dst = src;
            }
            return Ok(n);
        }
        if self.peer_closed || self.state == StreamState::Closed {
            return Ok(0);
        }
        Err(io::ErrorKind::WouldBlock.into())
    }
}

impl Write for UdpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let now = Instant::now();
        self.process_inbox(now);
        match self.state {
            StreamState::Closed => return Err(io::ErrorKind::NotConnected.into()),
            StreamState::Established if !self.peer_closed => {}
            StreamState::Established => return Err(io::ErrorKind::BrokenPipe.into()),
            _ => return Err(io::ErrorKind::WouldBlock.into()),
        }

        let mut written = 0;
        for chunk in buf.chunks(MAX_SEGMENT_SIZE) {
            if self.unacked.len() >= SEND_WINDOW {
                break;
            }
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);

            let mut datagram = Vec::with_capacity(DATA_HEADER_LEN + chunk.len());
            datagram.push(DATAGRAM_MAGIC);
            datagram.push(DatagramKind::Data as u8);
            datagram.extend_from_slice(&seq.to_be_bytes());
            datagram.extend_from_slice(chunk);
            self.send_raw(&datagram);

            if self.unacked.is_empty() {
                self.last_transmit = Some(now);
            }
            self.unacked.push_back((seq, datagram));
            written += chunk.len();
        }

        if written == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteChannel for UdpStream {
    fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    fn is_open(&self) -> bool {
        self.state != StreamState::Closed && !(self.peer_closed && self.recv_buf.is_empty())
    }

    fn can_write(&self) -> bool {
        self.state == StreamState::Established && !self.peer_closed && self.unacked.len() < SEND_WINDOW
    }

    fn poll(&mut self, now: Instant) -> TransportResult<()> {
        self.process_inbox(now);

        let due = self
            .last_transmit
            .is_some_and(|t| now.saturating_duration_since(t) >= self.period);
        match self.state {
            StreamState::Closed => return Err(TransportError::Closed),
            StreamState::SynSent if due => {
                self.send_control(DatagramKind::Syn);
                self.retransmits += 1;
                self.last_transmit = Some(now);
            }
            StreamState::Established if due && !self.unacked.is_empty() => {
                let segments: Vec<Vec<u8>> = self.unacked.iter().map(|(_, d)| d.clone()).collect();
                trace!("Retransmitting {} segments to {}", segments.len(), self.remote);
                for datagram in &segments {
                    self.send_raw(datagram);
                    self.stats.record_retransmit();
                }
                self.retransmits += 1;
                self.last_transmit = Some(now);
            }
            _ => {}
        }

        if self.retransmits > MAX_RETRANSMITS {
            warn!("UDP stream to {} unresponsive, closing", self.remote);
            self.close();
            return Err(TransportError::Unresponsive(MAX_RETRANSMITS));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.close();
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }
}
