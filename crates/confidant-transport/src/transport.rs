//! Byte channel abstraction shared by every raw transport.
//!
//! A [`ByteChannel`] is a non-blocking, ordered, reliable byte pipe to one
//! remote address. Reads and writes follow `std::io` conventions: `Ok(0)`
//! from `read` means the remote closed, `ErrorKind::WouldBlock` means try
//! again on a later tick.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Channel has been shut down or reset
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer stopped acknowledging data
    #[error("Peer unresponsive after {0} retransmissions")]
    Unresponsive(u32),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Non-blocking ordered byte pipe to one remote address.
pub trait ByteChannel: Read + Write + Send {
    /// Address of the remote end
    fn peer_addr(&self) -> SocketAddr;

    /// True until the channel fails or either side closes it
    fn is_open(&self) -> bool;

    /// True when a write would currently accept at least one byte
    fn can_write(&self) -> bool {
        self.is_open()
    }

    /// Drive timers (retransmission, keepalive). TCP needs none.
    ///
    /// # Errors
    ///
    /// Returns an error once the channel is known to be dead.
    fn poll(&mut self, _now: Instant) -> TransportResult<()> {
        Ok(())
    }

    /// Close the channel. Idempotent.
    fn shutdown(&mut self);

    /// Counters for this channel
    fn stats(&self) -> TransportStats;
}

impl<C: ByteChannel + ?Sized> ByteChannel for Box<C> {
    fn peer_addr(&self) -> SocketAddr {
        (**self).peer_addr()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn poll(&mut self, now: Instant) -> TransportResult<()> {
        (**self).poll(now)
    }

    fn shutdown(&mut self) {
        (**self).shutdown();
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Datagrams or write calls that moved data out
    pub packets_sent: u64,
    /// Datagrams or read calls that moved data in
    pub packets_received: u64,
    /// Segments sent again after a retransmission timeout
    pub retransmits: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a retransmitted segment
    pub fn record_retransmit(&mut self) {
        self.retransmits += 1;
    }
}

/// True for errors that only mean "not now"
#[must_use]
pub fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
