//! # Confidant Transport
//!
//! Raw byte transports between friends.
//!
//! Everything here is non-blocking and driven by polling: connects return a
//! pending handle, reads and writes return `WouldBlock` instead of parking,
//! and the reliable UDP stream retransmits only when polled. The caller
//! owns the sockets and decides how often to poll.
//!
//! This crate provides:
//! - [`tcp`]: non-blocking outbound connects, a listener, and byte channels
//! - [`udp`]: one shared UDP socket demultiplexed by remote address, plus
//!   the small signalling datagrams used for NAT traversal
//! - [`reliable`]: an ordered, retransmitting byte stream over that socket

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod reliable;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use reliable::UdpStream;
pub use tcp::{TcpAcceptor, TcpChannel, TcpConnector};
pub use transport::{ByteChannel, TransportError, TransportResult, TransportStats};
pub use udp::{Signal, SignalKind, UdpEvent, UdpMux};

/// Largest payload carried by one reliable-UDP data segment
pub const MAX_SEGMENT_SIZE: usize = 1024;

/// Segments in flight before a reliable-UDP writer blocks
pub const SEND_WINDOW: usize = 64;
