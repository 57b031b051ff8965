//! Shared UDP socket, demultiplexed by remote address.
//!
//! One socket carries every UDP stream and every traversal signal, so that
//! the port a friend learned for us is the port all our datagrams come from.
//! Each datagram starts with a magic byte and a kind:
//!
//! ```text
//! stream:  0xCF kind(SYN|SYNACK|DATA|ACK|FIN) ...
//! signal:  0xCF kind(CONNECT_BACK|TUNNEL) sender_id(u32 BE) ipv4(4) port(u16 BE)
//! ```

use crate::reliable::{Inbox, UdpStream};
use crate::transport::{TransportError, TransportResult, is_would_block};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// First byte of every Confidant datagram
pub const DATAGRAM_MAGIC: u8 = 0xCF;

/// Size of a signal datagram
pub const SIGNAL_LEN: usize = 12;

/// Most datagrams drained from the socket in one poll
const MAX_DATAGRAMS_PER_POLL: usize = 1024;

/// Datagram kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum DatagramKind {
    Syn = 0x01,
    SynAck = 0x02,
    Data = 0x03,
    Ack = 0x04,
    Fin = 0x05,
    ConnectBack = 0x10,
    Tunnel = 0x11,
}

impl DatagramKind {
    pub(crate) fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < 2 || datagram[0] != DATAGRAM_MAGIC {
            return None;
        }
        Some(match datagram[1] {
            0x01 => Self::Syn,
            0x02 => Self::SynAck,
            0x03 => Self::Data,
            0x04 => Self::Ack,
            0x05 => Self::Fin,
            0x10 => Self::ConnectBack,
            0x11 => Self::Tunnel,
            _ => return None,
        })
    }
}

/// Traversal signal kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// "I cannot reach you; please connect to me over TCP at this address"
    ConnectBack,
    /// "I am trying you over UDP from this address"
    Tunnel,
}

/// A traversal signal received from a friend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    /// Signal kind
    pub kind: SignalKind,
    /// Peer id the sender claims. Unauthenticated: only ever used to pick
    /// which friend to attempt, never to trust a channel.
    pub sender: u32,
    /// Address the sender asks to be reached at
    pub reply_to: SocketAddrV4,
    /// Source address of the datagram
    pub from: SocketAddr,
}

impl Signal {
    fn encode(kind: SignalKind, sender: u32, reply_to: SocketAddrV4) -> [u8; SIGNAL_LEN] {
        let mut buf = [0u8; SIGNAL_LEN];
        buf[0] = DATAGRAM_MAGIC;
        buf[1] = match kind {
            SignalKind::ConnectBack => DatagramKind::ConnectBack as u8,
            SignalKind::Tunnel => DatagramKind::Tunnel as u8,
        };
        buf[2..6].copy_from_slice(&sender.to_be_bytes());
        buf[6..10].copy_from_slice(&reply_to.ip().octets());
        buf[10..12].copy_from_slice(&reply_to.port().to_be_bytes());
        buf
    }

    /// Decode a signal datagram, `None` if it is anything else.
    #[must_use]
    pub fn decode(datagram: &[u8], from: SocketAddr) -> Option<Self> {
        let kind = match DatagramKind::parse(datagram)? {
            DatagramKind::ConnectBack => SignalKind::ConnectBack,
            DatagramKind::Tunnel => SignalKind::Tunnel,
            _ => return None,
        };
        if datagram.len() != SIGNAL_LEN {
            return None;
        }
        let sender = u32::from_be_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]);
        let ip = Ipv4Addr::new(datagram[6], datagram[7], datagram[8], datagram[9]);
        let port = u16::from_be_bytes([datagram[10], datagram[11]]);
        Some(Self {
            kind,
            sender,
            reply_to: SocketAddrV4::new(ip, port),
            from,
        })
    }
}

/// Something the mux could not route to an existing stream.
pub enum UdpEvent {
    /// Traversal signal from a friend
    Signal(Signal),
    /// New stream opened by a remote SYN
    Incoming(UdpStream),
}

impl std::fmt::Debug for UdpEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UdpEvent::Signal(s) => f.debug_tuple("Signal").field(s).finish(),
            UdpEvent::Incoming(s) => f.debug_tuple("Incoming").field(&s.remote()).finish(),
        }
    }
}

/// Shared non-blocking UDP socket.
pub struct UdpMux {
    socket: Arc<UdpSocket>,
    routes: HashMap<SocketAddr, Weak<Mutex<Inbox>>>,
    recv_buf: Vec<u8>,
    accept_period: Duration,
}

impl UdpMux {
    /// Bind the shared socket. Accepted streams retransmit every `accept_period`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the address is unavailable.
    pub fn bind(addr: SocketAddr, accept_period: Duration) -> TransportResult<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(1024 * 1024)?;
        socket.set_send_buffer_size(1024 * 1024)?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;

        Ok(Self {
            socket: Arc::new(socket.into()),
            routes: HashMap::new(),
            recv_buf: vec![0u8; 65536],
            accept_period,
        })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Propagates the OS error.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// True when a live stream to `remote` exists
    #[must_use]
    pub fn has_stream(&self, remote: &SocketAddr) -> bool {
        self.routes.get(remote).is_some_and(|w| w.strong_count() > 0)
    }

    /// Open a stream to `remote`, sending the first SYN.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if a stream to that
    /// address already exists.
    pub fn connect(&mut self, remote: SocketAddr, period: Duration) -> TransportResult<UdpStream> {
        if self.has_stream(&remote) {
            return Err(TransportError::ConnectionFailed(format!(
                "UDP stream to {remote} already open"
            )));
        }
        let inbox = Arc::new(Mutex::new(Inbox::default()));
        self.routes.insert(remote, Arc::downgrade(&inbox));
        debug!("UDP connect to {}", remote);
        Ok(UdpStream::connect(Arc::clone(&self.socket), remote, inbox, period))
    }

    /// Send a traversal signal.
    ///
    /// # Errors
    ///
    /// Propagates socket errors other than would-block (a dropped signal is
    /// repeated by the next attempt).
    pub fn send_signal(
        &self,
        to: SocketAddr,
        kind: SignalKind,
        sender: u32,
        reply_to: SocketAddrV4,
    ) -> TransportResult<()> {
        let buf = Signal::encode(kind, sender, reply_to);
        match self.socket.send_to(&buf, to) {
            Ok(_) => {
                trace!("Sent {:?} signal to {}", kind, to);
                Ok(())
            }
            Err(e) if is_would_block(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drain the socket, routing stream datagrams and returning what is left.
    ///
    /// # Errors
    ///
    /// Returns an error only if the socket itself fails.
    pub fn poll(&mut self) -> TransportResult<Vec<UdpEvent>> {
        self.routes.retain(|_, inbox| inbox.strong_count() > 0);

        let mut events = Vec::new();
        for _ in 0..MAX_DATAGRAMS_PER_POLL {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(r) => r,
                Err(e) if is_would_block(&e) => break,
                // ICMP unreachable surfaces here on some platforms
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };
            let datagram = &self.recv_buf[..len];

            let Some(kind) = DatagramKind::parse(datagram) else {
                trace!("Dropping {} byte datagram from {}: bad header", len, from);
                continue;
            };

            match kind {
                DatagramKind::ConnectBack | DatagramKind::Tunnel => {
                    if let Some(signal) = Signal::decode(datagram, from) {
                        events.push(UdpEvent::Signal(signal));
                    }
                }
                _ => {
                    if let Some(inbox) = self.routes.get(&from).and_then(Weak::upgrade) {
                        Inbox::push(&inbox, datagram.to_vec());
                    } else if kind == DatagramKind::Syn {
                        let inbox = Arc::new(Mutex::new(Inbox::default()));
                        Inbox::push(&inbox, datagram.to_vec());
                        self.routes.insert(from, Arc::downgrade(&inbox));
                        debug!("Inbound UDP stream from {}", from);
                        events.push(UdpEvent::Incoming(UdpStream::accept(
                            Arc::clone(&self.socket),
                            from,
                            inbox,
                            self.accept_period,
                        )));
                    } else {
                        trace!("Dropping {:?} from {}: no stream", kind, from);
                    }
                }
            }
        }
        Ok(events)
    }
}
