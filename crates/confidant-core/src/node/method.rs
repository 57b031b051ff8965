//! Transport methods: one non-blocking connect state machine per transport kind.
//!
//! ```text
//! Idle -> Waiting -> SocketConnecting -> HandshakeInProgress -> Authorizing -> Active
//!            \              \                    \                  \
//!             +--------------+--------------------+------------------+--> Failed
//! ```
//!
//! Every transition re-arms the method's timeout. A method never blocks:
//! each [`TransportMethod::tick`] moves it as far as the sockets allow.

use super::config::MethodParams;
use crate::channel::{Channel, SecureChannel};
use crate::framer::{FramerConfig, FramerStats, OutboundQueue, StreamFramer};
use crate::item::RoutedItem;
use crate::registry::Registry;
use confidant_crypto::{LocalIdentity, PeerId, PeerVerifier};
use confidant_transport::{ByteChannel, SignalKind, TcpConnector, UdpMux, UdpStream};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// How a connection to a friend is made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    /// TCP to the friend's LAN address
    LocalTcp = 0,
    /// TCP to the friend's external address
    ExternalTcp = 1,
    /// Ask the friend to open TCP to us
    ConnectBack = 2,
    /// Reliable UDP through a punched hole
    Udp = 3,
}

impl TransportKind {
    /// Number of kinds
    pub const COUNT: usize = 4;

    /// Every kind, in attempt order
    pub const ALL: [TransportKind; Self::COUNT] = [
        TransportKind::LocalTcp,
        TransportKind::ExternalTcp,
        TransportKind::ConnectBack,
        TransportKind::Udp,
    ];

    /// Slot in a per-peer method table
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Kind of a TCP connection that arrived from `ip`.
    #[must_use]
    pub fn for_tcp_source(ip: Ipv4Addr) -> Self {
        if ip.is_private() || ip.is_loopback() || ip.is_link_local() {
            TransportKind::LocalTcp
        } else {
            TransportKind::ExternalTcp
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::LocalTcp => "local TCP",
            TransportKind::ExternalTcp => "external TCP",
            TransportKind::ConnectBack => "connect-back",
            TransportKind::Udp => "UDP",
        })
    }
}

/// Why an attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Unreachable, refused, timed out or dropped
    Network,
    /// The peer could not prove it holds a trusted certificate
    Auth,
}

/// Externally visible method state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodState {
    /// Not in use
    Idle,
    /// Holding off for the initial delay
    Waiting,
    /// Socket connect or UDP SYN exchange in progress
    SocketConnecting,
    /// Secure handshake started, peer certificate not yet seen
    HandshakeInProgress,
    /// Peer certificate accepted, waiting for its signature
    Authorizing,
    /// Carrying the peer's framer
    Active,
    /// Gave up
    Failed(FailureKind),
}

/// What a tick changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodEvent {
    /// Handshake completed, framer installed
    Established,
    /// Attempt or connection ended
    Failed(FailureKind),
}

/// Result of ticking one method.
#[derive(Debug, Default)]
pub struct MethodTick {
    /// Items decoded from the active framer
    pub items: Vec<RoutedItem>,
    /// State change, if any
    pub event: Option<MethodEvent>,
    /// More I/O is likely ready
    pub busy: bool,
}

/// Shared resources a method needs while it runs.
pub struct LinkContext<'a> {
    /// Our identity
    pub identity: &'a Arc<LocalIdentity>,
    /// Certificate check for the handshake
    pub verifier: &'a Arc<dyn PeerVerifier>,
    /// Packet decoders
    pub registry: &'a Arc<Registry>,
    /// Framer tuning
    pub framer: &'a FramerConfig,
    /// Shared UDP socket, if bound
    pub udp: Option<&'a mut UdpMux>,
    /// Our id, carried in signals
    pub own_id: PeerId,
}

enum Stage {
    Idle,
    Waiting { until: Instant },
    TcpConnecting(TcpConnector),
    UdpConnecting(UdpStream),
    AwaitingConnectBack { last_signal: Instant, reply_to: SocketAddrV4 },
    Handshaking(Box<SecureChannel>),
    Active(Box<StreamFramer>),
    Failed(FailureKind),
}

/// One transport method for one peer.
pub struct TransportMethod {
    kind: TransportKind,
    stage: Stage,
    params: Option<MethodParams>,
    target: Option<SocketAddrV4>,
    reply_to: Option<SocketAddrV4>,
    initiated_locally: bool,
    entered: Instant,
    closed_stats: FramerStats,
}

impl TransportMethod {
    /// Idle method of `kind`
    #[must_use]
    pub fn new(kind: TransportKind, now: Instant) -> Self {
        Self {
            kind,
            stage: Stage::Idle,
            params: None,
            target: None,
            reply_to: None,
            initiated_locally: false,
            entered: now,
            closed_stats: FramerStats::default(),
        }
    }

    /// Transport kind
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Address being attempted, for outbound attempts
    #[must_use]
    pub fn target(&self) -> Option<SocketAddrV4> {
        self.target
    }

    /// True if this side opened the connection
    #[must_use]
    pub fn initiated_locally(&self) -> bool {
        self.initiated_locally
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> MethodState {
        match &self.stage {
            Stage::Idle => MethodState::Idle,
            Stage::Waiting { .. } => MethodState::Waiting,
            Stage::TcpConnecting(_) | Stage::UdpConnecting(_) | Stage::AwaitingConnectBack { .. } => {
                MethodState::SocketConnecting
            }
            Stage::Handshaking(ch) if ch.hello_received() => MethodState::Authorizing,
            Stage::Handshaking(_) => MethodState::HandshakeInProgress,
            Stage::Active(_) => MethodState::Active,
            Stage::Failed(f) => MethodState::Failed(*f),
        }
    }

    /// True between `start` and the end of the handshake
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(
            self.stage,
            Stage::Waiting { .. }
                | Stage::TcpConnecting(_)
                | Stage::UdpConnecting(_)
                | Stage::AwaitingConnectBack { .. }
                | Stage::Handshaking(_)
        )
    }

    /// True while waiting for the friend to connect back to us
    #[must_use]
    pub fn awaiting_connect_back(&self) -> bool {
        matches!(self.stage, Stage::AwaitingConnectBack { .. })
    }

    /// True while carrying a framer
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.stage, Stage::Active(_))
    }

    /// Counters of every connection this method has carried
    #[must_use]
    pub fn traffic(&self) -> FramerStats {
        let mut total = self.closed_stats;
        if let Some(framer) = self.framer() {
            total += framer.stats();
        }
        total
    }

    /// The framer, when active
    #[must_use]
    pub fn framer(&self) -> Option<&StreamFramer> {
        match &self.stage {
            Stage::Active(f) => Some(f),
            _ => None,
        }
    }

    /// The framer, when active
    pub fn framer_mut(&mut self) -> Option<&mut StreamFramer> {
        match &mut self.stage {
            Stage::Active(f) => Some(f),
            _ => None,
        }
    }

    fn enter(&mut self, stage: Stage, now: Instant) {
        self.stage = stage;
        self.entered = now;
    }

    /// Begin an outbound attempt at `target`, abandoning whatever was running.
    ///
    /// `reply_to` is our own reachable address, carried in traversal signals.
    pub fn start(
        &mut self,
        target: SocketAddrV4,
        params: MethodParams,
        reply_to: Option<SocketAddrV4>,
        now: Instant,
    ) {
        self.reset();
        debug!("Starting {} attempt to {}", self.kind, target);
        self.target = Some(target);
        self.params = Some(params);
        self.reply_to = reply_to;
        self.initiated_locally = true;
        self.enter(Stage::Waiting { until: now + params.delay }, now);
    }

    /// Install a connection the peer opened and we have authenticated.
    pub fn accept(&mut self, framer: StreamFramer, now: Instant) {
        self.reset();
        self.initiated_locally = false;
        self.enter(Stage::Active(Box::new(framer)), now);
    }

    /// Close everything and return to idle.
    pub fn reset(&mut self) {
        self.close_stage();
        self.stage = Stage::Idle;
        self.target = None;
        self.params = None;
    }

    fn close_stage(&mut self) {
        match &mut self.stage {
            Stage::Active(framer) => {
                framer.close();
                self.closed_stats += framer.stats();
            }
            Stage::Handshaking(channel) => channel.close(),
            _ => {}
        }
    }

    fn fail(&mut self, failure: FailureKind, now: Instant) -> Option<MethodEvent> {
        self.close_stage();
        self.enter(Stage::Failed(failure), now);
        Some(MethodEvent::Failed(failure))
    }

    fn timed_out(&self, now: Instant) -> bool {
        self.params
            .is_some_and(|p| now.saturating_duration_since(self.entered) > p.timeout)
    }

    /// Advance the method.
    pub fn tick(
        &mut self,
        ctx: &mut LinkContext<'_>,
        peer: PeerId,
        outbound: &Arc<OutboundQueue>,
        now: Instant,
    ) -> MethodTick {
        let mut tick = MethodTick::default();
        match &mut self.stage {
            Stage::Idle | Stage::Failed(_) => {}
            Stage::Waiting { until } => {
                if now >= *until {
                    tick.event = self.begin_connect(ctx, peer, now);
                }
            }
            Stage::TcpConnecting(connector) => match connector.poll_connected() {
                Ok(Some(channel)) => {
                    trace!("TCP connected to {}", connector.remote());
                    tick.event = self.begin_handshake(Box::new(channel), ctx, peer, now);
                }
                Ok(None) if self.timed_out(now) => {
                    debug!("{} connect to peer {} timed out", self.kind, peer);
                    tick.event = self.fail(FailureKind::Network, now);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("{} connect to peer {} failed: {}", self.kind, peer, e);
                    tick.event = self.fail(FailureKind::Network, now);
                }
            },
            Stage::UdpConnecting(stream) => {
                if let Err(e) = stream.poll(now) {
                    debug!("UDP connect to peer {} failed: {}", peer, e);
                    tick.event = self.fail(FailureKind::Network, now);
                } else if stream.is_established() {
                    let Stage::UdpConnecting(stream) = std::mem::replace(&mut self.stage, Stage::Idle)
                    else {
                        return tick;
                    };
                    tick.event = self.begin_handshake(Box::new(stream), ctx, peer, now);
                } else if self.timed_out(now) {
                    debug!("UDP connect to peer {} timed out", peer);
                    tick.event = self.fail(FailureKind::Network, now);
                }
            }
            Stage::AwaitingConnectBack { last_signal, reply_to } => {
                let (last, reply) = (*last_signal, *reply_to);
                if self.timed_out(now) {
                    debug!("Peer {} never connected back", peer);
                    tick.event = self.fail(FailureKind::Network, now);
                } else if self.params.is_some_and(|p| now.saturating_duration_since(last) >= p.period) {
                    self.send_signal(ctx, SignalKind::ConnectBack, reply);
                    if let Stage::AwaitingConnectBack { last_signal, .. } = &mut self.stage {
                        *last_signal = now;
                    }
                }
            }
            Stage::Handshaking(channel) => match channel.drive(now) {
                Ok(Some(auth)) if auth.peer == peer => {
                    debug!("{} handshake with peer {} complete", self.kind, peer);
                    let Stage::Handshaking(channel) = std::mem::replace(&mut self.stage, Stage::Idle)
                    else {
                        return tick;
                    };
                    let framer = StreamFramer::new(
                        peer,
                        channel,
                        Arc::clone(ctx.registry),
                        Arc::clone(outbound),
                        ctx.framer.clone(),
                        now,
                    );
                    self.enter(Stage::Active(Box::new(framer)), now);
                    tick.event = Some(MethodEvent::Established);
                    tick.busy = true;
                }
                Ok(Some(auth)) => {
                    warn!("Expected peer {} but {} answered", peer, auth.peer);
                    tick.event = self.fail(FailureKind::Auth, now);
                }
                Ok(None) if self.timed_out(now) => {
                    debug!("{} handshake with peer {} timed out", self.kind, peer);
                    tick.event = self.fail(FailureKind::Network, now);
                }
                Ok(None) => {}
                Err(e) => {
                    let failure = if e.is_authentication_failure() {
                        warn!("Peer {} failed authentication: {}", peer, e);
                        FailureKind::Auth
                    } else {
                        debug!("{} handshake with peer {} failed: {}", self.kind, peer, e);
                        FailureKind::Network
                    };
                    tick.event = self.fail(failure, now);
                }
            },
            Stage::Active(framer) => match framer.tick(now) {
                Ok(items) if framer.is_active() => {
                    tick.busy = !items.is_empty() || framer.has_pending_io();
                    tick.items = items;
                }
                Ok(items) => {
                    tick.items = items;
                    debug!("{} connection to peer {} closed", self.kind, peer);
                    tick.event = self.fail(FailureKind::Network, now);
                }
                Err(e) => {
                    debug!("{} connection to peer {} dropped: {}", self.kind, peer, e);
                    tick.event = self.fail(FailureKind::Network, now);
                }
            },
        }
        tick
    }

    fn begin_connect(
        &mut self,
        ctx: &mut LinkContext<'_>,
        peer: PeerId,
        now: Instant,
    ) -> Option<MethodEvent> {
        let Some(target) = self.target else {
            return self.fail(FailureKind::Network, now);
        };
        match self.kind {
            TransportKind::LocalTcp | TransportKind::ExternalTcp => {
                match TcpConnector::start(SocketAddr::V4(target)) {
                    Ok(connector) => {
                        self.enter(Stage::TcpConnecting(connector), now);
                        None
                    }
                    Err(e) => {
                        debug!("{} connect to {} failed: {}", self.kind, target, e);
                        self.fail(FailureKind::Network, now)
                    }
                }
            }
            TransportKind::Udp => {
                let period = self.params.map(|p| p.period).unwrap_or_default();
                if let Some(reply_to) = self.reply_to {
                    self.send_signal(ctx, SignalKind::Tunnel, reply_to);
                }
                let Some(udp) = ctx.udp.as_deref_mut() else {
                    return self.fail(FailureKind::Network, now);
                };
                match udp.connect(SocketAddr::V4(target), period) {
                    Ok(stream) => {
                        self.enter(Stage::UdpConnecting(stream), now);
                        None
                    }
                    Err(e) => {
                        debug!("UDP attempt to peer {} rejected: {}", peer, e);
                        self.fail(FailureKind::Network, now)
                    }
                }
            }
            TransportKind::ConnectBack => {
                let Some(reply_to) = self.reply_to else {
                    debug!("No external address to offer peer {} for connect-back", peer);
                    return self.fail(FailureKind::Network, now);
                };
                self.send_signal(ctx, SignalKind::ConnectBack, reply_to);
                self.enter(
                    Stage::AwaitingConnectBack {
                        last_signal: now,
                        reply_to,
                    },
                    now,
                );
                None
            }
        }
    }

    fn begin_handshake(
        &mut self,
        raw: Box<dyn ByteChannel>,
        ctx: &LinkContext<'_>,
        peer: PeerId,
        now: Instant,
    ) -> Option<MethodEvent> {
        match SecureChannel::start(
            raw,
            Arc::clone(ctx.identity),
            Arc::clone(ctx.verifier),
            Some(peer),
        ) {
            Ok(channel) => {
                self.enter(Stage::Handshaking(Box::new(channel)), now);
                None
            }
            Err(e) => {
                debug!("Could not start handshake with peer {}: {}", peer, e);
                self.fail(FailureKind::Network, now)
            }
        }
    }

    fn send_signal(&self, ctx: &LinkContext<'_>, kind: SignalKind, reply_to: SocketAddrV4) {
        let (Some(target), Some(udp)) = (self.target, ctx.udp.as_deref()) else {
            return;
        };
        if let Err(e) = udp.send_signal(SocketAddr::V4(target), kind, ctx.own_id.get(), reply_to) {
            debug!("{:?} signal to {} failed: {}", kind, target, e);
        }
    }
}

impl fmt::Debug for TransportMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportMethod")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::{befriend, party};
    use confidant_transport::TcpAcceptor;
    use std::time::Duration;

    fn params(timeout_ms: u64) -> MethodParams {
        MethodParams {
            delay: Duration::ZERO,
            period: Duration::from_millis(50),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_kind_table() {
        for (i, kind) in TransportKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(
            TransportKind::for_tcp_source(Ipv4Addr::new(192, 168, 1, 4)),
            TransportKind::LocalTcp
        );
        assert_eq!(
            TransportKind::for_tcp_source(Ipv4Addr::new(8, 8, 8, 8)),
            TransportKind::ExternalTcp
        );
    }

    #[test]
    fn test_waits_for_initial_delay() {
        let a = party(1);
        let registry = Arc::new(Registry::default());
        let verifier: Arc<dyn PeerVerifier> = a.trust.clone();
        let framer = FramerConfig::default();
        let mut ctx = LinkContext {
            identity: &a.identity,
            verifier: &verifier,
            registry: &registry,
            framer: &framer,
            udp: None,
            own_id: PeerId::new(1),
        };
        let outbound = Arc::new(OutboundQueue::new(1 << 20));

        let start = Instant::now();
        let mut method = TransportMethod::new(TransportKind::LocalTcp, start);
        let mut p = params(1000);
        p.delay = Duration::from_secs(5);
        method.start("127.0.0.1:9".parse().unwrap(), p, None, start);
        assert_eq!(method.state(), MethodState::Waiting);

        let tick = method.tick(&mut ctx, PeerId::new(2), &outbound, start + Duration::from_secs(1));
        assert!(tick.event.is_none());
        assert_eq!(method.state(), MethodState::Waiting);
    }

    #[test]
    fn test_connect_back_needs_reply_address() {
        let a = party(1);
        let registry = Arc::new(Registry::default());
        let verifier: Arc<dyn PeerVerifier> = a.trust.clone();
        let framer = FramerConfig::default();
        let mut ctx = LinkContext {
            identity: &a.identity,
            verifier: &verifier,
            registry: &registry,
            framer: &framer,
            udp: None,
            own_id: PeerId::new(1),
        };
        let outbound = Arc::new(OutboundQueue::new(1 << 20));
        let now = Instant::now();
        let mut method = TransportMethod::new(TransportKind::ConnectBack, now);
        method.start("127.0.0.1:9".parse().unwrap(), params(1000), None, now);
        let tick = method.tick(&mut ctx, PeerId::new(2), &outbound, now);
        assert_eq!(tick.event, Some(MethodEvent::Failed(FailureKind::Network)));
        assert_eq!(method.state(), MethodState::Failed(FailureKind::Network));
    }

    #[test]
    fn test_unanswered_handshake_times_out() {
        // A listener that accepts but never speaks
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let SocketAddr::V4(target) = acceptor.local_addr().unwrap() else {
            panic!("expected IPv4");
        };

        let a = party(1);
        let registry = Arc::new(Registry::default());
        let verifier: Arc<dyn PeerVerifier> = a.trust.clone();
        let framer = FramerConfig::default();
        let mut ctx = LinkContext {
            identity: &a.identity,
            verifier: &verifier,
            registry: &registry,
            framer: &framer,
            udp: None,
            own_id: PeerId::new(1),
        };
        let outbound = Arc::new(OutboundQueue::new(1 << 20));
        let start = Instant::now();
        let mut method = TransportMethod::new(TransportKind::LocalTcp, start);
        method.start(target, params(200), None, start);

        let mut accepted = None;
        let mut event = None;
        for i in 0..200u64 {
            if accepted.is_none() {
                accepted = acceptor.accept().unwrap();
            }
            let now = start + Duration::from_millis(5 * i);
            if let Some(e) = method.tick(&mut ctx, PeerId::new(2), &outbound, now).event {
                event = Some(e);
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(event, Some(MethodEvent::Failed(FailureKind::Network)));
    }

    #[test]
    fn test_tcp_attempt_becomes_active() {
        let a = party(1);
        let b = party(2);
        befriend(&a, &b);

        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let SocketAddr::V4(target) = acceptor.local_addr().unwrap() else {
            panic!("expected IPv4");
        };

        let registry = Arc::new(Registry::default());
        let a_verifier: Arc<dyn PeerVerifier> = a.trust.clone();
        let b_verifier: Arc<dyn PeerVerifier> = b.trust.clone();
        let framer = FramerConfig::default();
        let mut ctx = LinkContext {
            identity: &a.identity,
            verifier: &a_verifier,
            registry: &registry,
            framer: &framer,
            udp: None,
            own_id: PeerId::new(1),
        };
        let outbound = Arc::new(OutboundQueue::new(1 << 20));
        let start = Instant::now();
        let mut method = TransportMethod::new(TransportKind::LocalTcp, start);
        method.start(target, params(5000), None, start);

        let mut server: Option<SecureChannel> = None;
        let mut established = false;
        for _ in 0..500 {
            let now = Instant::now();
            if server.is_none() {
                if let Some(ch) = acceptor.accept().unwrap() {
                    server = Some(
                        SecureChannel::start(
                            Box::new(ch),
                            Arc::clone(&b.identity),
                            Arc::clone(&b_verifier),
                            None,
                        )
                        .unwrap(),
                    );
                }
            }
            if let Some(s) = server.as_mut() {
                s.drive(now).unwrap();
            }
            let tick = method.tick(&mut ctx, PeerId::new(2), &outbound, now);
            if tick.event == Some(MethodEvent::Established) {
                established = true;
                break;
            }
            assert!(tick.event.is_none(), "unexpected {:?}", tick.event);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(established);
        assert_eq!(method.state(), MethodState::Active);
        assert!(method.initiated_locally());
        method.reset();
        assert_eq!(method.state(), MethodState::Idle);
        assert!(!method.is_active());
    }
}
