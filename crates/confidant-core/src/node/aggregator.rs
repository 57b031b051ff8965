//! Bandwidth aggregator: the single owner of every socket.
//!
//! Each tick the aggregator executes the manager's commands, accepts inbound
//! TCP connections and UDP streams, finishes their handshakes, advances every
//! peer's transport methods, routes received items, and periodically
//! re-balances the per-peer rate caps against the node-wide totals.
//!
//! Nothing here blocks. The caller decides how long to sleep between ticks
//! based on the returned busy flag.

use super::balancer::{self, Demand};
use super::config::{BandwidthConfig, MethodConfig, NodeConfig, OwnAddresses};
use super::events::{Command, LinkEvent};
use super::method::{FailureKind, LinkContext, TransportKind};
use super::peer::PeerAggregate;
use crate::channel::SecureChannel;
use crate::framer::{FramerConfig, FramerStats, OutboundQueue, StreamFramer};
use crate::item::{AddressUpdate, ControlItem, HelloItem, Item, PROTOCOL_VERSION, RoutedItem, reason};
use crate::registry::Registry;
use confidant_crypto::{LocalIdentity, PeerId, PeerVerifier};
use confidant_transport::{ByteChannel, SignalKind, TcpAcceptor, UdpEvent, UdpMux};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use dashmap::DashMap;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Inbound connections accepted per tick
const MAX_ACCEPTS_PER_TICK: usize = 16;

/// Unauthenticated inbound handshakes held at once
const MAX_PENDING_INBOUND: usize = 64;

/// Ticks spent flushing goodbyes on shutdown
const SHUTDOWN_FLUSH_TICKS: usize = 4;

/// Events held back while the manager's channel is full. Past this the
/// oldest signals, then the oldest `Heard`, make room.
const MAX_EVENT_BACKLOG: usize = 4096;

/// Outbound queue of every friend, shared with the node's `send`.
pub(crate) type QueueMap = Arc<DashMap<PeerId, Arc<OutboundQueue>>>;

/// Traffic counters of every friend, published each tick.
pub(crate) type TrafficMap = Arc<DashMap<PeerId, FramerStats>>;

/// Everything the aggregator is built from.
pub(crate) struct AggregatorParts {
    pub identity: Arc<LocalIdentity>,
    pub verifier: Arc<dyn PeerVerifier>,
    pub registry: Arc<Registry>,
    pub acceptor: TcpAcceptor,
    pub udp: Option<UdpMux>,
    pub commands: Receiver<Command>,
    pub events: Sender<LinkEvent>,
    pub received: Sender<RoutedItem>,
    pub queues: QueueMap,
    pub traffic: TrafficMap,
}

struct PendingInbound {
    channel: SecureChannel,
    hint: TransportKind,
    started: Instant,
}

pub(crate) struct Aggregator {
    own_id: PeerId,
    identity: Arc<LocalIdentity>,
    verifier: Arc<dyn PeerVerifier>,
    registry: Arc<Registry>,
    framer_config: FramerConfig,
    methods: MethodConfig,
    bandwidth: BandwidthConfig,
    heartbeat_interval: Duration,
    balance_interval: Duration,
    last_balance: Instant,
    acceptor: TcpAcceptor,
    udp: Option<UdpMux>,
    peers: HashMap<PeerId, PeerAggregate>,
    pending: Vec<PendingInbound>,
    queues: QueueMap,
    traffic: TrafficMap,
    commands: Receiver<Command>,
    events: Sender<LinkEvent>,
    backlog: VecDeque<LinkEvent>,
    heard_backlogged: HashSet<PeerId>,
    received: Sender<RoutedItem>,
    own: OwnAddresses,
}

impl Aggregator {
    pub(crate) fn new(config: &NodeConfig, parts: AggregatorParts, now: Instant) -> Self {
        Self {
            own_id: parts.identity.id(),
            identity: parts.identity,
            verifier: parts.verifier,
            registry: parts.registry,
            framer_config: config.framer.clone(),
            methods: config.methods.clone(),
            bandwidth: config.bandwidth,
            heartbeat_interval: config.connectivity.heartbeat_interval,
            balance_interval: config.ticks.balance_interval,
            last_balance: now,
            acceptor: parts.acceptor,
            udp: parts.udp,
            peers: HashMap::new(),
            pending: Vec::new(),
            queues: parts.queues,
            traffic: parts.traffic,
            commands: parts.commands,
            events: parts.events,
            backlog: VecDeque::new(),
            heard_backlogged: HashSet::new(),
            received: parts.received,
            own: OwnAddresses::default(),
        }
    }

    /// Run one round. Returns true when more work is likely ready.
    pub(crate) fn tick(&mut self, now: Instant) -> bool {
        self.flush_events();
        let mut busy = self.drain_commands(now);
        busy |= self.accept_tcp(now);
        busy |= self.poll_udp(now);
        busy |= self.drive_inbound(now);
        busy |= self.tick_peers(now);

        for agg in self.peers.values_mut() {
            agg.heartbeat(self.heartbeat_interval, now);
        }
        if now.saturating_duration_since(self.last_balance) >= self.balance_interval {
            self.rebalance();
            self.last_balance = now;
        }
        for agg in self.peers.values() {
            self.traffic.insert(agg.peer(), agg.traffic());
        }
        busy || !self.backlog.is_empty()
    }

    /// Say goodbye to every connected peer and drop all connections.
    pub(crate) fn shutdown(&mut self, now: Instant) {
        let goodbye = Item::Control(ControlItem::Goodbye {
            reason: reason::SHUTDOWN,
        });
        for agg in self.peers.values().filter(|a| a.is_connected()) {
            if let Err(e) = agg.outbound().push(&goodbye) {
                debug!("Goodbye to peer {} not queued: {}", agg.peer(), e);
            }
        }
        for _ in 0..SHUTDOWN_FLUSH_TICKS {
            if !self.tick_peers(now) {
                break;
            }
        }
        for agg in self.peers.values_mut() {
            agg.teardown();
        }
        self.pending.clear();
        info!("Aggregator stopped");
    }

    fn emit(&mut self, event: LinkEvent) {
        if !self.backlog.is_empty() {
            self.backlog_push(event);
            return;
        }
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => self.backlog_push(event),
            Err(TrySendError::Disconnected(_)) => trace!("Event receiver gone"),
        }
    }

    fn backlog_push(&mut self, event: LinkEvent) {
        if let LinkEvent::Heard(peer) = event {
            if !self.heard_backlogged.insert(peer) {
                return;
            }
        }
        if self.backlog.len() >= MAX_EVENT_BACKLOG {
            let victim = self
                .backlog
                .iter()
                .position(|e| matches!(e, LinkEvent::Signal { .. }))
                .or_else(|| self.backlog.iter().position(|e| matches!(e, LinkEvent::Heard(_))));
            match victim.and_then(|i| self.backlog.remove(i)) {
                Some(dropped) => {
                    if let LinkEvent::Heard(peer) = dropped {
                        self.heard_backlogged.remove(&peer);
                    }
                    trace!("Event backlog full, dropped {:?}", dropped);
                }
                None if event.is_hint() => {
                    if let LinkEvent::Heard(peer) = event {
                        self.heard_backlogged.remove(&peer);
                    }
                    trace!("Event backlog full of state changes, dropped {:?}", event);
                    return;
                }
                None => {}
            }
        }
        self.backlog.push_back(event);
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            let heard = match event {
                LinkEvent::Heard(peer) => Some(peer),
                _ => None,
            };
            match self.events.try_send(event) {
                Ok(()) => {
                    if let Some(peer) = heard {
                        self.heard_backlogged.remove(&peer);
                    }
                }
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.backlog.clear();
                    self.heard_backlogged.clear();
                    break;
                }
            }
        }
    }

    /// The aggregate for `peer`, created on first use. `None` once the
    /// peer has been unfriended.
    fn aggregate(&mut self, peer: PeerId, now: Instant) -> Option<&mut PeerAggregate> {
        match self.peers.entry(peer) {
            Entry::Occupied(e) => Some(e.into_mut()),
            Entry::Vacant(e) => {
                let queue = self.queues.get(&peer).map(|q| Arc::clone(q.value()))?;
                let mut agg = PeerAggregate::new(peer, self.own_id, queue, now);
                agg.set_caps(self.bandwidth.per_peer_in, self.bandwidth.per_peer_out);
                Some(e.insert(agg))
            }
        }
    }

    fn drain_commands(&mut self, now: Instant) -> bool {
        let mut busy = false;
        while let Ok(command) = self.commands.try_recv() {
            busy = true;
            match command {
                Command::Attempt(req) => {
                    let kind = req.target.kind;
                    if let Some(agg) = self.aggregate(req.peer, now) {
                        agg.start(kind, req.target.addr, req.params, req.reply_to, now);
                    } else {
                        debug!("Attempt for unknown peer {}", req.peer);
                        self.emit(LinkEvent::AttemptFailed {
                            peer: req.peer,
                            kind,
                            addr: Some(req.target.addr),
                            failure: FailureKind::Network,
                        });
                    }
                }
                Command::Cancel { peer, kind } => {
                    if let Some(agg) = self.peers.get_mut(&peer) {
                        agg.cancel(kind);
                    }
                }
                Command::Teardown(peer) => {
                    if let Some(agg) = self.peers.get_mut(&peer) {
                        agg.teardown();
                    }
                }
                Command::Remove(peer) => {
                    if let Some(mut agg) = self.peers.remove(&peer) {
                        agg.remove();
                    }
                    self.traffic.remove(&peer);
                }
                Command::OwnAddresses(own) => self.announce(own),
            }
        }
        busy
    }

    fn announce(&mut self, own: OwnAddresses) {
        self.own = own;
        let update = Item::Control(ControlItem::AddressUpdate(AddressUpdate {
            local: own.local,
            external: own.external,
        }));
        for agg in self.peers.values().filter(|a| a.is_connected()) {
            if let Err(e) = agg.outbound().push(&update) {
                debug!("Address update for peer {} not queued: {}", agg.peer(), e);
            }
        }
    }

    fn accept_tcp(&mut self, now: Instant) -> bool {
        let mut busy = false;
        for _ in 0..MAX_ACCEPTS_PER_TICK {
            match self.acceptor.accept() {
                Ok(Some(stream)) => {
                    busy = true;
                    let hint = match stream.peer_addr() {
                        SocketAddr::V4(addr) => TransportKind::for_tcp_source(*addr.ip()),
                        SocketAddr::V6(_) => TransportKind::ExternalTcp,
                    };
                    self.begin_inbound(Box::new(stream), hint, now);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("TCP accept failed: {}", e);
                    break;
                }
            }
        }
        busy
    }

    fn poll_udp(&mut self, now: Instant) -> bool {
        let Some(udp) = self.udp.as_mut() else {
            return false;
        };
        let events = match udp.poll() {
            Ok(events) => events,
            Err(e) => {
                warn!("UDP socket failed: {}", e);
                return false;
            }
        };
        let busy = !events.is_empty();
        let mut signals = SignalBatch::default();
        for event in events {
            match event {
                UdpEvent::Signal(signal) => {
                    trace!(
                        "{:?} signal from {} claiming peer {}",
                        signal.kind, signal.from, signal.sender
                    );
                    signals.push(PeerId::new(signal.sender), signal.kind, signal.reply_to);
                }
                UdpEvent::Incoming(stream) => {
                    self.begin_inbound(Box::new(stream), TransportKind::Udp, now);
                }
            }
        }
        for event in signals.into_events() {
            self.emit(event);
        }
        busy
    }

    fn begin_inbound(&mut self, raw: Box<dyn ByteChannel>, hint: TransportKind, now: Instant) {
        let from = raw.peer_addr();
        if self.pending.len() >= MAX_PENDING_INBOUND {
            warn!("Too many pending handshakes, dropping {} connection from {}", hint, from);
            return;
        }
        match SecureChannel::start(raw, Arc::clone(&self.identity), Arc::clone(&self.verifier), None) {
            Ok(channel) => {
                debug!("Inbound {} connection from {}", hint, from);
                self.pending.push(PendingInbound {
                    channel,
                    hint,
                    started: now,
                });
            }
            Err(e) => warn!("Could not start handshake with {}: {}", from, e),
        }
    }

    fn drive_inbound(&mut self, now: Instant) -> bool {
        let mut busy = false;
        for mut inbound in std::mem::take(&mut self.pending) {
            match inbound.channel.drive(now) {
                Ok(Some(auth)) => {
                    busy = true;
                    self.adopt(inbound.channel, inbound.hint, auth.peer, now);
                }
                Ok(None) if now.saturating_duration_since(inbound.started) > self.methods.inbound_timeout => {
                    debug!("Inbound handshake from {} timed out", inbound.channel.peer_addr());
                }
                Ok(None) => self.pending.push(inbound),
                Err(e) => {
                    debug!("Inbound handshake from {} failed: {}", inbound.channel.peer_addr(), e);
                }
            }
        }
        busy
    }

    fn adopt(&mut self, channel: SecureChannel, hint: TransportKind, peer: PeerId, now: Instant) {
        if peer == self.own_id {
            debug!("Dropping connection from our own identity");
            return;
        }
        let registry = Arc::clone(&self.registry);
        let config = self.framer_config.clone();
        let Some(agg) = self.aggregate(peer, now) else {
            debug!("Authenticated peer {} is no longer a friend", peer);
            return;
        };
        let framer = StreamFramer::new(
            peer,
            Box::new(channel),
            registry,
            Arc::clone(agg.outbound()),
            config,
            now,
        );
        if let Some(event) = agg.accept(hint, framer, now) {
            self.greet(peer);
            self.emit(event);
        }
    }

    /// Queue `Hello` and our addresses on a fresh connection.
    fn greet(&self, peer: PeerId) {
        let Some(agg) = self.peers.get(&peer) else {
            return;
        };
        let hello = Item::Control(ControlItem::Hello(HelloItem {
            protocol_version: PROTOCOL_VERSION,
            client_version: Some(format!("confidant {}", env!("CARGO_PKG_VERSION"))),
            display_name: None,
        }));
        let addresses = Item::Control(ControlItem::AddressUpdate(AddressUpdate {
            local: self.own.local,
            external: self.own.external,
        }));
        for item in [hello, addresses] {
            if let Err(e) = agg.outbound().push(&item) {
                debug!("Greeting for peer {} not queued: {}", peer, e);
            }
        }
    }

    fn tick_peers(&mut self, now: Instant) -> bool {
        let mut ctx = LinkContext {
            identity: &self.identity,
            verifier: &self.verifier,
            registry: &self.registry,
            framer: &self.framer_config,
            udp: self.udp.as_mut(),
            own_id: self.own_id,
        };
        let mut results = Vec::with_capacity(self.peers.len());
        for agg in self.peers.values_mut() {
            results.push((agg.peer(), agg.tick(&mut ctx, now)));
        }

        let mut busy = false;
        for (peer, tick) in results {
            busy |= tick.busy;
            for event in tick.events {
                if matches!(event, LinkEvent::Connected { .. }) {
                    self.greet(peer);
                }
                self.emit(event);
            }
            self.route(peer, tick.items);
        }
        busy
    }

    fn route(&mut self, peer: PeerId, items: Vec<RoutedItem>) {
        if items.is_empty() {
            return;
        }
        for routed in items {
            if routed.item.is_control() {
                self.handle_control(peer, routed.item);
            } else if self.received.send(routed).is_err() {
                trace!("Receiver gone, dropping item from peer {}", peer);
            }
        }
        self.emit(LinkEvent::Heard(peer));
    }

    fn handle_control(&mut self, peer: PeerId, item: Item) {
        let Item::Control(control) = item else {
            return;
        };
        match control {
            ControlItem::Heartbeat => trace!("Heartbeat from peer {}", peer),
            ControlItem::Hello(hello) => debug!(
                "Peer {} speaks protocol {} ({})",
                peer,
                hello.protocol_version,
                hello.client_version.as_deref().unwrap_or("unknown client")
            ),
            ControlItem::AddressUpdate(update) => self.emit(LinkEvent::PeerAddresses {
                peer,
                local: update.local,
                external: update.external,
            }),
            ControlItem::Goodbye { reason } => {
                info!("Peer {} said goodbye (reason {})", peer, reason);
                let Some(agg) = self.peers.get_mut(&peer) else {
                    return;
                };
                let active = agg.active();
                agg.teardown();
                if let Some(kind) = active {
                    self.emit(LinkEvent::Disconnected { peer, kind });
                }
            }
        }
    }

    fn rebalance(&mut self) {
        let bw = self.bandwidth;
        if bw.total_in == 0 && bw.total_out == 0 {
            return;
        }
        let mut connected: Vec<&mut PeerAggregate> =
            self.peers.values_mut().filter(|a| a.is_connected()).collect();
        if connected.is_empty() {
            return;
        }

        let demands = |pick: fn(&PeerAggregate) -> (u64, f64), individual: u64| -> Vec<Demand> {
            connected
                .iter()
                .map(|agg| {
                    let (current, observed) = pick(agg);
                    Demand {
                        current,
                        observed,
                        individual,
                    }
                })
                .collect()
        };
        let inbound = balancer::balance(
            bw.total_in,
            &demands(|a| (a.caps().0, a.rates().0), bw.per_peer_in),
        );
        let outbound = balancer::balance(
            bw.total_out,
            &demands(|a| (a.caps().1, a.rates().1), bw.per_peer_out),
        );

        for (agg, (cap_in, cap_out)) in connected.iter_mut().zip(inbound.into_iter().zip(outbound)) {
            trace!("Peer {} caps: in {} B/s, out {} B/s", agg.peer(), cap_in, cap_out);
            agg.set_caps(cap_in, cap_out);
        }
    }
}

/// Traversal signals of one poll, one per claimed sender and kind. The
/// latest reply address wins.
#[derive(Default)]
struct SignalBatch {
    order: Vec<(PeerId, SignalKind)>,
    latest: HashMap<(PeerId, SignalKind), SocketAddrV4>,
}

impl SignalBatch {
    fn push(&mut self, peer: PeerId, kind: SignalKind, reply_to: SocketAddrV4) {
        if self.latest.insert((peer, kind), reply_to).is_none() {
            self.order.push((peer, kind));
        }
    }

    fn into_events(self) -> impl Iterator<Item = LinkEvent> {
        let Self { order, latest } = self;
        order.into_iter().filter_map(move |(peer, kind)| {
            latest
                .get(&(peer, kind))
                .map(|&reply_to| LinkEvent::Signal { peer, kind, reply_to })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::{Party, befriend, party};
    use crate::node::config::MethodParams;
    use crate::node::events::{ConnectAddress, ConnectRequest};
    use std::net::SocketAddrV4;

    struct Harness {
        agg: Aggregator,
        commands: Sender<Command>,
        events: Receiver<LinkEvent>,
        received: Receiver<RoutedItem>,
        queues: QueueMap,
        addr: SocketAddrV4,
    }

    fn harness(me: &Party, friends: &[PeerId]) -> Harness {
        let config = NodeConfig::default();
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let SocketAddr::V4(addr) = acceptor.local_addr().unwrap() else {
            panic!("expected IPv4");
        };
        let mut registry = Registry::default();
        registry.register_service(7);

        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(16);
        let (ev_tx, ev_rx) = crossbeam_channel::bounded(64);
        let (rx_tx, rx_rx) = crossbeam_channel::unbounded();
        let queues: QueueMap = Arc::new(DashMap::new());
        for &friend in friends {
            queues.insert(friend, Arc::new(OutboundQueue::new(1 << 20)));
        }

        let parts = AggregatorParts {
            identity: Arc::clone(&me.identity),
            verifier: me.trust.clone(),
            registry: Arc::new(registry),
            acceptor,
            udp: None,
            commands: cmd_rx,
            events: ev_tx,
            received: rx_tx,
            queues: Arc::clone(&queues),
            traffic: Arc::new(DashMap::new()),
        };
        Harness {
            agg: Aggregator::new(&config, parts, Instant::now()),
            commands: cmd_tx,
            events: ev_rx,
            received: rx_rx,
            queues,
            addr,
        }
    }

    fn run_until(nodes: &mut [&mut Harness], mut done: impl FnMut(&[&mut Harness]) -> bool) {
        for _ in 0..1000 {
            let now = Instant::now();
            for h in nodes.iter_mut() {
                h.agg.tick(now);
            }
            if done(nodes) {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    /// Ask `h` to connect to `peer` over local TCP right away.
    fn attempt(h: &Harness, peer: PeerId, addr: SocketAddrV4) {
        h.commands
            .send(Command::Attempt(ConnectRequest {
                peer,
                target: ConnectAddress {
                    addr,
                    kind: TransportKind::LocalTcp,
                },
                params: MethodParams {
                    delay: Duration::ZERO,
                    period: Duration::from_millis(100),
                    timeout: Duration::from_secs(5),
                },
                reply_to: None,
            }))
            .unwrap();
    }

    fn queue(h: &Harness, peer: PeerId) -> Arc<OutboundQueue> {
        Arc::clone(h.queues.get(&peer).unwrap().value())
    }

    #[test]
    fn test_loopback_connect_and_deliver() {
        let pa = party(1);
        let pb = party(2);
        befriend(&pa, &pb);
        let mut a = harness(&pa, &[PeerId::new(2)]);
        let mut b = harness(&pb, &[PeerId::new(1)]);

        attempt(&a, PeerId::new(2), b.addr);

        let mut a_events = Vec::new();
        let mut b_events = Vec::new();
        run_until(&mut [&mut a, &mut b], |h| {
            a_events.extend(h[0].events.try_iter());
            b_events.extend(h[1].events.try_iter());
            let up = |events: &[LinkEvent]| events.iter().any(|e| matches!(e, LinkEvent::Connected { .. }));
            up(&a_events) && up(&b_events)
        });
        assert!(a_events.contains(&LinkEvent::Connected {
            peer: PeerId::new(2),
            kind: TransportKind::LocalTcp,
            addr: Some(b.addr),
        }));

        queue(&a, PeerId::new(2)).push(&Item::service(7, 1, b"hello".to_vec())).unwrap();

        let mut got = None;
        run_until(&mut [&mut a, &mut b], |h| {
            got = got.take().or_else(|| h[1].received.try_recv().ok());
            got.is_some()
        });
        let routed = got.unwrap();
        assert_eq!(routed.peer, PeerId::new(1));
        assert_eq!(routed.item, Item::service(7, 1, b"hello".to_vec()));
    }

    #[test]
    fn test_attempt_for_unknown_peer_fails() {
        let pa = party(1);
        let mut a = harness(&pa, &[PeerId::new(2)]);
        let target: SocketAddrV4 = "127.0.0.1:9".parse().unwrap();
        a.commands
            .send(Command::Attempt(ConnectRequest {
                peer: PeerId::new(5),
                target: ConnectAddress {
                    addr: target,
                    kind: TransportKind::LocalTcp,
                },
                params: MethodConfig::default().local_tcp,
                reply_to: None,
            }))
            .unwrap();
        a.agg.tick(Instant::now());
        assert_eq!(
            a.events.try_recv().unwrap(),
            LinkEvent::AttemptFailed {
                peer: PeerId::new(5),
                kind: TransportKind::LocalTcp,
                addr: Some(target),
                failure: FailureKind::Network,
            }
        );
    }

    #[test]
    fn test_events_backlogged_when_full() {
        let pa = party(1);
        let mut a = harness(&pa, &[PeerId::new(2)]);
        for i in 0..100 {
            a.agg.emit(LinkEvent::Heard(PeerId::new(i)));
        }
        assert_eq!(a.agg.backlog.len(), 36);

        let first: Vec<_> = a.events.try_iter().collect();
        assert_eq!(first.len(), 64);
        a.agg.flush_events();
        let rest: Vec<_> = a.events.try_iter().collect();
        assert_eq!(rest.len(), 36);
        assert_eq!(rest[0], LinkEvent::Heard(PeerId::new(64)));
    }

    #[test]
    fn test_oversized_header_drops_only_that_peer() {
        let pa = party(1);
        let pb = party(2);
        let pc = party(3);
        befriend(&pa, &pb);
        befriend(&pa, &pc);
        let (bob, carol) = (PeerId::new(2), PeerId::new(3));
        let mut a = harness(&pa, &[bob, carol]);
        let mut b = harness(&pb, &[PeerId::new(1)]);
        let mut c = harness(&pc, &[PeerId::new(1)]);

        attempt(&a, bob, b.addr);
        attempt(&a, carol, c.addr);
        let mut a_events = Vec::new();
        run_until(&mut [&mut a, &mut b, &mut c], |h| {
            a_events.extend(h[0].events.try_iter());
            [bob, carol].iter().all(|&p| {
                a_events
                    .iter()
                    .any(|e| matches!(e, LinkEvent::Connected { peer, .. } if *peer == p))
            })
        });

        // bob's established stream announces a packet of u32::MAX bytes
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&0x0200_4200u32.to_be_bytes());
        header[4..].copy_from_slice(&u32::MAX.to_be_bytes());
        queue(&b, PeerId::new(1)).push_raw(header.to_vec());

        run_until(&mut [&mut a, &mut b, &mut c], |h| {
            a_events.extend(h[0].events.try_iter());
            a_events
                .iter()
                .any(|e| matches!(e, LinkEvent::Disconnected { peer, .. } if *peer == bob))
        });
        assert!(!a.agg.peers[&bob].is_connected());
        assert!(a.agg.peers[&carol].is_connected());

        // carol keeps exchanging items both ways
        queue(&c, PeerId::new(1)).push(&Item::service(7, 1, b"from carol".to_vec())).unwrap();
        queue(&a, carol).push(&Item::service(7, 2, b"to carol".to_vec())).unwrap();
        let mut at_a = None;
        let mut at_c = None;
        run_until(&mut [&mut a, &mut b, &mut c], |h| {
            at_a = at_a.take().or_else(|| h[0].received.try_recv().ok());
            at_c = at_c.take().or_else(|| h[2].received.try_recv().ok());
            at_a.is_some() && at_c.is_some()
        });
        let at_a = at_a.unwrap();
        assert_eq!(at_a.peer, carol);
        assert_eq!(at_a.item, Item::service(7, 1, b"from carol".to_vec()));
        assert_eq!(at_c.unwrap().item, Item::service(7, 2, b"to carol".to_vec()));

        a_events.extend(a.events.try_iter());
        assert!(
            !a_events
                .iter()
                .any(|e| matches!(e, LinkEvent::Disconnected { peer, .. } if *peer == carol))
        );
    }

    #[test]
    fn test_heard_merged_while_backlogged() {
        let pa = party(1);
        let mut a = harness(&pa, &[PeerId::new(2)]);
        for i in 0..64 {
            a.agg.emit(LinkEvent::Heard(PeerId::new(1000 + i)));
        }
        for _ in 0..10 {
            a.agg.emit(LinkEvent::Heard(PeerId::new(2)));
        }
        assert_eq!(a.agg.backlog.len(), 1);

        assert_eq!(a.events.try_iter().count(), 64);
        a.agg.flush_events();
        assert_eq!(a.events.try_recv().unwrap(), LinkEvent::Heard(PeerId::new(2)));
        assert!(a.agg.heard_backlogged.is_empty());

        // heard again after delivery is a new event
        a.agg.emit(LinkEvent::Heard(PeerId::new(2)));
        assert_eq!(a.events.try_recv().unwrap(), LinkEvent::Heard(PeerId::new(2)));
    }

    #[test]
    fn test_backlog_cap_drops_oldest_signals() {
        let pa = party(1);
        let mut a = harness(&pa, &[PeerId::new(2)]);
        for i in 0..64 {
            a.agg.emit(LinkEvent::Heard(PeerId::new(1000 + i)));
        }
        let lost = LinkEvent::Disconnected {
            peer: PeerId::new(2),
            kind: TransportKind::LocalTcp,
        };
        a.agg.emit(lost.clone());

        let reply: SocketAddrV4 = "198.51.100.7:7812".parse().unwrap();
        let flood = u32::try_from(MAX_EVENT_BACKLOG).unwrap();
        for i in 0..flood {
            a.agg.emit(LinkEvent::Signal {
                peer: PeerId::new(5000 + i),
                kind: SignalKind::ConnectBack,
                reply_to: reply,
            });
        }
        assert_eq!(a.agg.backlog.len(), MAX_EVENT_BACKLOG);
        assert_eq!(a.agg.backlog[0], lost);
        assert!(matches!(
            a.agg.backlog[1],
            LinkEvent::Signal { peer, .. } if peer == PeerId::new(5001)
        ));
    }

    #[test]
    fn test_signals_merged_per_sender_and_kind() {
        let first: SocketAddrV4 = "198.51.100.7:7812".parse().unwrap();
        let second: SocketAddrV4 = "198.51.100.7:7813".parse().unwrap();
        let mut batch = SignalBatch::default();
        for _ in 0..500 {
            batch.push(PeerId::new(9), SignalKind::ConnectBack, first);
        }
        batch.push(PeerId::new(4), SignalKind::Tunnel, first);
        batch.push(PeerId::new(9), SignalKind::ConnectBack, second);
        batch.push(PeerId::new(9), SignalKind::Tunnel, first);

        let events: Vec<_> = batch.into_events().collect();
        assert_eq!(
            events,
            vec![
                LinkEvent::Signal {
                    peer: PeerId::new(9),
                    kind: SignalKind::ConnectBack,
                    reply_to: second,
                },
                LinkEvent::Signal {
                    peer: PeerId::new(4),
                    kind: SignalKind::Tunnel,
                    reply_to: first,
                },
                LinkEvent::Signal {
                    peer: PeerId::new(9),
                    kind: SignalKind::Tunnel,
                    reply_to: first,
                },
            ]
        );
    }
}
