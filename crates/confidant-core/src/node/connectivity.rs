//! Connectivity manager: decides when and how to reach each friend.
//!
//! Per peer the manager walks `Offline -> AttemptQueued -> InAttempt ->
//! Connected`. It never performs I/O: every tick it consumes
//! [`LinkEvent`]s reported by the aggregator and NAT helpers, and returns the
//! [`Command`]s the aggregator should carry out. Time is passed in, so the
//! whole policy can be driven by tests without sockets or sleeps.
//!
//! # Attempt order
//!
//! Candidates are tried one at a time: local TCP, external TCP, connect-back
//! (only when we are firewalled), then UDP. An address held by another
//! friend in the [`UsedAddressSet`] is skipped. The first network failure of
//! an offline period earns one quick retry of the same address (the
//! double-try); an authentication failure backs off long enough for the
//! friend list to deliver a new certificate.

use super::config::{ConnectivityConfig, MethodConfig, OwnAddresses};
use super::events::{Command, ConnectAddress, ConnectRequest, LinkEvent};
use super::method::{FailureKind, TransportKind};
use super::used_addresses::{AddressUse, UsedAddressSet};
use crate::framer::FramerStats;
use confidant_crypto::PeerId;
use confidant_transport::SignalKind;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the application sees of a friend's connectivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Not connected, nothing in progress
    Offline,
    /// Attempts queued or running
    Connecting,
    /// A connection is up
    Connected,
    /// Every candidate failed; waiting for new addresses or a retry
    Unreachable,
    /// Known friend without a certificate
    NoCertificate,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PeerStatus::Offline => "offline",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
            PeerStatus::Unreachable => "unreachable",
            PeerStatus::NoCertificate => "no certificate",
        })
    }
}

/// Manager-internal phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Nothing happening
    Offline,
    /// Candidates waiting to be tried
    AttemptQueued,
    /// One attempt is running
    InAttempt,
    /// Connected
    Connected,
}

/// Snapshot of one friend.
#[derive(Clone, Debug)]
pub struct PeerStatusSnapshot {
    /// Friend id
    pub id: PeerId,
    /// Display name
    pub name: String,
    /// Status
    pub status: PeerStatus,
    /// Phase
    pub phase: Phase,
    /// Last time anything arrived from the friend
    pub last_heard: Option<Instant>,
    /// Method carrying the friend, when connected
    pub connected_via: Option<TransportKind>,
    /// Known LAN address
    pub local: Option<SocketAddrV4>,
    /// Known external address
    pub external: Option<SocketAddrV4>,
    /// Traffic counters, filled in by the node
    pub traffic: FramerStats,
}

#[derive(Clone, Copy, Debug)]
struct InFlight {
    target: ConnectAddress,
    started: Instant,
    budget: Duration,
}

#[derive(Debug)]
struct PeerConnectState {
    name: String,
    is_self: bool,
    has_certificate: bool,
    status: PeerStatus,
    phase: Phase,
    local: Option<SocketAddrV4>,
    external: Option<SocketAddrV4>,
    last_heard: Option<Instant>,
    offline_since: Option<Instant>,
    queue: VecDeque<ConnectAddress>,
    in_flight: Option<InFlight>,
    retry_at: Option<Instant>,
    double_try: bool,
    triggered: bool,
    connected_via: Option<TransportKind>,
}

impl PeerConnectState {
    fn new(name: &str, has_certificate: bool, is_self: bool, now: Instant) -> Self {
        Self {
            name: name.to_string(),
            is_self,
            has_certificate,
            status: if has_certificate {
                PeerStatus::Offline
            } else {
                PeerStatus::NoCertificate
            },
            phase: Phase::Offline,
            local: None,
            external: None,
            last_heard: None,
            offline_since: Some(now),
            queue: VecDeque::new(),
            in_flight: None,
            retry_at: None,
            double_try: true,
            triggered: has_certificate && !is_self,
            connected_via: None,
        }
    }

    fn go_offline(&mut self, status: PeerStatus, now: Instant) {
        self.phase = Phase::Offline;
        self.status = status;
        self.queue.clear();
        self.in_flight = None;
        self.triggered = false;
        self.connected_via = None;
        self.offline_since = Some(now);
    }

    /// New addresses earn a fresh round of attempts.
    fn addresses_changed(&mut self) {
        self.double_try = true;
        if self.phase == Phase::Offline {
            self.triggered = true;
            self.retry_at = None;
        }
    }

    fn snapshot(&self, id: PeerId) -> PeerStatusSnapshot {
        PeerStatusSnapshot {
            id,
            name: self.name.clone(),
            status: self.status,
            phase: self.phase,
            last_heard: self.last_heard,
            connected_via: self.connected_via,
            local: self.local,
            external: self.external,
            traffic: FramerStats::default(),
        }
    }
}

struct ManagerState {
    peers: HashMap<PeerId, PeerConnectState>,
    own: OwnAddresses,
    firewalled: bool,
    pending: Vec<Command>,
}

/// Per-peer connection policy.
pub struct ConnectivityManager {
    own_id: PeerId,
    config: ConnectivityConfig,
    methods: MethodConfig,
    used: Arc<UsedAddressSet>,
    state: Mutex<ManagerState>,
}

impl ConnectivityManager {
    /// Manager for the node `own_id`.
    #[must_use]
    pub fn new(
        own_id: PeerId,
        config: ConnectivityConfig,
        methods: MethodConfig,
        used: Arc<UsedAddressSet>,
        now: Instant,
    ) -> Self {
        let mut peers = HashMap::new();
        peers.insert(own_id, PeerConnectState::new("self", true, true, now));
        let firewalled = config.firewalled;
        Self {
            own_id,
            config,
            methods,
            used,
            state: Mutex::new(ManagerState {
                peers,
                own: OwnAddresses::default(),
                firewalled,
                pending: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Our own id
    #[must_use]
    pub fn own_id(&self) -> PeerId {
        self.own_id
    }

    /// Add a friend, or update its name and certificate presence.
    pub fn add_peer(&self, id: PeerId, name: &str, has_certificate: bool, now: Instant) {
        let mut st = self.lock();
        match st.peers.get_mut(&id) {
            Some(p) if p.is_self => {}
            Some(p) => {
                p.name = name.to_string();
                if has_certificate && !p.has_certificate {
                    debug!("Peer {} now has a certificate", id);
                    p.has_certificate = true;
                    p.status = PeerStatus::Offline;
                    p.addresses_changed();
                } else if !has_certificate && p.has_certificate {
                    p.has_certificate = false;
                    p.status = PeerStatus::NoCertificate;
                }
            }
            None => {
                debug!("Tracking peer {} ({})", id, name);
                st.peers
                    .insert(id, PeerConnectState::new(name, has_certificate, false, now));
            }
        }
    }

    /// The friend's certificate changed: drop a connection made with the old one.
    pub fn certificate_changed(&self, id: PeerId, now: Instant) {
        let mut st = self.lock();
        let ManagerState { peers, pending, .. } = &mut *st;
        let Some(p) = peers.get_mut(&id) else {
            return;
        };
        if p.phase == Phase::Connected {
            info!("Certificate of peer {} changed, reconnecting", id);
            pending.push(Command::Teardown(id));
            self.used.release_peer(id);
            p.go_offline(PeerStatus::Offline, now);
        }
        p.addresses_changed();
    }

    /// Forget a friend's connectivity. The state is reset, not deleted.
    pub fn remove_peer(&self, id: PeerId, now: Instant) {
        let mut st = self.lock();
        let ManagerState { peers, pending, .. } = &mut *st;
        let Some(p) = peers.get_mut(&id).filter(|p| !p.is_self) else {
            return;
        };
        info!("Removing peer {}", id);
        pending.push(Command::Remove(id));
        self.used.release_peer(id);
        p.go_offline(PeerStatus::NoCertificate, now);
        p.has_certificate = false;
        p.retry_at = None;
        p.local = None;
        p.external = None;
    }

    /// Set the friend's LAN address. Returns false for unknown peers.
    pub fn set_local_address(&self, id: PeerId, addr: SocketAddrV4) -> bool {
        let mut st = self.lock();
        let Some(p) = st.peers.get_mut(&id) else {
            return false;
        };
        if p.local != Some(addr) {
            p.local = Some(addr);
            p.addresses_changed();
        }
        true
    }

    /// Set the friend's external address. Returns false for unknown peers.
    pub fn set_external_address(&self, id: PeerId, addr: SocketAddrV4) -> bool {
        let mut st = self.lock();
        let Some(p) = st.peers.get_mut(&id) else {
            return false;
        };
        if p.external != Some(addr) {
            p.external = Some(addr);
            p.addresses_changed();
        }
        true
    }

    /// Set our own addresses, announced to friends.
    pub fn set_own_addresses(&self, own: OwnAddresses) {
        let mut st = self.lock();
        if st.own != own {
            st.own = own;
            st.pending.push(Command::OwnAddresses(own));
        }
    }

    /// Our own addresses
    #[must_use]
    pub fn own_addresses(&self) -> OwnAddresses {
        self.lock().own
    }

    /// Ask for an attempt on the next tick if the friend is offline.
    pub fn trigger(&self, id: PeerId) -> bool {
        let mut st = self.lock();
        match st.peers.get_mut(&id) {
            Some(p) if !p.is_self && p.phase == Phase::Offline => {
                p.triggered = true;
                p.retry_at = None;
                true
            }
            _ => false,
        }
    }

    /// Status of one friend
    #[must_use]
    pub fn status(&self, id: PeerId) -> Option<PeerStatus> {
        self.lock().peers.get(&id).map(|p| p.status)
    }

    /// Snapshot of one friend
    #[must_use]
    pub fn snapshot(&self, id: PeerId) -> Option<PeerStatusSnapshot> {
        self.lock().peers.get(&id).map(|p| p.snapshot(id))
    }

    /// Snapshots of every friend, ordered by id
    #[must_use]
    pub fn snapshots(&self) -> Vec<PeerStatusSnapshot> {
        let st = self.lock();
        let mut all: Vec<_> = st
            .peers
            .iter()
            .filter(|(_, p)| !p.is_self)
            .map(|(id, p)| p.snapshot(*id))
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Run one round of the policy.
    pub fn tick<I>(&self, now: Instant, events: I) -> Vec<Command>
    where
        I: IntoIterator<Item = LinkEvent>,
    {
        let mut st = self.lock();
        let mut out = std::mem::take(&mut st.pending);
        for event in events {
            self.apply_event(&mut st, event, now, &mut out);
        }

        let (own, firewalled) = (st.own, st.firewalled);
        let ids: Vec<PeerId> = st.peers.keys().copied().collect();
        for id in ids {
            if let Some(p) = st.peers.get_mut(&id) {
                self.step(id, p, own, firewalled, now, &mut out);
            }
        }
        out
    }

    fn apply_event(&self, st: &mut ManagerState, event: LinkEvent, now: Instant, out: &mut Vec<Command>) {
        match event {
            LinkEvent::Connected { peer, kind, addr } => {
                let Some(p) = st.peers.get_mut(&peer).filter(|p| !p.is_self) else {
                    return;
                };
                if let Some(f) = p.in_flight.take() {
                    if Some(f.target.addr) != addr {
                        self.used.release(f.target.addr, peer);
                    }
                }
                self.used.release_connecting(peer);
                if let Some(a) = addr {
                    self.used.mark_connected(a, peer);
                }
                if p.phase != Phase::Connected {
                    info!("Peer {} connected over {}", peer, kind);
                }
                p.phase = Phase::Connected;
                p.status = PeerStatus::Connected;
                p.retry_at = None;
                p.double_try = true;
                p.triggered = false;
                p.queue.clear();
                p.last_heard = Some(now);
                p.offline_since = None;
                p.connected_via = Some(kind);
            }
            LinkEvent::AttemptFailed {
                peer,
                kind,
                addr,
                failure,
            } => {
                let Some(p) = st.peers.get_mut(&peer) else {
                    return;
                };
                let current = p
                    .in_flight
                    .is_some_and(|f| f.target.kind == kind && Some(f.target.addr) == addr);
                if current {
                    self.attempt_failed(peer, p, failure, now);
                } else if let Some(a) = addr {
                    if self.used.get(a) == Some((peer, AddressUse::Connecting)) {
                        self.used.release(a, peer);
                    }
                }
            }
            LinkEvent::Disconnected { peer, kind } => {
                let Some(p) = st.peers.get_mut(&peer) else {
                    return;
                };
                if p.phase == Phase::Connected {
                    info!("Peer {} disconnected ({})", peer, kind);
                    self.used.release_peer(peer);
                    p.go_offline(PeerStatus::Offline, now);
                    p.retry_at = Some(now + self.config.disconnect_retry_delay);
                }
            }
            LinkEvent::Heard(peer) => {
                if let Some(p) = st.peers.get_mut(&peer) {
                    p.last_heard = Some(now);
                }
            }
            LinkEvent::Signal {
                peer,
                kind,
                reply_to,
            } => self.apply_signal(st, peer, kind, reply_to),
            LinkEvent::PeerAddresses {
                peer,
                local,
                external,
            } => {
                let Some(p) = st.peers.get_mut(&peer).filter(|p| !p.is_self) else {
                    return;
                };
                let before = (p.local, p.external);
                p.local = local.or(p.local);
                p.external = external.or(p.external);
                if (p.local, p.external) != before {
                    debug!("Peer {} reported new addresses", peer);
                    p.addresses_changed();
                }
            }
            LinkEvent::OwnExternal(addr) => {
                if st.own.external != Some(addr) {
                    info!("External address is {}", addr);
                    st.own.external = Some(addr);
                    out.push(Command::OwnAddresses(st.own));
                }
            }
            LinkEvent::Firewalled(firewalled) => {
                if st.firewalled != firewalled {
                    debug!("Firewalled: {}", firewalled);
                    st.firewalled = firewalled;
                }
            }
        }
    }

    fn apply_signal(&self, st: &mut ManagerState, peer: PeerId, kind: SignalKind, reply_to: SocketAddrV4) {
        if peer == self.own_id {
            return;
        }
        let Some(p) = st.peers.get_mut(&peer) else {
            debug!("{:?} signal from unknown peer {}", kind, peer);
            return;
        };
        if !p.has_certificate || p.phase == Phase::Connected {
            return;
        }
        let target = match kind {
            SignalKind::ConnectBack => ConnectAddress {
                addr: reply_to,
                kind: TransportKind::for_tcp_source(*reply_to.ip()),
            },
            SignalKind::Tunnel => ConnectAddress {
                addr: reply_to,
                kind: TransportKind::Udp,
            },
        };
        if p.in_flight.is_some_and(|f| f.target == target) {
            return;
        }
        debug!("{:?} signal from peer {}: queueing {} to {}", kind, peer, target.kind, reply_to);
        p.queue.retain(|c| *c != target);
        p.queue.push_front(target);
        p.retry_at = None;
        p.triggered = false;
        if p.phase == Phase::Offline {
            p.phase = Phase::AttemptQueued;
            p.status = PeerStatus::Connecting;
        }
    }

    fn attempt_failed(&self, id: PeerId, p: &mut PeerConnectState, failure: FailureKind, now: Instant) {
        let Some(f) = p.in_flight.take() else {
            return;
        };
        self.used.release(f.target.addr, id);
        if p.phase == Phase::Connected {
            return;
        }
        match failure {
            FailureKind::Auth => {
                warn!(
                    "Peer {} failed authentication over {}, retrying in {:?}",
                    id, f.target.kind, self.config.auth_retry_delay
                );
                p.go_offline(PeerStatus::Offline, now);
                p.retry_at = Some(now + self.config.auth_retry_delay);
            }
            FailureKind::Network if p.double_try => {
                debug!("{} to peer {} failed, retrying once", f.target.kind, id);
                p.double_try = false;
                p.queue.push_front(f.target);
                p.phase = Phase::AttemptQueued;
                p.retry_at = Some(now + self.config.double_try_delay);
            }
            FailureKind::Network if !p.queue.is_empty() => {
                debug!("{} to peer {} failed, trying next candidate", f.target.kind, id);
                p.phase = Phase::AttemptQueued;
            }
            FailureKind::Network => {
                debug!("Peer {} unreachable", id);
                p.go_offline(PeerStatus::Unreachable, now);
            }
        }
    }

    fn step(
        &self,
        id: PeerId,
        p: &mut PeerConnectState,
        own: OwnAddresses,
        firewalled: bool,
        now: Instant,
        out: &mut Vec<Command>,
    ) {
        if p.is_self || !p.has_certificate {
            return;
        }

        if p.retry_at.is_some_and(|at| now >= at) {
            p.retry_at = None;
            if p.phase == Phase::Offline {
                p.triggered = true;
            }
        }

        if p.phase == Phase::Offline && !p.triggered && p.retry_at.is_none() {
            if let (Some(every), Some(since)) = (self.config.background_retry, p.offline_since) {
                if now.saturating_duration_since(since) >= every {
                    debug!("Background retry of peer {}", id);
                    p.triggered = true;
                }
            }
        }

        if p.phase == Phase::Connected {
            let silent = p
                .last_heard
                .is_none_or(|h| now.saturating_duration_since(h) > self.config.liveness_timeout);
            if silent {
                info!("Peer {} timed out", id);
                out.push(Command::Teardown(id));
                self.used.release_peer(id);
                p.go_offline(PeerStatus::Offline, now);
                p.retry_at = Some(now + self.config.disconnect_retry_delay);
            }
        }

        if p.phase == Phase::InAttempt {
            if let Some(f) = p.in_flight {
                if now.saturating_duration_since(f.started) > f.budget + self.config.attempt_grace {
                    debug!("{} attempt to peer {} overran, abandoning", f.target.kind, id);
                    out.push(Command::Cancel {
                        peer: id,
                        kind: f.target.kind,
                    });
                    self.attempt_failed(id, p, FailureKind::Network, now);
                }
            }
        }

        if p.phase == Phase::Offline && p.triggered {
            p.triggered = false;
            p.queue = self.candidates(id, p, own, firewalled);
            if p.queue.is_empty() {
                if p.status != PeerStatus::Unreachable {
                    debug!("No usable address for peer {}", id);
                }
                p.status = PeerStatus::Unreachable;
                p.offline_since = Some(now);
            } else {
                p.phase = Phase::AttemptQueued;
                p.status = PeerStatus::Connecting;
            }
        }

        let ready = p.retry_at.is_none_or(|at| now >= at);
        if p.phase == Phase::AttemptQueued && p.in_flight.is_none() && ready {
            p.retry_at = None;
            self.dispatch(id, p, own, now, out);
        }
    }

    fn candidates(
        &self,
        id: PeerId,
        p: &PeerConnectState,
        own: OwnAddresses,
        firewalled: bool,
    ) -> VecDeque<ConnectAddress> {
        let mut list = Vec::with_capacity(TransportKind::COUNT);
        if let Some(local) = p.local {
            list.push(ConnectAddress {
                addr: local,
                kind: TransportKind::LocalTcp,
            });
        }
        if let Some(external) = p.external {
            list.push(ConnectAddress {
                addr: external,
                kind: TransportKind::ExternalTcp,
            });
            if firewalled && own.external.is_some() {
                list.push(ConnectAddress {
                    addr: external,
                    kind: TransportKind::ConnectBack,
                });
            }
            list.push(ConnectAddress {
                addr: external,
                kind: TransportKind::Udp,
            });
        }
        list.into_iter()
            .filter(|c| {
                let taken = self.used.held_by_other(c.addr, id);
                if taken {
                    debug!("Skipping {} for peer {}: address belongs to another peer", c.addr, id);
                }
                !taken
            })
            .collect()
    }

    fn dispatch(&self, id: PeerId, p: &mut PeerConnectState, own: OwnAddresses, now: Instant, out: &mut Vec<Command>) {
        while let Some(target) = p.queue.pop_front() {
            if !self.used.try_claim(target.addr, id) {
                debug!("Skipping {} for peer {}: address belongs to another peer", target.addr, id);
                continue;
            }
            let params = self.methods.params(target.kind);
            let reply_to = match target.kind {
                TransportKind::ConnectBack | TransportKind::Udp => own.external,
                TransportKind::LocalTcp | TransportKind::ExternalTcp => None,
            };
            p.in_flight = Some(InFlight {
                target,
                started: now,
                // connect and handshake each get a full timeout
                budget: params.delay + params.timeout * 2,
            });
            p.phase = Phase::InAttempt;
            p.status = PeerStatus::Connecting;
            debug!("Attempting peer {} over {} at {}", id, target.kind, target.addr);
            out.push(Command::Attempt(ConnectRequest {
                peer: id,
                target,
                params,
                reply_to,
            }));
            return;
        }
        p.go_offline(PeerStatus::Unreachable, now);
    }
}
