//! Per-peer aggregate: the fixed table of transport methods for one friend.
//!
//! At most one method is active and carries the peer's framer. An
//! authenticated inbound connection always replaces attempts still in
//! progress. When a second connection is established while one is active,
//! both ends keep the same one: the connection opened by the lower peer id
//! wins, and between two connections opened by the same side the newer one
//! wins.

use super::config::MethodParams;
use super::events::LinkEvent;
use super::method::{
    FailureKind, LinkContext, MethodEvent, MethodState, TransportKind, TransportMethod,
};
use crate::framer::{FramerStats, OutboundQueue, StreamFramer};
use crate::item::{ControlItem, Item, RoutedItem};
use confidant_crypto::PeerId;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of ticking one peer.
#[derive(Debug, Default)]
pub struct PeerTick {
    /// Items received
    pub items: Vec<RoutedItem>,
    /// Connectivity changes for the manager
    pub events: Vec<LinkEvent>,
    /// I/O is likely ready on the next tick
    pub busy: bool,
}

/// Every transport method of one friend.
pub struct PeerAggregate {
    peer: PeerId,
    own_id: PeerId,
    methods: [TransportMethod; TransportKind::COUNT],
    active: Option<TransportKind>,
    outbound: Arc<OutboundQueue>,
    caps: (u64, u64),
    last_heartbeat: Option<Instant>,
}

impl PeerAggregate {
    /// Aggregate for `peer` feeding from `outbound`.
    #[must_use]
    pub fn new(peer: PeerId, own_id: PeerId, outbound: Arc<OutboundQueue>, now: Instant) -> Self {
        Self {
            peer,
            own_id,
            methods: TransportKind::ALL.map(|kind| TransportMethod::new(kind, now)),
            active: None,
            outbound,
            caps: (0, 0),
            last_heartbeat: None,
        }
    }

    /// Friend id
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Kind of the active method
    #[must_use]
    pub fn active(&self) -> Option<TransportKind> {
        self.active
    }

    /// True while a connection is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    /// State of the method of `kind`
    #[must_use]
    pub fn method_state(&self, kind: TransportKind) -> MethodState {
        self.methods[kind.index()].state()
    }

    /// Outbound queue
    #[must_use]
    pub fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }

    /// Counters summed over every connection so far
    #[must_use]
    pub fn traffic(&self) -> FramerStats {
        let mut total = FramerStats::default();
        for method in &self.methods {
            total += method.traffic();
        }
        total
    }

    fn active_framer(&self) -> Option<&StreamFramer> {
        self.active.and_then(|k| self.methods[k.index()].framer())
    }

    /// Smoothed (inbound, outbound) rates of the active connection
    #[must_use]
    pub fn rates(&self) -> (f64, f64) {
        self.active_framer().map_or((0.0, 0.0), StreamFramer::rates)
    }

    /// Caps last applied, (inbound, outbound)
    #[must_use]
    pub fn caps(&self) -> (u64, u64) {
        self.caps
    }

    /// Apply rate caps to the active connection and remember them for the next.
    pub fn set_caps(&mut self, inbound: u64, outbound: u64) {
        self.caps = (inbound, outbound);
        if let Some(kind) = self.active {
            if let Some(framer) = self.methods[kind.index()].framer_mut() {
                framer.set_caps(inbound, outbound);
            }
        }
    }

    /// Begin an outbound attempt.
    pub fn start(
        &mut self,
        kind: TransportKind,
        target: SocketAddrV4,
        params: MethodParams,
        reply_to: Option<SocketAddrV4>,
        now: Instant,
    ) {
        if self.active == Some(kind) {
            warn!("Attempt for peer {} over its active {} connection", self.peer, kind);
            self.active = None;
        }
        self.methods[kind.index()].start(target, params, reply_to, now);
    }

    /// Reset the method of `kind` unless it is carrying the peer.
    pub fn cancel(&mut self, kind: TransportKind) {
        if self.active != Some(kind) {
            self.methods[kind.index()].reset();
        }
    }

    /// Drop every connection and attempt.
    pub fn teardown(&mut self) {
        for method in &mut self.methods {
            method.reset();
        }
        self.active = None;
        self.last_heartbeat = None;
    }

    /// Drop everything including queued items.
    pub fn remove(&mut self) {
        self.teardown();
        let discarded = self.outbound.clear();
        if discarded > 0 {
            debug!("Discarded {} queued items for peer {}", discarded, self.peer);
        }
    }

    /// Between two established connections, should the one opened by the
    /// peer (`new_ours == false`) or by us replace `existing`?
    fn prefer_new(&self, existing: &TransportMethod, new_ours: bool) -> bool {
        let old_ours = existing.initiated_locally();
        if old_ours == new_ours {
            return true;
        }
        let we_are_lower = self.own_id < self.peer;
        new_ours == we_are_lower
    }

    /// Offer an authenticated connection the peer opened.
    ///
    /// Any attempt pending on the same method is dropped in its favour.
    /// Returns `None` if it lost to an established connection.
    pub fn accept(&mut self, hint: TransportKind, framer: StreamFramer, now: Instant) -> Option<LinkEvent> {
        let kind = if self.methods[TransportKind::ConnectBack.index()].awaiting_connect_back() {
            TransportKind::ConnectBack
        } else {
            hint
        };

        if let Some(active) = self.active {
            if !self.prefer_new(&self.methods[active.index()], false) {
                debug!("Keeping {} connection to peer {}, dropping inbound", active, self.peer);
                return None;
            }
        }

        if self.methods[kind.index()].is_connecting() {
            debug!("Inbound connection from peer {} replaces pending {} attempt", self.peer, kind);
        }
        self.methods[kind.index()].accept(framer, now);
        Some(self.activate(kind, None))
    }

    fn activate(&mut self, kind: TransportKind, addr: Option<SocketAddrV4>) -> LinkEvent {
        if let Some(old) = self.active.filter(|&old| old != kind) {
            warn!(
                "Peer {} connected over {} while {} was active, replacing",
                self.peer, kind, old
            );
            self.methods[old.index()].reset();
        }
        self.active = Some(kind);
        self.last_heartbeat = None;
        let (inbound, outbound) = self.caps;
        if let Some(framer) = self.methods[kind.index()].framer_mut() {
            framer.set_caps(inbound, outbound);
        }
        LinkEvent::Connected {
            peer: self.peer,
            kind,
            addr,
        }
    }

    /// Queue a heartbeat if the interval has passed.
    pub fn heartbeat(&mut self, interval: Duration, now: Instant) {
        if self.active.is_none() {
            return;
        }
        let due = self
            .last_heartbeat
            .is_none_or(|last| now.saturating_duration_since(last) >= interval);
        if due {
            if let Err(e) = self.outbound.push(&Item::Control(ControlItem::Heartbeat)) {
                debug!("Heartbeat for peer {} not queued: {}", self.peer, e);
            }
            self.last_heartbeat = Some(now);
        }
    }

    /// Advance every method.
    pub fn tick(&mut self, ctx: &mut LinkContext<'_>, now: Instant) -> PeerTick {
        let mut out = PeerTick::default();
        for kind in TransportKind::ALL {
            let method = &mut self.methods[kind.index()];
            let target = method.target();
            let tick = method.tick(ctx, self.peer, &self.outbound, now);
            out.items.extend(tick.items);
            out.busy |= tick.busy;

            match tick.event {
                None => {}
                Some(MethodEvent::Established) => {
                    let current = self.active.filter(|&a| a != kind);
                    let keep = current
                        .is_none_or(|a| self.prefer_new(&self.methods[a.index()], true));
                    if keep {
                        out.events.push(self.activate(kind, target));
                    } else {
                        debug!("Dropping duplicate {} connection to peer {}", kind, self.peer);
                        self.methods[kind.index()].reset();
                        // the manager still holds this attempt's address
                        out.events.push(LinkEvent::AttemptFailed {
                            peer: self.peer,
                            kind,
                            addr: target,
                            failure: FailureKind::Network,
                        });
                    }
                }
                Some(MethodEvent::Failed(failure)) => {
                    if self.active == Some(kind) {
                        self.active = None;
                        out.events.push(LinkEvent::Disconnected {
                            peer: self.peer,
                            kind,
                        });
                    } else if self.active.is_some() {
                        debug!("{} attempt to connected peer {} failed", kind, self.peer);
                    } else {
                        out.events.push(LinkEvent::AttemptFailed {
                            peer: self.peer,
                            kind,
                            addr: target,
                            failure,
                        });
                    }
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for PeerAggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerAggregate")
            .field("peer", &self.peer)
            .field("active", &self.active)
            .field("methods", &self.methods)
            .finish()
    }
}
