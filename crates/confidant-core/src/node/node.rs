//! Node implementation - the friend-to-friend link orchestrator
//!
//! The Node is the primary entry point for Confidant applications. It owns
//! the connectivity manager and the aggregator, runs each on its own task,
//! and exposes a thread-safe API to upper-layer services and to whoever keeps
//! the friend list in sync.
//!
//! # Example
//!
//! ```no_run
//! use confidant_core::node::{Node, NodeConfig};
//! use confidant_core::{Item, Registry};
//! use confidant_crypto::{LocalIdentity, PeerId, TrustStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let identity = Arc::new(LocalIdentity::generate(PeerId::new(1))?);
//!     let trust = Arc::new(TrustStore::new());
//!     let node = Node::new(NodeConfig::default(), identity, trust, Registry::default())?;
//!     node.start().await?;
//!
//!     node.send(PeerId::new(2), Item::service(7, 1, b"hello".to_vec()))?;
//!     while let Some(routed) = node.poll_received() {
//!         println!("{} sent {:?}", routed.peer, routed.item);
//!     }
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```

use crate::framer::{FramerStats, OutboundQueue, QueueError};
use crate::item::{Item, RoutedItem};
use crate::node::aggregator::{Aggregator, AggregatorParts, QueueMap, TrafficMap};
use crate::node::assist::{AssistReporter, NatAssist};
use crate::node::config::{NodeConfig, OwnAddresses, TickConfig};
use crate::node::connectivity::{ConnectivityManager, PeerStatus, PeerStatusSnapshot};
use crate::node::error::{NodeError, Result};
use crate::node::events::{Command, LinkEvent};
use crate::node::used_addresses::UsedAddressSet;
use crate::registry::Registry;
use confidant_crypto::{LocalIdentity, PeerId, PeerVerifier, TrustStore, TrustUpdate};
use confidant_transport::{TcpAcceptor, UdpMux};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// State the background tasks own while running and hand back on stop.
struct Parked {
    aggregator: Aggregator,
    events: Receiver<LinkEvent>,
    commands: Sender<Command>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    connectivity: JoinHandle<(Receiver<LinkEvent>, Sender<Command>)>,
    aggregator: JoinHandle<Aggregator>,
}

/// Node inner state
pub(crate) struct NodeInner {
    /// Node identity
    pub(crate) identity: Arc<LocalIdentity>,
    /// Node configuration
    pub(crate) config: NodeConfig,
    /// Friend certificates
    pub(crate) trust: Arc<TrustStore>,
    /// Per-peer connection policy
    pub(crate) manager: Arc<ConnectivityManager>,
    /// Addresses claimed by attempts and connections
    pub(crate) used: Arc<UsedAddressSet>,
    /// Outbound queue per friend
    pub(crate) queues: QueueMap,
    /// Traffic counters per friend
    pub(crate) traffic: TrafficMap,
    /// Service items received from friends
    pub(crate) received: Receiver<RoutedItem>,
    /// Entry point for NAT helpers
    pub(crate) reporter: AssistReporter,
    /// Registered NAT helpers
    pub(crate) assists: Mutex<Vec<Box<dyn NatAssist>>>,
    /// Bound TCP address
    pub(crate) local_addr: SocketAddr,
    /// Node running state
    pub(crate) running: AtomicBool,
    parked: Mutex<Option<Parked>>,
    tasks: tokio::sync::Mutex<Option<Running>>,
}

/// Confidant Node
///
/// Keeps one authenticated link to every reachable friend and moves typed
/// items over it. Cloning is cheap; all clones drive the same node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Build a node and bind its sockets. Nothing runs until [`Node::start`].
    ///
    /// Every peer already in `trust` becomes a friend. `registry` decides
    /// which service items are decoded and delivered.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] for unusable timing values and
    /// [`NodeError::TransportInit`] if the TCP listener cannot be bound.
    pub fn new(
        config: NodeConfig,
        identity: Arc<LocalIdentity>,
        trust: Arc<TrustStore>,
        registry: Registry,
    ) -> Result<Self> {
        config.validate()?;

        let acceptor = TcpAcceptor::bind(config.listen_addr)?;
        let local_addr = acceptor.local_addr()?;
        // UDP shares the TCP port so one forwarded port serves both
        let udp = match UdpMux::bind(local_addr, config.methods.udp.period) {
            Ok(udp) => Some(udp),
            Err(e) => {
                tracing::warn!("UDP unavailable on {}: {}", local_addr, e);
                None
            }
        };

        let now = Instant::now();
        let own_id = identity.id();
        let used = Arc::new(UsedAddressSet::new());
        let manager = Arc::new(ConnectivityManager::new(
            own_id,
            config.connectivity.clone(),
            config.methods.clone(),
            Arc::clone(&used),
            now,
        ));
        manager.set_own_addresses(OwnAddresses {
            local: lan_address(local_addr),
            external: None,
        });

        let capacity = config.connectivity.event_capacity;
        let (event_tx, event_rx) = crossbeam_channel::bounded(capacity);
        let (command_tx, command_rx) = crossbeam_channel::bounded(capacity);
        let (received_tx, received_rx) = crossbeam_channel::unbounded();

        let queues: QueueMap = Arc::new(DashMap::new());
        let traffic: TrafficMap = Arc::new(DashMap::new());
        for peer in trust.peers() {
            if peer.id == own_id {
                continue;
            }
            queues.insert(peer.id, Arc::new(OutboundQueue::new(config.framer.max_queued_bytes)));
            manager.add_peer(peer.id, &peer.name, !peer.is_pending(), now);
        }

        let verifier: Arc<dyn PeerVerifier> = trust.clone();
        let aggregator = Aggregator::new(
            &config,
            AggregatorParts {
                identity: Arc::clone(&identity),
                verifier,
                registry: Arc::new(registry),
                acceptor,
                udp,
                commands: command_rx,
                events: event_tx.clone(),
                received: received_tx,
                queues: Arc::clone(&queues),
                traffic: Arc::clone(&traffic),
            },
            now,
        );

        let inner = NodeInner {
            identity,
            config,
            trust,
            manager,
            used,
            queues,
            traffic,
            received: received_rx,
            reporter: AssistReporter::new(event_tx),
            assists: Mutex::new(Vec::new()),
            local_addr,
            running: AtomicBool::new(false),
            parked: Mutex::new(Some(Parked {
                aggregator,
                events: event_rx,
                commands: command_tx,
            })),
            tasks: tokio::sync::Mutex::new(None),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

/// Our LAN address, when the listener is bound to a specific IPv4 address.
fn lan_address(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Some(v4),
        _ => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Identity Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Our peer id
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.inner.identity.id()
    }

    /// Our identity
    #[must_use]
    pub fn identity(&self) -> &Arc<LocalIdentity> {
        &self.inner.identity
    }

    /// The trust store this node verifies against
    #[must_use]
    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.inner.trust
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Address the TCP listener (and the UDP socket) is bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start the connectivity and aggregator tasks.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] if the node is already running.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("Node already running"));
        }

        let parked = self
            .inner
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Parked {
            aggregator,
            events,
            commands,
        }) = parked
        else {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(NodeError::invalid_state("Node background state was lost"));
        };

        tracing::info!("Starting node {} on {}", self.id(), self.inner.local_addr);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let connectivity = tokio::spawn(connectivity_loop(
            Arc::clone(&self.inner),
            events,
            commands,
            shutdown_rx.clone(),
        ));
        let aggregator = tokio::spawn(aggregator_loop(
            aggregator,
            self.inner.config.ticks.clone(),
            shutdown_rx,
        ));
        *self.inner.tasks.lock().await = Some(Running {
            shutdown,
            connectivity,
            aggregator,
        });

        tracing::info!("Node {} started", self.id());
        Ok(())
    }

    /// Stop both tasks, saying goodbye to connected friends.
    ///
    /// A stopped node can be started again.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] if the node is not running and
    /// [`NodeError::TaskJoin`] if a task panicked.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("Node not running"));
        }

        let Some(running) = self.inner.tasks.lock().await.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);

        let aggregator = running
            .aggregator
            .await
            .map_err(|e| NodeError::TaskJoin(e.to_string().into()))?;
        let (events, commands) = running
            .connectivity
            .await
            .map_err(|e| NodeError::TaskJoin(e.to_string().into()))?;
        *self
            .inner
            .parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Parked {
            aggregator,
            events,
            commands,
        });

        tracing::info!("Node {} stopped", self.id());
        Ok(())
    }

    /// Check if node is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

async fn connectivity_loop(
    inner: Arc<NodeInner>,
    events: Receiver<LinkEvent>,
    commands: Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) -> (Receiver<LinkEvent>, Sender<Command>) {
    let mut interval = tokio::time::interval(inner.config.connectivity.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backlog: VecDeque<Command> = VecDeque::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        let now = Instant::now();
        {
            let mut assists = inner.assists.lock().unwrap_or_else(PoisonError::into_inner);
            for assist in assists.iter_mut() {
                assist.poll(now, &inner.reporter);
            }
        }

        let batch: Vec<LinkEvent> = events.try_iter().collect();
        backlog.extend(inner.manager.tick(now, batch));
        while let Some(command) = backlog.pop_front() {
            match commands.try_send(command) {
                Ok(()) => {}
                Err(TrySendError::Full(command)) => {
                    tracing::debug!("Command queue full, {} commands deferred", backlog.len() + 1);
                    backlog.push_front(command);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    backlog.clear();
                    break;
                }
            }
        }
    }
    (events, commands)
}

async fn aggregator_loop(
    mut aggregator: Aggregator,
    ticks: TickConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Aggregator {
    let mut pause = ticks.min;
    loop {
        let busy = aggregator.tick(Instant::now());
        pause = if busy {
            ticks.min
        } else {
            (pause * 2).min(ticks.max)
        };
        tokio::select! {
            () = tokio::time::sleep(pause) => {}
            _ = shutdown.changed() => break,
        }
    }
    aggregator.shutdown(Instant::now());
    aggregator
}

// ═══════════════════════════════════════════════════════════════════════════
// Item Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Queue `item` for `peer`. Delivered once the friend is connected.
    ///
    /// # Errors
    ///
    /// - [`NodeError::SelfAddressed`] for our own id
    /// - [`NodeError::PeerNotFound`] if `peer` is not a friend
    /// - [`NodeError::QueueFull`] if the friend's queue is at its byte limit
    /// - [`NodeError::Encode`] if the item cannot be encoded
    pub fn send(&self, peer: PeerId, item: Item) -> Result<()> {
        if peer == self.id() {
            return Err(NodeError::SelfAddressed(peer));
        }
        let queue = self
            .inner
            .queues
            .get(&peer)
            .map(|q| Arc::clone(q.value()))
            .ok_or(NodeError::PeerNotFound(peer))?;
        queue.push(&item).map_err(|e| match e {
            QueueError::Full => NodeError::QueueFull(peer),
            QueueError::Encode(e) => NodeError::Encode(e.to_string().into()),
        })
    }

    /// Next received service item, if any.
    #[must_use]
    pub fn poll_received(&self) -> Option<RoutedItem> {
        self.inner.received.try_recv().ok()
    }

    /// A receiver for blocking consumers. Items go to whichever receiver
    /// takes them first.
    #[must_use]
    pub fn receiver(&self) -> Receiver<RoutedItem> {
        self.inner.received.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Friend Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    fn ensure_queue(&self, id: PeerId) {
        self.inner
            .queues
            .entry(id)
            .or_insert_with(|| Arc::new(OutboundQueue::new(self.inner.config.framer.max_queued_bytes)));
    }

    /// Trust `cert_der` as the certificate of friend `id`.
    ///
    /// A changed certificate drops any connection made with the old one.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SelfAddressed`] for our own id and
    /// [`NodeError::CertificateRejected`] if the certificate is malformed,
    /// names another peer, or is already held by another friend.
    pub fn add_or_update_friend(&self, id: PeerId, cert_der: &[u8], name: &str) -> Result<TrustUpdate> {
        if id == self.id() {
            return Err(NodeError::SelfAddressed(id));
        }
        let update = self.inner.trust.add_or_update_peer(cert_der, id, Some(name));
        let now = Instant::now();
        match update {
            TrustUpdate::Rejected => return Err(NodeError::CertificateRejected(id)),
            TrustUpdate::Added | TrustUpdate::Unchanged => {
                self.ensure_queue(id);
                self.inner.manager.add_peer(id, name, true, now);
            }
            TrustUpdate::Updated => {
                self.ensure_queue(id);
                self.inner.manager.add_peer(id, name, true, now);
                self.inner.manager.certificate_changed(id, now);
            }
        }
        Ok(update)
    }

    /// Add a friend whose certificate has not arrived yet. Items may be
    /// queued for it; no connection is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::SelfAddressed`] for our own id.
    pub fn add_pending_friend(&self, id: PeerId, name: &str) -> Result<()> {
        if id == self.id() {
            return Err(NodeError::SelfAddressed(id));
        }
        self.inner.trust.add_pending(id, name);
        self.ensure_queue(id);
        let has_certificate = self.inner.trust.fingerprint_for(id).is_some();
        self.inner.manager.add_peer(id, name, has_certificate, Instant::now());
        Ok(())
    }

    /// Set the LAN address of friend `id`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] if `id` is not a friend.
    pub fn set_local_address(&self, id: PeerId, ip: Ipv4Addr, port: u16) -> Result<()> {
        if self.inner.manager.set_local_address(id, SocketAddrV4::new(ip, port)) {
            Ok(())
        } else {
            Err(NodeError::PeerNotFound(id))
        }
    }

    /// Set the external address of friend `id`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] if `id` is not a friend.
    pub fn set_external_address(&self, id: PeerId, ip: Ipv4Addr, port: u16) -> Result<()> {
        if self.inner.manager.set_external_address(id, SocketAddrV4::new(ip, port)) {
            Ok(())
        } else {
            Err(NodeError::PeerNotFound(id))
        }
    }

    /// Unfriend `id`: forget its certificate, drop its connections and
    /// discard its queued items.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] if `id` is not a friend.
    pub fn remove_friend(&self, id: PeerId) -> Result<()> {
        self.inner
            .trust
            .remove_peer(id)
            .ok_or(NodeError::PeerNotFound(id))?;
        if let Some((_, queue)) = self.inner.queues.remove(&id) {
            queue.clear();
        }
        self.inner.traffic.remove(&id);
        self.inner.manager.remove_peer(id, Instant::now());
        tracing::info!("Removed friend {}", id);
        Ok(())
    }

    /// Ask for an immediate connection attempt to an offline friend.
    pub fn trigger(&self, id: PeerId) -> bool {
        self.inner.manager.trigger(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Status Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Status of every friend, ordered by id.
    #[must_use]
    pub fn peer_status(&self) -> Vec<PeerStatusSnapshot> {
        let mut all = self.inner.manager.snapshots();
        for snapshot in &mut all {
            if let Some(traffic) = self.inner.traffic.get(&snapshot.id) {
                snapshot.traffic = *traffic;
            }
        }
        all
    }

    /// Status of one friend
    #[must_use]
    pub fn status(&self, id: PeerId) -> Option<PeerStatus> {
        self.inner.manager.status(id)
    }

    /// Traffic counters of one friend
    #[must_use]
    pub fn traffic(&self, id: PeerId) -> Option<FramerStats> {
        self.inner.traffic.get(&id).map(|t| *t)
    }

    /// Number of addresses currently claimed by attempts or connections
    #[must_use]
    pub fn used_addresses(&self) -> usize {
        self.inner.used.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// NAT Assist Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Handle for external helpers to report addresses and signals.
    #[must_use]
    pub fn assist_reporter(&self) -> AssistReporter {
        self.inner.reporter.clone()
    }

    /// Register a helper polled on every connectivity tick.
    pub fn add_assist(&self, assist: Box<dyn NatAssist>) {
        tracing::debug!("Registered NAT assist {}", assist.name());
        self.inner
            .assists
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(assist);
    }

    /// Set the address friends on our LAN should use.
    pub fn set_own_local(&self, addr: SocketAddrV4) {
        let own = self.inner.manager.own_addresses();
        self.inner.manager.set_own_addresses(OwnAddresses {
            local: Some(addr),
            ..own
        });
    }

    /// Set our externally reachable address.
    pub fn set_own_external(&self, addr: SocketAddrV4) {
        let own = self.inner.manager.own_addresses();
        self.inner.manager.set_own_addresses(OwnAddresses {
            external: Some(addr),
            ..own
        });
    }

    /// Our addresses as currently announced
    #[must_use]
    pub fn own_addresses(&self) -> OwnAddresses {
        self.inner.manager.own_addresses()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("local_addr", &self.inner.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32) -> Node {
        let identity = Arc::new(LocalIdentity::generate(PeerId::new(id)).unwrap());
        let config = NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..NodeConfig::default()
        };
        Node::new(config, identity, Arc::new(TrustStore::new()), Registry::default()).unwrap()
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let node = node(1);
        assert!(!node.is_running());
        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.start().await.is_err());
        node.stop().await.unwrap();
        assert!(!node.is_running());
        assert!(node.stop().await.is_err());

        // restartable
        node.start().await.unwrap();
        node.stop().await.unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let identity = Arc::new(LocalIdentity::generate(PeerId::new(1)).unwrap());
        let mut config = NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..NodeConfig::default()
        };
        config.connectivity.event_capacity = 0;
        let err = Node::new(config, identity, Arc::new(TrustStore::new()), Registry::default()).unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(_)));
    }

    #[test]
    fn test_send_errors() {
        let node = node(1);
        let item = Item::service(7, 0, vec![1, 2, 3]);
        assert!(matches!(
            node.send(PeerId::new(1), item.clone()),
            Err(NodeError::SelfAddressed(_))
        ));
        assert!(matches!(
            node.send(PeerId::new(2), item.clone()),
            Err(NodeError::PeerNotFound(_))
        ));

        node.add_pending_friend(PeerId::new(2), "bob").unwrap();
        node.send(PeerId::new(2), item).unwrap();
        assert_eq!(node.status(PeerId::new(2)), Some(PeerStatus::NoCertificate));
    }

    #[test]
    fn test_friend_lifecycle() {
        let node = node(1);
        let bob = LocalIdentity::generate(PeerId::new(2)).unwrap();

        assert!(matches!(
            node.add_or_update_friend(PeerId::new(2), b"not a certificate", "bob"),
            Err(NodeError::CertificateRejected(_))
        ));
        assert_eq!(
            node.add_or_update_friend(PeerId::new(2), bob.certificate_der(), "bob").unwrap(),
            TrustUpdate::Added
        );
        assert_eq!(
            node.add_or_update_friend(PeerId::new(2), bob.certificate_der(), "bob").unwrap(),
            TrustUpdate::Unchanged
        );
        node.set_local_address(PeerId::new(2), Ipv4Addr::LOCALHOST, 9).unwrap();

        let status = node.peer_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "bob");
        assert_eq!(status[0].local, Some("127.0.0.1:9".parse().unwrap()));

        node.remove_friend(PeerId::new(2)).unwrap();
        assert!(node.trust().peer(PeerId::new(2)).is_none());
        assert!(matches!(
            node.send(PeerId::new(2), Item::service(7, 0, vec![])),
            Err(NodeError::PeerNotFound(_))
        ));
        assert!(matches!(
            node.remove_friend(PeerId::new(2)),
            Err(NodeError::PeerNotFound(_))
        ));
        assert!(matches!(
            node.set_external_address(PeerId::new(9), Ipv4Addr::LOCALHOST, 9),
            Err(NodeError::PeerNotFound(_))
        ));
    }

    #[test]
    fn test_own_addresses() {
        let node = node(1);
        assert_eq!(node.own_addresses().local.map(|a| *a.ip()), Some(Ipv4Addr::LOCALHOST));
        let ext: SocketAddrV4 = "198.51.100.3:7812".parse().unwrap();
        node.set_own_external(ext);
        assert_eq!(node.own_addresses().external, Some(ext));
    }
}
