//! Integration tests for cross-crate interactions.
//!
//! Runs real nodes on loopback: identities and trust from confidant-crypto,
//! sockets from confidant-transport, and the connectivity manager and
//! aggregator from confidant-core.

use confidant_core::node::{Node, NodeConfig, PeerStatus, TransportKind};
use confidant_core::{Item, Registry, RoutedItem};
use confidant_crypto::{LocalIdentity, PeerId, TrustStore, TrustUpdate};
use std::io::Write;
use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CHAT: u16 = 0x0031;

const ALICE: PeerId = PeerId::new(101);
const BOB: PeerId = PeerId::new(202);

/// Node on an ephemeral loopback port with fast connectivity ticks.
fn node(id: PeerId) -> Node {
    let identity = Arc::new(LocalIdentity::generate(id).expect("identity"));
    let mut config = NodeConfig {
        listen_addr: "127.0.0.1:0".parse().expect("addr"),
        ..NodeConfig::default()
    };
    config.connectivity.tick_interval = Duration::from_millis(50);
    config.connectivity.background_retry = None;

    let mut registry = Registry::default();
    registry.register_service(CHAT);
    Node::new(config, identity, Arc::new(TrustStore::new()), registry).expect("node")
}

/// Make `a` and `b` friends and tell each where the other listens.
fn befriend(a: &Node, b: &Node) {
    for (from, to) in [(a, b), (b, a)] {
        let update = from
            .add_or_update_friend(to.id(), to.identity().certificate_der(), &format!("peer-{}", to.id()))
            .expect("befriend");
        assert_eq!(update, TrustUpdate::Added);
        from.set_local_address(to.id(), Ipv4Addr::LOCALHOST, to.local_addr().port())
            .expect("address");
    }
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn receive(node: &Node, timeout: Duration) -> Option<RoutedItem> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(routed) = node.poll_received() {
            return Some(routed);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

async fn connected_pair() -> (Node, Node) {
    let alice = node(ALICE);
    let bob = node(BOB);
    befriend(&alice, &bob);
    alice.start().await.expect("start alice");
    bob.start().await.expect("start bob");

    let up = wait_until(Duration::from_secs(10), || {
        alice.status(BOB) == Some(PeerStatus::Connected) && bob.status(ALICE) == Some(PeerStatus::Connected)
    })
    .await;
    assert!(up, "alice: {:?}, bob: {:?}", alice.peer_status(), bob.peer_status());
    (alice, bob)
}

// ============================================================================
// Connection establishment
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_friends_connect_over_local_tcp() {
    let (alice, bob) = connected_pair().await;

    let snap = alice
        .peer_status()
        .into_iter()
        .find(|s| s.id == BOB)
        .expect("bob listed");
    assert!(matches!(
        snap.connected_via,
        Some(TransportKind::LocalTcp | TransportKind::ExternalTcp)
    ));

    alice.stop().await.expect("stop alice");
    bob.stop().await.expect("stop bob");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stranger_never_connects() {
    let alice = node(ALICE);
    let mallory = node(PeerId::new(666));

    // Alice lists Bob's id at Mallory's address, with Bob's certificate
    let bob = LocalIdentity::generate(BOB).expect("identity");
    alice
        .add_or_update_friend(BOB, bob.certificate_der(), "bob")
        .expect("trust bob");
    alice
        .set_local_address(BOB, Ipv4Addr::LOCALHOST, mallory.local_addr().port())
        .expect("address");
    mallory
        .add_or_update_friend(ALICE, alice.identity().certificate_der(), "alice")
        .expect("trust alice");

    alice.start().await.expect("start alice");
    mallory.start().await.expect("start mallory");

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_ne!(alice.status(BOB), Some(PeerStatus::Connected));
    assert_ne!(mallory.status(ALICE), Some(PeerStatus::Connected));

    alice.stop().await.expect("stop alice");
    mallory.stop().await.expect("stop mallory");
}

// ============================================================================
// Item delivery
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_items_delivered_in_order() {
    let (alice, bob) = connected_pair().await;

    for n in 0u8..20 {
        alice
            .send(BOB, Item::service(CHAT, 0, vec![n; 64 + usize::from(n)]))
            .expect("send");
    }

    let mut got = Vec::new();
    while got.len() < 20 {
        let routed = receive(&bob, Duration::from_secs(5)).await.expect("item arrives");
        assert_eq!(routed.peer, ALICE);
        if let Item::Service(s) = routed.item {
            assert_eq!(s.service, CHAT);
            got.push(s.payload[0]);
        }
    }
    assert_eq!(got, (0u8..20).collect::<Vec<_>>());

    let traffic = alice.traffic(BOB).expect("traffic");
    assert!(traffic.bytes_out > 0);

    alice.stop().await.expect("stop alice");
    bob.stop().await.expect("stop bob");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_items_queued_while_offline_are_sent_on_connect() {
    let alice = node(ALICE);
    let bob = node(BOB);
    befriend(&alice, &bob);

    alice
        .send(BOB, Item::service(CHAT, 1, b"written before connecting".to_vec()))
        .expect("queue");

    alice.start().await.expect("start alice");
    bob.start().await.expect("start bob");

    let routed = receive(&bob, Duration::from_secs(10)).await.expect("item arrives");
    assert_eq!(routed.peer, ALICE);
    assert_eq!(
        routed.item,
        Item::service(CHAT, 1, b"written before connecting".to_vec())
    );

    alice.stop().await.expect("stop alice");
    bob.stop().await.expect("stop bob");
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_garbage_connection_does_not_disturb_friends() {
    let (alice, bob) = connected_pair().await;

    let mut junk = TcpStream::connect(alice.local_addr()).expect("connect");
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&0x0200_0100u32.to_be_bytes());
    header[4..].copy_from_slice(&u32::MAX.to_be_bytes());
    junk.write_all(&header).expect("write");
    junk.write_all(&[0xEE; 256]).expect("write");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.status(BOB), Some(PeerStatus::Connected));

    bob.send(ALICE, Item::service(CHAT, 2, b"still here".to_vec()))
        .expect("send");
    let routed = receive(&alice, Duration::from_secs(5)).await.expect("item arrives");
    assert_eq!(routed.peer, BOB);

    alice.stop().await.expect("stop alice");
    bob.stop().await.expect("stop bob");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_is_noticed_by_friend() {
    let (alice, bob) = connected_pair().await;

    bob.stop().await.expect("stop bob");
    let noticed = wait_until(Duration::from_secs(5), || {
        alice.status(BOB) != Some(PeerStatus::Connected)
    })
    .await;
    assert!(noticed, "{:?}", alice.peer_status());

    // and the link comes back once bob returns
    bob.start().await.expect("restart bob");
    let back = wait_until(Duration::from_secs(15), || {
        alice.status(BOB) == Some(PeerStatus::Connected)
    })
    .await;
    assert!(back, "{:?}", alice.peer_status());

    alice.stop().await.expect("stop alice");
    bob.stop().await.expect("stop bob");
}

// ============================================================================
// Trust persistence
// ============================================================================

#[test]
fn test_trust_table_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("trust.json");

    let bob = LocalIdentity::generate(BOB).expect("identity");
    let trust = TrustStore::new();
    assert_eq!(
        trust.add_or_update_peer(bob.certificate_der(), BOB, Some("bob")),
        TrustUpdate::Added
    );
    trust.add_pending(PeerId::new(303), "carol");
    trust.save(&path).expect("save");

    let loaded = TrustStore::load(&path).expect("load");
    assert_eq!(loaded.fingerprint_for(BOB), Some(bob.fingerprint()));
    assert!(loaded.peer(PeerId::new(303)).expect("carol").is_pending());

    let alice = node(ALICE);
    let restored = Node::new(
        alice.config().clone(),
        Arc::clone(alice.identity()),
        Arc::new(loaded),
        Registry::default(),
    )
    .expect("node");
    assert_eq!(restored.status(BOB), Some(PeerStatus::Offline));
    assert_eq!(restored.status(PeerId::new(303)), Some(PeerStatus::NoCertificate));
}
