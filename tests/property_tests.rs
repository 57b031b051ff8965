//! Property-based tests for Confidant
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Packet Codec Properties
// ============================================================================

mod codec_properties {
    use super::*;
    use confidant_core::item::{AddressUpdate, ControlItem, HelloItem, PROTOCOL_VERSION};
    use confidant_core::{HEADER_SIZE, Item, MAX_PACKET_SIZE, PacketHeader, Registry};
    use std::net::SocketAddrV4;

    fn registry() -> Registry {
        let mut r = Registry::default();
        r.register_service(0x0042);
        r
    }

    fn arb_addr() -> impl Strategy<Value = Option<SocketAddrV4>> {
        prop::option::of((any::<u32>(), any::<u16>()).prop_map(|(ip, port)| SocketAddrV4::new(ip.into(), port)))
    }

    fn arb_item() -> impl Strategy<Value = Item> {
        prop_oneof![
            Just(Item::Control(ControlItem::Heartbeat)),
            (
                prop::option::of("[a-z0-9. ]{0,24}"),
                prop::option::of("[A-Za-z ]{0,16}")
            )
                .prop_map(|(client_version, display_name)| Item::Control(ControlItem::Hello(HelloItem {
                    protocol_version: PROTOCOL_VERSION,
                    client_version,
                    display_name,
                }))),
            (arb_addr(), arb_addr()).prop_map(|(local, external)| Item::Control(ControlItem::AddressUpdate(
                AddressUpdate { local, external }
            ))),
            any::<u32>().prop_map(|reason| Item::Control(ControlItem::Goodbye { reason })),
            (any::<u8>(), prop::collection::vec(any::<u8>(), 0..2048))
                .prop_map(|(subtype, payload)| Item::service(0x0042, subtype, payload)),
        ]
    }

    proptest! {
        /// Every encodable item decodes back to itself and declares its own size
        #[test]
        fn item_survives_the_wire(item in arb_item()) {
            let bytes = item.to_bytes().unwrap();
            prop_assert_eq!(bytes.len(), item.size() as usize);

            let header = PacketHeader::parse(&bytes).unwrap();
            prop_assert_eq!(header.length as usize, bytes.len());
            prop_assert_eq!(header.packet_type, item.packet_type());

            prop_assert_eq!(registry().decode(&bytes).unwrap(), item);
        }

        /// A packet cut short anywhere is rejected, never misread
        #[test]
        fn truncated_packet_rejected(item in arb_item(), cut in any::<prop::sample::Index>()) {
            let bytes = item.to_bytes().unwrap();
            let keep = cut.index(bytes.len());
            prop_assert!(registry().decode(&bytes[..keep]).is_err());
        }

        /// Header parsing accepts exactly the lengths in [HEADER_SIZE, MAX_PACKET_SIZE]
        #[test]
        fn header_length_bounds(packet_type in any::<u32>(), length in any::<u32>()) {
            let mut buf = [0u8; HEADER_SIZE];
            PacketHeader { packet_type, length }.write(&mut buf).unwrap();
            let len = length as usize;
            let parsed = PacketHeader::parse(&buf);
            if (HEADER_SIZE..=MAX_PACKET_SIZE).contains(&len) {
                prop_assert_eq!(parsed.unwrap().body_len(), len - HEADER_SIZE);
            } else {
                prop_assert!(parsed.is_err());
            }
        }

        /// Arbitrary bytes never panic the decoder
        #[test]
        fn decode_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = registry().decode(&bytes);
        }
    }
}

// ============================================================================
// TLV Reader Properties
// ============================================================================

mod tlv_properties {
    use super::*;
    use confidant_core::tlv::{Reader, TLV_HEADER_SIZE, Writer, tlv_size};

    proptest! {
        /// Walking arbitrary bytes as TLVs terminates without panicking
        #[test]
        fn reader_walks_garbage(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let mut reader = Reader::new(&bytes);
            let mut steps = 0;
            while !reader.is_empty() && reader.read_any_tlv().is_ok() {
                steps += 1;
                prop_assert!(steps <= bytes.len() / TLV_HEADER_SIZE);
            }
        }

        /// Strings written as TLVs read back in order, and the buffer is used exactly
        #[test]
        fn string_sequence(values in prop::collection::vec("[ -~]{0,40}", 1..8)) {
            let total: usize = values.iter().map(|v| tlv_size(v.len())).sum();
            let mut buf = vec![0u8; total];
            let mut w = Writer::new(&mut buf);
            for (i, v) in values.iter().enumerate() {
                w.put_string_tlv(i as u16, v).unwrap();
            }
            prop_assert_eq!(w.position(), total);

            let mut r = Reader::new(&buf);
            for (i, v) in values.iter().enumerate() {
                prop_assert_eq!(&r.read_string_tlv(i as u16).unwrap(), v);
            }
            prop_assert!(r.finish().is_ok());
        }
    }
}

// ============================================================================
// Bandwidth Balancing Properties
// ============================================================================

mod balance_properties {
    use super::*;
    use confidant_core::node::balancer::{Demand, balance};

    fn arb_demand() -> impl Strategy<Value = Demand> {
        (
            0u64..50_000_000,
            0.0f64..50_000_000.0,
            prop_oneof![Just(0u64), 1024u64..20_000_000],
        )
            .prop_map(|(current, observed, individual)| Demand {
                current,
                observed,
                individual,
            })
    }

    proptest! {
        /// Caps never exceed the total or any individual cap
        #[test]
        fn caps_respect_limits(
            demands in prop::collection::vec(arb_demand(), 1..12),
            per_peer in 1024u64..10_000_000,
        ) {
            let total = per_peer * demands.len() as u64;
            let caps = balance(total, &demands);

            prop_assert_eq!(caps.len(), demands.len());
            prop_assert!(caps.iter().sum::<u64>() <= total, "{:?} over {}", caps, total);
            for (cap, d) in caps.iter().zip(&demands) {
                prop_assert!(*cap >= 1);
                if d.individual > 0 {
                    prop_assert!(*cap <= d.individual, "{} over individual {}", cap, d.individual);
                }
            }
        }

        /// Idle peers with no individual caps split the total evenly
        #[test]
        fn idle_peers_share_evenly(n in 1usize..10, per_peer in 2048u64..1_000_000) {
            let total = per_peer * n as u64;
            let idle = Demand { current: 0, observed: 0.0, individual: 0 };
            let caps = balance(total, &vec![idle; n]);
            let min = *caps.iter().min().unwrap();
            let max = *caps.iter().max().unwrap();
            prop_assert!(max - min <= 1, "{:?}", caps);
        }
    }
}

// ============================================================================
// Connectivity Manager Properties
// ============================================================================

mod connectivity_properties {
    use super::*;
    use confidant_core::node::{
        Command, ConnectRequest, ConnectivityConfig, ConnectivityManager, FailureKind, LinkEvent, MethodConfig,
        UsedAddressSet,
    };
    use confidant_crypto::PeerId;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Clone, Copy, Debug)]
    enum Outcome {
        Network,
        Auth,
        Connected,
    }

    fn arb_outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![
            6 => Just(Outcome::Network),
            1 => Just(Outcome::Auth),
            2 => Just(Outcome::Connected),
        ]
    }

    fn answer(req: &ConnectRequest, outcome: Outcome) -> LinkEvent {
        match outcome {
            Outcome::Connected => LinkEvent::Connected {
                peer: req.peer,
                kind: req.target.kind,
                addr: Some(req.target.addr),
            },
            Outcome::Network | Outcome::Auth => LinkEvent::AttemptFailed {
                peer: req.peer,
                kind: req.target.kind,
                addr: Some(req.target.addr),
                failure: if matches!(outcome, Outcome::Auth) {
                    FailureKind::Auth
                } else {
                    FailureKind::Network
                },
            },
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// A peer never has two attempts in flight, never gets attempted while
        /// connected, and friends without certificates are never attempted
        #[test]
        fn one_attempt_per_peer(
            outcomes in prop::collection::vec(arb_outcome(), 1..200),
            friends in 1u32..5,
            shared_lan in any::<bool>(),
        ) {
            let t0 = Instant::now();
            let config = ConnectivityConfig {
                background_retry: Some(Duration::from_secs(30)),
                ..ConnectivityConfig::default()
            };
            let used = Arc::new(UsedAddressSet::new());
            let mgr = ConnectivityManager::new(PeerId::new(1), config, MethodConfig::default(), Arc::clone(&used), t0);

            for n in 0..friends {
                let id = PeerId::new(10 + n);
                mgr.add_peer(id, "friend", true, t0);
                let host = if shared_lan { 5 } else { 5 + n as u8 };
                mgr.set_local_address(id, format!("192.168.7.{host}:7812").parse().unwrap());
                mgr.set_external_address(id, format!("198.51.100.{}:7812", 5 + n).parse().unwrap());
            }
            let stranger = PeerId::new(99);
            mgr.add_peer(stranger, "stranger", false, t0);
            mgr.set_local_address(stranger, "192.168.7.99:7812".parse().unwrap());

            let mut in_flight: HashMap<PeerId, ConnectRequest> = HashMap::new();
            let mut connected: HashSet<PeerId> = HashSet::new();
            let mut outcomes = outcomes.into_iter().cycle().take(400);
            let mut now = t0;
            let mut events = Vec::new();

            for _ in 0..400 {
                let cmds = mgr.tick(now, std::mem::take(&mut events));
                for cmd in &cmds {
                    match cmd {
                        Command::Teardown(peer) => {
                            connected.remove(peer);
                        }
                        Command::Cancel { peer, .. } => {
                            in_flight.remove(peer);
                        }
                        _ => {}
                    }
                }
                for cmd in cmds {
                    if let Command::Attempt(req) = cmd {
                        prop_assert_ne!(req.peer, stranger);
                        prop_assert!(!in_flight.contains_key(&req.peer), "second attempt for {}", req.peer);
                        prop_assert!(!connected.contains(&req.peer), "attempt while connected to {}", req.peer);
                        in_flight.insert(req.peer, req);
                    }
                }

                for (peer, req) in in_flight.drain() {
                    let outcome = outcomes.next().unwrap_or(Outcome::Network);
                    if matches!(outcome, Outcome::Connected) {
                        connected.insert(peer);
                    }
                    events.push(answer(&req, outcome));
                }
                now += Duration::from_secs(1);
            }
            prop_assert!(used.len() <= friends as usize * 2);
        }
    }
}
