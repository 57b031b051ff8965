//! # Confidant Core
//!
//! Link layer of the Confidant friend-to-friend network.
//!
//! This crate provides:
//! - Packet and TLV encoding and decoding with strict bounds checks
//! - Authenticated, encrypted channels over any byte transport
//! - The stream framer: item queues, rate caps and partial-read recovery
//! - The connectivity manager deciding how and when each friend is reached
//! - The bandwidth aggregator owning every socket and sharing rate caps
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Node                                 │
//! │   send / poll_received / friend list / status snapshots         │
//! ├──────────────────────────────┬──────────────────────────────────┤
//! │    Connectivity manager      │        Aggregator                │
//! │ (1 s tick, pure policy)      │ (variable tick, owns sockets)    │
//! ├──────────────────────────────┴──────────────────────────────────┤
//! │        Transport methods: local TCP, external TCP,              │
//! │        connect-back, reliable UDP                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Secure channel -> stream framer -> packets / TLV         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bandwidth;
pub mod channel;
pub mod error;
pub mod framer;
pub mod item;
pub mod node;
pub mod packet;
pub mod registry;
pub mod tlv;

pub use channel::{Authenticated, Channel, SecureChannel};
pub use error::{ChannelError, Error, WireError};
pub use framer::{FramerConfig, FramerStats, OutboundQueue, QueueError, StreamFramer};
pub use item::{AddressUpdate, ControlItem, HelloItem, Item, RoutedItem, ServiceItem};
pub use node::{Node, NodeConfig, NodeError, PeerStatus, PeerStatusSnapshot};
pub use packet::{HEADER_SIZE, MAX_PACKET_SIZE, PacketHeader};
pub use registry::Registry;
