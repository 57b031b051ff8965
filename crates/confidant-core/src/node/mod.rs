//! Node orchestration layer for Confidant
//!
//! This module provides the high-level Node API and the two engines behind
//! it:
//! - The connectivity manager: per-peer policy, attempt ordering, retries,
//!   liveness
//! - The aggregator: sockets, handshakes, per-peer transport methods,
//!   item routing and rate-cap balancing
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Node API                            │
//! │     (friends, items, status, NAT assist hooks)          │
//! ├────────────────────────────┬────────────────────────────┤
//! │   ConnectivityManager      │        Aggregator          │
//! │      LinkEvent ───────────▶│◀────────── Command         │
//! ├────────────────────────────┴────────────────────────────┤
//! │  PeerAggregate ─▶ TransportMethod ─▶ StreamFramer        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Manager and aggregator run on separate tasks and talk only through
//! bounded queues. The manager never touches a socket; the aggregator never
//! decides policy.

mod aggregator;
pub mod assist;
pub mod balancer;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod method;
#[allow(clippy::module_inception)]
pub mod node;
pub mod peer;
pub mod used_addresses;

pub use assist::{AssistReporter, NatAssist, StaticAddress};
pub use balancer::Demand;
pub use config::{
    BandwidthConfig, ConnectivityConfig, MethodConfig, MethodParams, NodeConfig, OwnAddresses,
    TickConfig,
};
pub use connectivity::{ConnectivityManager, PeerStatus, PeerStatusSnapshot, Phase};
pub use error::NodeError;
pub use events::{Command, ConnectAddress, ConnectRequest, LinkEvent};
pub use method::{FailureKind, MethodState, TransportKind};
pub use node::Node;
pub use used_addresses::{AddressUse, UsedAddressSet};
