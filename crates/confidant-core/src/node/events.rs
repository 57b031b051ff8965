//! Messages exchanged between the connectivity manager and the aggregator.
//!
//! The manager never touches a socket: it turns [`LinkEvent`]s into
//! [`Command`]s once per tick. Both directions travel over bounded
//! `crossbeam-channel` queues.

use super::config::{MethodParams, OwnAddresses};
use super::method::{FailureKind, TransportKind};
use confidant_crypto::PeerId;
use confidant_transport::SignalKind;
use std::net::SocketAddrV4;

/// One candidate address for one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectAddress {
    /// Remote address
    pub addr: SocketAddrV4,
    /// Transport to use
    pub kind: TransportKind,
}

/// Instruction to attempt one address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Friend to reach
    pub peer: PeerId,
    /// Where and how
    pub target: ConnectAddress,
    /// Delay, period and timeout
    pub params: MethodParams,
    /// Our address, offered in traversal signals
    pub reply_to: Option<SocketAddrV4>,
}

/// Manager -> aggregator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Start an attempt
    Attempt(ConnectRequest),
    /// Abandon the attempt of `kind`; the manager has already given up on it
    Cancel {
        /// Friend
        peer: PeerId,
        /// Method to reset
        kind: TransportKind,
    },
    /// Drop every connection to the peer
    Teardown(PeerId),
    /// Peer was unfriended: drop connections and queued items
    Remove(PeerId),
    /// Our own addresses changed
    OwnAddresses(OwnAddresses),
}

/// Aggregator or NAT assist -> manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection to the peer became active
    Connected {
        /// Friend
        peer: PeerId,
        /// Method now carrying the peer
        kind: TransportKind,
        /// Address attempted, `None` for connections the peer opened
        addr: Option<SocketAddrV4>,
    },
    /// An attempt failed with no other connection active
    AttemptFailed {
        /// Friend
        peer: PeerId,
        /// Failed method
        kind: TransportKind,
        /// Address attempted
        addr: Option<SocketAddrV4>,
        /// Network or authentication
        failure: FailureKind,
    },
    /// The active connection ended
    Disconnected {
        /// Friend
        peer: PeerId,
        /// Method that was carrying the peer
        kind: TransportKind,
    },
    /// Something arrived from the peer
    Heard(PeerId),
    /// Traversal signal from the peer
    Signal {
        /// Claimed sender
        peer: PeerId,
        /// Connect-back or tunnel
        kind: SignalKind,
        /// Where the peer asks to be reached
        reply_to: SocketAddrV4,
    },
    /// The peer told us its addresses
    PeerAddresses {
        /// Friend
        peer: PeerId,
        /// LAN address
        local: Option<SocketAddrV4>,
        /// External address
        external: Option<SocketAddrV4>,
    },
    /// A helper discovered our external address
    OwnExternal(SocketAddrV4),
    /// A helper found out whether we accept inbound connections
    Firewalled(bool),
}

impl LinkEvent {
    /// True for `Heard` and `Signal`, which may be merged or dropped under
    /// load without losing a state change.
    #[must_use]
    pub fn is_hint(&self) -> bool {
        matches!(self, Self::Heard(_) | Self::Signal { .. })
    }
}
