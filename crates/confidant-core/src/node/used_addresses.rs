//! Process-wide record of which friend each remote address belongs to.
//!
//! Two friends behind the same NAT can share an external address. While one
//! of them is being attempted (or is connected) at `ip:port`, the other must
//! not be attempted there too, or the handshake would land on the wrong peer.

use confidant_crypto::PeerId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::SocketAddrV4;

/// What an address is currently used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressUse {
    /// An attempt is in flight
    Connecting,
    /// A connection through this address is up
    Connected,
}

/// `address -> (peer, use)` map shared by the connectivity manager.
#[derive(Debug, Default)]
pub struct UsedAddressSet {
    entries: DashMap<SocketAddrV4, (PeerId, AddressUse)>,
}

impl UsedAddressSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `addr` for an attempt by `peer`.
    ///
    /// Returns false if another peer holds it. Re-claiming an address the
    /// peer already holds keeps its current use.
    pub fn try_claim(&self, addr: SocketAddrV4, peer: PeerId) -> bool {
        match self.entries.entry(addr) {
            Entry::Occupied(e) => e.get().0 == peer,
            Entry::Vacant(e) => {
                e.insert((peer, AddressUse::Connecting));
                true
            }
        }
    }

    /// True if a peer other than `peer` holds `addr`
    #[must_use]
    pub fn held_by_other(&self, addr: SocketAddrV4, peer: PeerId) -> bool {
        self.entries.get(&addr).is_some_and(|e| e.0 != peer)
    }

    /// Record that `peer` is connected through `addr`.
    pub fn mark_connected(&self, addr: SocketAddrV4, peer: PeerId) {
        self.entries.insert(addr, (peer, AddressUse::Connected));
    }

    /// Drop `addr` if `peer` holds it.
    pub fn release(&self, addr: SocketAddrV4, peer: PeerId) {
        self.entries.remove_if(&addr, |_, e| e.0 == peer);
    }

    /// Drop every `Connecting` entry of `peer`.
    pub fn release_connecting(&self, peer: PeerId) {
        self.entries
            .retain(|_, e| !(e.0 == peer && e.1 == AddressUse::Connecting));
    }

    /// Drop every entry of `peer`.
    pub fn release_peer(&self, peer: PeerId) {
        self.entries.retain(|_, e| e.0 != peer);
    }

    /// Current holder of `addr`
    #[must_use]
    pub fn get(&self, addr: SocketAddrV4) -> Option<(PeerId, AddressUse)> {
        self.entries.get(&addr).map(|e| *e)
    }

    /// Number of addresses in use
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no address is in use
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([203, 0, 113, 5].into(), port)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let set = UsedAddressSet::new();
        let (a, b) = (PeerId::new(1), PeerId::new(2));
        assert!(set.try_claim(addr(1000), a));
        assert!(set.try_claim(addr(1000), a));
        assert!(!set.try_claim(addr(1000), b));
        assert!(set.held_by_other(addr(1000), b));
        assert!(!set.held_by_other(addr(1000), a));
        assert!(set.try_claim(addr(1001), b));
    }

    #[test]
    fn test_release_only_by_holder() {
        let set = UsedAddressSet::new();
        let (a, b) = (PeerId::new(1), PeerId::new(2));
        set.try_claim(addr(1), a);
        set.release(addr(1), b);
        assert_eq!(set.get(addr(1)), Some((a, AddressUse::Connecting)));
        set.release(addr(1), a);
        assert!(set.is_empty());
    }

    #[test]
    fn test_release_connecting_keeps_connected() {
        let set = UsedAddressSet::new();
        let a = PeerId::new(1);
        set.try_claim(addr(1), a);
        set.try_claim(addr(2), a);
        set.mark_connected(addr(2), a);
        set.release_connecting(a);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(addr(2)), Some((a, AddressUse::Connected)));

        set.release_peer(a);
        assert!(set.is_empty());
    }
}
