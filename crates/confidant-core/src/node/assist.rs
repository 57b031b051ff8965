//! Narrow interface to NAT-traversal helpers.
//!
//! UPnP, STUN, DHT lookups and similar helpers live outside this crate. They
//! are polled from the connectivity task and report what they learn through
//! an [`AssistReporter`]: our external address, whether we are firewalled,
//! and traversal signals relayed on behalf of a friend.

use super::events::LinkEvent;
use confidant_crypto::PeerId;
use confidant_transport::SignalKind;
use crossbeam_channel::{Sender, TrySendError};
use std::net::SocketAddrV4;
use std::time::Instant;
use tracing::{debug, warn};

/// A pluggable address-discovery helper.
pub trait NatAssist: Send {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Do a slice of work and report findings. Must not block.
    fn poll(&mut self, now: Instant, reporter: &AssistReporter);
}

/// Handle helpers use to feed the connectivity manager.
#[derive(Clone, Debug)]
pub struct AssistReporter {
    tx: Sender<LinkEvent>,
}

impl AssistReporter {
    pub(crate) fn new(tx: Sender<LinkEvent>) -> Self {
        Self { tx }
    }

    fn report(&self, event: LinkEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("Connectivity queue full, dropping {:?}", event);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Connectivity manager gone, dropping assist report");
                false
            }
        }
    }

    /// Report our discovered external address.
    pub fn external_address(&self, addr: SocketAddrV4) -> bool {
        self.report(LinkEvent::OwnExternal(addr))
    }

    /// Report whether inbound connections can reach us.
    pub fn firewalled(&self, firewalled: bool) -> bool {
        self.report(LinkEvent::Firewalled(firewalled))
    }

    /// Report a traversal signal from `peer`.
    pub fn signal(&self, peer: PeerId, kind: SignalKind, reply_to: SocketAddrV4) -> bool {
        self.report(LinkEvent::Signal {
            peer,
            kind,
            reply_to,
        })
    }
}

/// Helper that reports a configured external address once.
#[derive(Debug, Clone)]
pub struct StaticAddress {
    addr: SocketAddrV4,
    firewalled: Option<bool>,
    reported: bool,
}

impl StaticAddress {
    /// Report `addr` and, if given, the firewall state.
    #[must_use]
    pub fn new(addr: SocketAddrV4, firewalled: Option<bool>) -> Self {
        Self {
            addr,
            firewalled,
            reported: false,
        }
    }
}

impl NatAssist for StaticAddress {
    fn name(&self) -> &str {
        "static"
    }

    fn poll(&mut self, _now: Instant, reporter: &AssistReporter) {
        if self.reported {
            return;
        }
        let mut ok = reporter.external_address(self.addr);
        if let Some(f) = self.firewalled {
            ok &= reporter.firewalled(f);
        }
        self.reported = ok;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_reports_once() {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let reporter = AssistReporter::new(tx);
        let addr: SocketAddrV4 = "198.51.100.7:7812".parse().unwrap();
        let mut helper = StaticAddress::new(addr, Some(true));

        helper.poll(Instant::now(), &reporter);
        helper.poll(Instant::now(), &reporter);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![LinkEvent::OwnExternal(addr), LinkEvent::Firewalled(true)]
        );
    }

    #[test]
    fn test_full_queue_retries_later() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let reporter = AssistReporter::new(tx);
        let addr: SocketAddrV4 = "198.51.100.7:7812".parse().unwrap();
        let mut helper = StaticAddress::new(addr, Some(false));

        // leave room for the address only
        assert!(reporter.firewalled(true));
        helper.poll(Instant::now(), &reporter);
        assert_eq!(rx.try_iter().count(), 2);

        helper.poll(Instant::now(), &reporter);
        assert_eq!(rx.try_iter().count(), 2);
        helper.poll(Instant::now(), &reporter);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_signal_carries_sender() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let reporter = AssistReporter::new(tx);
        let reply: SocketAddrV4 = "203.0.113.1:4000".parse().unwrap();
        assert!(reporter.signal(PeerId::new(5), SignalKind::Tunnel, reply));
        assert!(matches!(
            rx.try_recv().unwrap(),
            LinkEvent::Signal { peer, kind: SignalKind::Tunnel, .. } if peer == PeerId::new(5)
        ));
    }
}
