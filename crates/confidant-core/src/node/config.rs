//! Node configuration

use super::error::{NodeError, Result};
use super::method::TransportKind;
use crate::framer::FramerConfig;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen address for the TCP listener and the shared UDP socket
    pub listen_addr: SocketAddr,

    /// Connection state machine timing
    pub connectivity: ConnectivityConfig,

    /// Per-transport attempt parameters
    pub methods: MethodConfig,

    /// Rate caps
    pub bandwidth: BandwidthConfig,

    /// Stream framer tuning
    pub framer: FramerConfig,

    /// Aggregator tick cadence
    pub ticks: TickConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7812)),
            connectivity: ConnectivityConfig::default(),
            methods: MethodConfig::default(),
            bandwidth: BandwidthConfig::default(),
            framer: FramerConfig::default(),
            ticks: TickConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Check that the timing values can work together.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connectivity;
        if c.tick_interval.is_zero() {
            return Err(NodeError::invalid_config("connectivity tick interval is zero"));
        }
        if c.heartbeat_interval >= c.liveness_timeout {
            return Err(NodeError::invalid_config(
                "heartbeat interval must be shorter than the liveness timeout",
            ));
        }
        if c.event_capacity == 0 {
            return Err(NodeError::invalid_config("event queue capacity is zero"));
        }
        if self.ticks.min.is_zero() || self.ticks.min > self.ticks.max {
            return Err(NodeError::invalid_config(
                "aggregator tick bounds must satisfy 0 < min <= max",
            ));
        }
        for kind in TransportKind::ALL {
            let p = self.methods.params(kind);
            if p.timeout.is_zero() {
                return Err(NodeError::InvalidConfig(
                    format!("{kind} timeout is zero").into(),
                ));
            }
            if p.period.is_zero() && matches!(kind, TransportKind::Udp | TransportKind::ConnectBack) {
                return Err(NodeError::InvalidConfig(
                    format!("{kind} period is zero").into(),
                ));
            }
        }
        if self.framer.max_body_stalls == 0 {
            return Err(NodeError::invalid_config("max_body_stalls is zero"));
        }
        Ok(())
    }
}

/// Connectivity manager timing
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// Connectivity tick cadence
    pub tick_interval: Duration,

    /// Connected peers not heard from for this long are dropped
    pub liveness_timeout: Duration,

    /// Heartbeat cadence on every active connection
    pub heartbeat_interval: Duration,

    /// Delay before the one bonus retry of a failed address
    pub double_try_delay: Duration,

    /// Delay after an authentication failure, long enough for the friend
    /// list to deliver a refreshed certificate
    pub auth_retry_delay: Duration,

    /// Reconnect delay after an established connection drops
    pub disconnect_retry_delay: Duration,

    /// Slack added to a method's own timeout before the manager gives up on it
    pub attempt_grace: Duration,

    /// Re-trigger offline peers after this long; `None` disables it
    pub background_retry: Option<Duration>,

    /// We cannot accept inbound connections (adds connect-back candidates)
    pub firewalled: bool,

    /// Capacity of each notification queue between components
    pub event_capacity: usize,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5),
            double_try_delay: Duration::from_secs(5),
            auth_retry_delay: Duration::from_secs(120),
            disconnect_retry_delay: Duration::from_secs(3),
            attempt_grace: Duration::from_secs(5),
            background_retry: Some(Duration::from_secs(300)),
            firewalled: false,
            event_capacity: 1024,
        }
    }
}

/// Timing of one transport method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodParams {
    /// Wait before the first packet
    pub delay: Duration,
    /// Retransmit or signal repeat pacing
    pub period: Duration,
    /// Give up after this long in any one connecting state
    pub timeout: Duration,
}

/// Per-kind attempt parameters
#[derive(Debug, Clone)]
pub struct MethodConfig {
    /// TCP to the friend's LAN address
    pub local_tcp: MethodParams,
    /// TCP to the friend's external address
    pub external_tcp: MethodParams,
    /// Ask the friend to connect to us
    pub connect_back: MethodParams,
    /// Reliable UDP with hole punching
    pub udp: MethodParams,
    /// Handshake timeout for unattributed inbound connections
    pub inbound_timeout: Duration,
}

impl Default for MethodConfig {
    fn default() -> Self {
        Self {
            local_tcp: MethodParams {
                delay: Duration::ZERO,
                period: Duration::from_secs(1),
                timeout: Duration::from_secs(10),
            },
            external_tcp: MethodParams {
                delay: Duration::ZERO,
                period: Duration::from_secs(1),
                timeout: Duration::from_secs(20),
            },
            connect_back: MethodParams {
                delay: Duration::ZERO,
                period: Duration::from_secs(2),
                timeout: Duration::from_secs(30),
            },
            udp: MethodParams {
                delay: Duration::from_millis(500),
                period: Duration::from_millis(500),
                timeout: Duration::from_secs(30),
            },
            inbound_timeout: Duration::from_secs(20),
        }
    }
}

impl MethodConfig {
    /// Parameters for `kind`
    #[must_use]
    pub fn params(&self, kind: TransportKind) -> MethodParams {
        match kind {
            TransportKind::LocalTcp => self.local_tcp,
            TransportKind::ExternalTcp => self.external_tcp,
            TransportKind::ConnectBack => self.connect_back,
            TransportKind::Udp => self.udp,
        }
    }
}

/// Rate caps in bytes per second; 0 = unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthConfig {
    /// Inbound cap shared by all peers
    pub total_in: u64,
    /// Outbound cap shared by all peers
    pub total_out: u64,
    /// Inbound cap for any single peer
    pub per_peer_in: u64,
    /// Outbound cap for any single peer
    pub per_peer_out: u64,
}

/// Aggregator cadence bounds
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Interval while data is moving
    pub min: Duration,
    /// Interval when idle
    pub max: Duration,
    /// How often caps are recomputed
    pub balance_interval: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(10),
            max: Duration::from_millis(100),
            balance_interval: Duration::from_secs(1),
        }
    }
}

/// Optional fixed external address of this node, from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnAddresses {
    /// LAN address friends should use
    pub local: Option<SocketAddrV4>,
    /// Internet-facing address friends should use
    pub external: Option<SocketAddrV4>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_tick_bounds() {
        let mut config = NodeConfig::default();
        config.ticks.min = Duration::from_millis(200);
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_heartbeat_longer_than_liveness() {
        let mut config = NodeConfig::default();
        config.connectivity.heartbeat_interval = Duration::from_secs(90);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_udp_period() {
        let mut config = NodeConfig::default();
        config.methods.udp.period = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("UDP"));
    }
}
