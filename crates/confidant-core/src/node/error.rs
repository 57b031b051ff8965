//! Error types for the Node API
//!
//! Errors are categorized to support retry logic:
//!
//! - **Transient**: may succeed if repeated later (full queues, socket hiccups)
//! - **Permanent**: will not succeed without intervention (bad config, unknown peer)
//!
//! Connectivity itself never surfaces here: whether a friend is reachable is
//! reported through [`PeerStatus`](super::PeerStatus), not as an error.

use confidant_crypto::{CryptoError, PeerId};
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in Node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Transport Errors ============
    /// Failed to bind the listening sockets
    #[error("Transport initialization failed: {0}")]
    TransportInit(Cow<'static, str>),

    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    // ============ Identity & Trust Errors ============
    /// Cryptographic or persistence operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Certificate does not belong to the claimed friend
    #[error("Certificate rejected for peer {0}")]
    CertificateRejected(PeerId),

    // ============ Peer Errors ============
    /// Peer is not a friend
    #[error("Unknown peer {0}")]
    PeerNotFound(PeerId),

    /// The item cannot be sent to ourselves
    #[error("Cannot send to own id {0}")]
    SelfAddressed(PeerId),

    /// Outbound queue for the peer is full
    #[error("Outbound queue for peer {0} is full")]
    QueueFull(PeerId),

    /// Item could not be encoded
    #[error("Encode error: {0}")]
    Encode(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Background task failed to join
    #[error("Task join error: {0}")]
    TaskJoin(Cow<'static, str>),

    /// Internal queue send/receive error
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    ///
    /// Transient errors include:
    /// - Transport failures
    /// - Full outbound queues (back off and resend)
    /// - Internal channel backpressure
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Transport(_) | NodeError::QueueFull(_) | NodeError::Channel(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidConfig(_)
                | NodeError::InvalidState(_)
                | NodeError::PeerNotFound(_)
                | NodeError::SelfAddressed(_)
                | NodeError::CertificateRejected(_)
                | NodeError::Encode(_)
        )
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NodeError::Transport(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }
}

impl From<CryptoError> for NodeError {
    fn from(err: CryptoError) -> Self {
        NodeError::Crypto(err.to_string())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<confidant_transport::TransportError> for NodeError {
    fn from(err: confidant_transport::TransportError) -> Self {
        NodeError::TransportInit(err.to_string().into())
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(NodeError::transport("reset").is_transient());
        assert!(NodeError::QueueFull(PeerId::new(3)).is_transient());
        assert!(NodeError::Channel(Cow::Borrowed("full")).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(NodeError::invalid_config("bad").is_permanent());
        assert!(NodeError::invalid_state("not running").is_permanent());
        assert!(NodeError::PeerNotFound(PeerId::new(1)).is_permanent());
        assert!(NodeError::CertificateRejected(PeerId::new(1)).is_permanent());
    }

    #[test]
    fn test_mutual_exclusivity() {
        let all = [
            NodeError::transport("x"),
            NodeError::QueueFull(PeerId::new(1)),
            NodeError::invalid_config("x"),
            NodeError::PeerNotFound(PeerId::new(1)),
            NodeError::Crypto("x".into()),
            NodeError::Io("x".into()),
        ];
        for err in &all {
            assert!(!(err.is_transient() && err.is_permanent()), "{err}");
        }
    }

    #[test]
    fn test_display() {
        let err = NodeError::PeerNotFound(PeerId::new(42));
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let node_err: NodeError = io_err.into();
        assert!(matches!(node_err, NodeError::Io(_)));
    }
}
