//! Error types for the Confidant core.

use confidant_crypto::CryptoError;
use confidant_transport::TransportError;
use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Wire codec error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Secure channel error
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Packet and TLV codec errors.
///
/// Every decode failure leaves no partially built item behind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the structure being read
    #[error("buffer too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header length does not match the bytes supplied
    #[error("declared length {declared} does not match {actual} bytes")]
    LengthMismatch {
        /// Length from the header
        declared: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// Packet exceeds the maximum packet size
    #[error("packet of {0} bytes exceeds maximum")]
    TooLarge(usize),

    /// No decoder registered for the packet type
    #[error("unknown packet type 0x{0:08X}")]
    UnknownType(u32),

    /// TLV tag differs from the one expected here
    #[error("unexpected TLV tag 0x{found:04X}, expected 0x{expected:04X}")]
    UnexpectedTag {
        /// Tag the container requires
        expected: u16,
        /// Tag found on the wire
        found: u16,
    },

    /// TLV with a tag no decoder understands, outside an extensible container
    #[error("unknown TLV tag 0x{0:04X}")]
    UnknownTag(u16),

    /// TLV declared length runs past its container or is below the header size
    #[error("TLV length overruns its container")]
    TlvOverrun,

    /// String field is not valid UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Bytes left over after a complete item
    #[error("{0} trailing bytes after item")]
    TrailingBytes(usize),

    /// Field value outside its allowed range
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

/// Secure channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Channel closed by either side
    #[error("channel closed")]
    Closed,

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure (connect refused, peer unresponsive)
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake or record failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Remote sent a record larger than allowed
    #[error("record of {0} bytes exceeds maximum")]
    RecordTooLarge(usize),

    /// Packet header unusable (oversized or undersized length)
    #[error("malformed stream: {0}")]
    Malformed(#[from] WireError),

    /// Packet body stopped arriving
    #[error("packet body stalled for {0} ticks")]
    Stalled(u32),
}

impl ChannelError {
    /// True when the remote failed to authenticate
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, ChannelError::Crypto(e) if e.is_authentication_failure())
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
