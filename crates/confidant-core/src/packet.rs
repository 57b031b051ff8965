//! Packet header layout.
//!
//! Every item on the wire starts with an 8-byte header:
//!
//! ```text
//!  0        1        2        3        4                               8
//! +--------+--------+--------+--------+--------------------------------+
//! |version | class  |  kind  |subkind |   total length (u32 BE)        |
//! +--------+--------+--------+--------+--------------------------------+
//! ```
//!
//! Raw service items (version 2) reuse bytes 1-2 as a big-endian service id
//! and byte 3 as the service subtype. The length counts the header itself.

use crate::error::WireError;

/// Size of the packet header
pub const HEADER_SIZE: usize = 8;

/// Largest encoded packet, header included
pub const MAX_PACKET_SIZE: usize = (1 << 18) - 1;

/// Version byte of control and negotiation items
pub const VERSION_CONTROL: u8 = 0x01;

/// Version byte of raw service items
pub const VERSION_SERVICE: u8 = 0x02;

/// Class byte of control items
pub const CLASS_CONTROL: u8 = 0x01;

/// Compose a version-1 packet type.
#[must_use]
pub const fn packet_type(version: u8, class: u8, kind: u8, subkind: u8) -> u32 {
    u32::from_be_bytes([version, class, kind, subkind])
}

/// Compose a raw service packet type.
#[must_use]
pub const fn service_type(service: u16, subtype: u8) -> u32 {
    let s = service.to_be_bytes();
    u32::from_be_bytes([VERSION_SERVICE, s[0], s[1], subtype])
}

/// Version byte of a packet type
#[must_use]
pub const fn version_of(packet_type: u32) -> u8 {
    packet_type.to_be_bytes()[0]
}

/// Service id of a raw service packet type
#[must_use]
pub const fn service_of(packet_type: u32) -> u16 {
    let b = packet_type.to_be_bytes();
    u16::from_be_bytes([b[1], b[2]])
}

/// Subtype byte (byte 3) of a packet type
#[must_use]
pub const fn subtype_of(packet_type: u32) -> u8 {
    packet_type.to_be_bytes()[3]
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type word
    pub packet_type: u32,
    /// Total length including the header
    pub length: u32,
}

impl PacketHeader {
    /// Parse and sanity-check a header.
    ///
    /// Rejects lengths below [`HEADER_SIZE`] and above [`MAX_PACKET_SIZE`];
    /// the caller decides what to do with the body.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than 8 bytes are supplied,
    /// [`WireError::InvalidValue`] for a length below the header size and
    /// [`WireError::TooLarge`] above the maximum.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let packet_type = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let len = length as usize;
        if len < HEADER_SIZE {
            return Err(WireError::InvalidValue("packet length below header size"));
        }
        if len > MAX_PACKET_SIZE {
            return Err(WireError::TooLarge(len));
        }
        Ok(Self {
            packet_type,
            length,
        })
    }

    /// Body length (total minus header)
    #[must_use]
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(HEADER_SIZE)
    }

    /// Write the header into the first 8 bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if `buf` is shorter than the header.
    pub fn write(&self, buf: &mut [u8]) -> Result<(), WireError> {
        let actual = buf.len();
        let out = buf
            .get_mut(..HEADER_SIZE)
            .ok_or(WireError::TooShort { expected: HEADER_SIZE, actual })?;
        out[..4].copy_from_slice(&self.packet_type.to_be_bytes());
        out[4..].copy_from_slice(&self.length.to_be_bytes());
        Ok(())
    }
}
