//! Packet type registry and the top-level decode entry point.
//!
//! Decoders are looked up by the exact packet type first, then with the low
//! byte masked off, then with the low two bytes masked off, so one decoder
//! can serve every subtype of a kind or every kind of a class.

use crate::error::WireError;
use crate::item::{self, Item, kind};
use crate::packet::{CLASS_CONTROL, PacketHeader, VERSION_CONTROL, packet_type, service_type};
use std::collections::HashMap;

/// Decoder for one packet type family: `(packet_type, body) -> Item`.
pub type DecodeFn = fn(u32, &[u8]) -> Result<Item, WireError>;

/// Mask selecting everything but the subtype byte
pub const MASK_SUBTYPE: u32 = 0xFFFF_FF00;

/// Mask selecting version and class
pub const MASK_KIND: u32 = 0xFFFF_0000;

/// Maps packet types to decoders.
#[derive(Clone)]
pub struct Registry {
    decoders: HashMap<u32, DecodeFn>,
}

impl Default for Registry {
    /// A registry that knows every control item.
    fn default() -> Self {
        let mut registry = Self::empty();
        let control = |k| packet_type(VERSION_CONTROL, CLASS_CONTROL, k, 0);
        registry.register(control(kind::HEARTBEAT), item::decode_heartbeat);
        registry.register(control(kind::HELLO), item::decode_hello);
        registry.register(control(kind::ADDRESS_UPDATE), item::decode_address_update);
        registry.register(control(kind::GOODBYE), item::decode_goodbye);
        registry
    }
}

impl Registry {
    /// A registry with no decoders.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `decoder` under `key` (an exact type or a masked one).
    pub fn register(&mut self, key: u32, decoder: DecodeFn) {
        self.decoders.insert(key, decoder);
    }

    /// Accept raw items for `service`, any subtype.
    pub fn register_service(&mut self, service: u16) {
        self.register(service_type(service, 0), item::decode_service);
    }

    /// Find the decoder for `packet_type`.
    #[must_use]
    pub fn lookup(&self, packet_type: u32) -> Option<DecodeFn> {
        [packet_type, packet_type & MASK_SUBTYPE, packet_type & MASK_KIND]
            .iter()
            .find_map(|key| self.decoders.get(key).copied())
    }

    /// Decode one complete packet.
    ///
    /// `buf` must hold exactly one packet: its length must equal the header's
    /// declared length.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for short buffers, length mismatches,
    /// oversize packets, unknown types and malformed bodies.
    pub fn decode(&self, buf: &[u8]) -> Result<Item, WireError> {
        let header = PacketHeader::parse(buf)?;
        let declared = header.length as usize;
        if declared != buf.len() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        let decoder = self
            .lookup(header.packet_type)
            .ok_or(WireError::UnknownType(header.packet_type))?;
        decoder(header.packet_type, &buf[crate::packet::HEADER_SIZE..])
    }
}
