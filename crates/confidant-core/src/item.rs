//! Items: the typed messages carried in packets.
//!
//! Control items (version 1, class `CONTROL`) are consumed by the node
//! itself. Raw service items (version 2) carry an opaque payload for an
//! upper-layer service and are delivered upward unchanged.

use crate::error::WireError;
use crate::packet::{
    CLASS_CONTROL, HEADER_SIZE, MAX_PACKET_SIZE, PacketHeader, VERSION_CONTROL, packet_type, service_of,
    service_type, subtype_of,
};
use crate::tlv::{ADDR_VALUE_SIZE, Reader, Writer, decode_addr, tlv_size};
use confidant_crypto::PeerId;
use std::net::SocketAddrV4;

/// Control item kinds (byte 2 of the packet type)
pub mod kind {
    /// Liveness keepalive
    pub const HEARTBEAT: u8 = 0x01;
    /// Protocol version and client details, sent once per connection
    pub const HELLO: u8 = 0x02;
    /// Sender's current local and external addresses
    pub const ADDRESS_UPDATE: u8 = 0x03;
    /// Graceful disconnect
    pub const GOODBYE: u8 = 0x04;
}

/// TLV tags used by control items
pub mod tag {
    /// Client software version string (Hello trailing field)
    pub const CLIENT_VERSION: u16 = 0x0001;
    /// Display name string (Hello trailing field)
    pub const DISPLAY_NAME: u16 = 0x0002;
    /// Address set container
    pub const ADDRESS_SET: u16 = 0x1000;
    /// Local (LAN) address
    pub const LOCAL_ADDR: u16 = 0x1001;
    /// External (public) address
    pub const EXTERNAL_ADDR: u16 = 0x1002;
}

/// Current control protocol version, sent in `Hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// Goodbye reason codes
pub mod reason {
    /// Node is shutting down
    pub const SHUTDOWN: u32 = 0;
    /// Peer was removed from the friend list
    pub const UNFRIENDED: u32 = 1;
    /// A newer connection replaced this one
    pub const REPLACED: u32 = 2;
}

/// `Hello` control item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloItem {
    /// Sender's control protocol version
    pub protocol_version: u32,
    /// Optional client software version
    pub client_version: Option<String>,
    /// Optional display name
    pub display_name: Option<String>,
}

/// `AddressUpdate` control item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressUpdate {
    /// Address on the sender's LAN
    pub local: Option<SocketAddrV4>,
    /// Address as seen from the internet
    pub external: Option<SocketAddrV4>,
}

/// Items handled by the node itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlItem {
    /// Keepalive
    Heartbeat,
    /// Version negotiation
    Hello(HelloItem),
    /// Address advertisement
    AddressUpdate(AddressUpdate),
    /// Graceful disconnect with a reason code
    Goodbye {
        /// One of [`reason`]
        reason: u32,
    },
}

/// Opaque item addressed to an upper-layer service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceItem {
    /// Service id
    pub service: u16,
    /// Service-defined subtype
    pub subtype: u8,
    /// Opaque payload
    pub payload: Vec<u8>,
}

/// Any item that can travel in a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Control item
    Control(ControlItem),
    /// Raw service item
    Service(ServiceItem),
}

/// An item together with the peer it came from or goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedItem {
    /// Sending or receiving peer
    pub peer: PeerId,
    /// The item
    pub item: Item,
}

impl Item {
    /// Convenience constructor for a service item
    #[must_use]
    pub fn service(service: u16, subtype: u8, payload: Vec<u8>) -> Self {
        Item::Service(ServiceItem {
            service,
            subtype,
            payload,
        })
    }

    /// True for control items
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Item::Control(_))
    }

    /// Packet type word
    #[must_use]
    pub fn packet_type(&self) -> u32 {
        match self {
            Item::Control(c) => {
                let k = match c {
                    ControlItem::Heartbeat => kind::HEARTBEAT,
                    ControlItem::Hello(_) => kind::HELLO,
                    ControlItem::AddressUpdate(_) => kind::ADDRESS_UPDATE,
                    ControlItem::Goodbye { .. } => kind::GOODBYE,
                };
                packet_type(VERSION_CONTROL, CLASS_CONTROL, k, 0)
            }
            Item::Service(s) => service_type(s.service, s.subtype),
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Item::Control(ControlItem::Heartbeat) => 0,
            Item::Control(ControlItem::Hello(h)) => {
                4 + h.client_version.as_ref().map_or(0, |s| tlv_size(s.len()))
                    + h.display_name.as_ref().map_or(0, |s| tlv_size(s.len()))
            }
            Item::Control(ControlItem::AddressUpdate(a)) => {
                let n = usize::from(a.local.is_some()) + usize::from(a.external.is_some());
                tlv_size(n * tlv_size(ADDR_VALUE_SIZE))
            }
            Item::Control(ControlItem::Goodbye { .. }) => 4,
            Item::Service(s) => s.payload.len(),
        }
    }

    /// Encoded size in bytes, header included
    #[must_use]
    pub fn size(&self) -> u32 {
        u32::try_from(HEADER_SIZE.saturating_add(self.body_size())).unwrap_or(u32::MAX)
    }

    /// Encode into `buf`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooLarge`] above [`MAX_PACKET_SIZE`] and
    /// [`WireError::TooShort`] if `buf` cannot hold the packet.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        let total = self.size() as usize;
        if total > MAX_PACKET_SIZE {
            return Err(WireError::TooLarge(total));
        }
        if buf.len() < total {
            return Err(WireError::TooShort {
                expected: total,
                actual: buf.len(),
            });
        }

        let header = PacketHeader {
            packet_type: self.packet_type(),
            length: total as u32,
        };
        header.write(buf)?;

        let mut w = Writer::new(&mut buf[HEADER_SIZE..total]);
        match self {
            Item::Control(ControlItem::Heartbeat) => {}
            Item::Control(ControlItem::Hello(h)) => {
                w.put_u32(h.protocol_version)?;
                if let Some(v) = &h.client_version {
                    w.put_string_tlv(tag::CLIENT_VERSION, v)?;
                }
                if let Some(n) = &h.display_name {
                    w.put_string_tlv(tag::DISPLAY_NAME, n)?;
                }
            }
            Item::Control(ControlItem::AddressUpdate(a)) => {
                let mark = w.begin_container(tag::ADDRESS_SET)?;
                if let Some(local) = a.local {
                    w.put_addr_tlv(tag::LOCAL_ADDR, local)?;
                }
                if let Some(external) = a.external {
                    w.put_addr_tlv(tag::EXTERNAL_ADDR, external)?;
                }
                w.end_container(mark)?;
            }
            Item::Control(ControlItem::Goodbye { reason }) => w.put_u32(*reason)?,
            Item::Service(s) => w.put_bytes(&s.payload)?,
        }

        let written = HEADER_SIZE + w.position();
        if written != total {
            return Err(WireError::LengthMismatch {
                declared: total,
                actual: written,
            });
        }
        Ok(total)
    }

    /// Encode into a freshly allocated buffer.
    ///
    /// # Errors
    ///
    /// As [`Item::encode`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = vec![0u8; self.size() as usize];
        let n = self.encode(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

fn require_plain_subtype(packet_type: u32) -> Result<(), WireError> {
    if subtype_of(packet_type) != 0 {
        return Err(WireError::UnknownType(packet_type));
    }
    Ok(())
}

/// Decode a `Heartbeat` body.
pub(crate) fn decode_heartbeat(packet_type: u32, body: &[u8]) -> Result<Item, WireError> {
    require_plain_subtype(packet_type)?;
    Reader::new(body).finish()?;
    Ok(Item::Control(ControlItem::Heartbeat))
}

/// Decode a `Hello` body. Trailing TLVs this version does not know are skipped.
pub(crate) fn decode_hello(packet_type: u32, body: &[u8]) -> Result<Item, WireError> {
    require_plain_subtype(packet_type)?;
    let mut r = Reader::new(body);
    let mut hello = HelloItem {
        protocol_version: r.get_u32()?,
        client_version: None,
        display_name: None,
    };
    while !r.is_empty() {
        match r.peek_tag() {
            Some(tag::CLIENT_VERSION) => hello.client_version = Some(r.read_string_tlv(tag::CLIENT_VERSION)?),
            Some(tag::DISPLAY_NAME) => hello.display_name = Some(r.read_string_tlv(tag::DISPLAY_NAME)?),
            _ => {
                r.read_any_tlv()?;
            }
        }
    }
    Ok(Item::Control(ControlItem::Hello(hello)))
}

/// Decode an `AddressUpdate` body. The address set is strict.
pub(crate) fn decode_address_update(packet_type: u32, body: &[u8]) -> Result<Item, WireError> {
    require_plain_subtype(packet_type)?;
    let mut r = Reader::new(body);
    let mut set = r.read_container(tag::ADDRESS_SET)?;
    r.finish()?;

    let mut update = AddressUpdate::default();
    while !set.is_empty() {
        let (t, value) = set.read_any_tlv()?;
        match t {
            tag::LOCAL_ADDR => update.local = Some(decode_addr(value)?),
            tag::EXTERNAL_ADDR => update.external = Some(decode_addr(value)?),
            other => return Err(WireError::UnknownTag(other)),
        }
    }
    Ok(Item::Control(ControlItem::AddressUpdate(update)))
}

/// Decode a `Goodbye` body.
pub(crate) fn decode_goodbye(packet_type: u32, body: &[u8]) -> Result<Item, WireError> {
    require_plain_subtype(packet_type)?;
    let mut r = Reader::new(body);
    let reason = r.get_u32()?;
    r.finish()?;
    Ok(Item::Control(ControlItem::Goodbye { reason }))
}

/// Decode a raw service item; the payload is taken verbatim.
pub(crate) fn decode_service(packet_type: u32, body: &[u8]) -> Result<Item, WireError> {
    Ok(Item::Service(ServiceItem {
        service: service_of(packet_type),
        subtype: subtype_of(packet_type),
        payload: body.to_vec(),
    }))
}
