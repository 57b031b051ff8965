//! Bounded readers and writers for packet bodies and TLV fields.
//!
//! A TLV field is `tag (u16 BE) | length (u16 BE) | value`, where `length`
//! counts the 4-byte TLV header. All offsets are computed with checked
//! arithmetic and every read is bounded by the slice the reader was built
//! over, so hostile lengths can only produce errors.

use crate::error::WireError;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Size of a TLV header
pub const TLV_HEADER_SIZE: usize = 4;

/// Largest TLV, header included
pub const MAX_TLV_SIZE: usize = u16::MAX as usize;

/// Encoded size of an IPv4 socket address value
pub const ADDR_VALUE_SIZE: usize = 6;

/// Encoded size of a TLV carrying `value_len` bytes.
#[must_use]
pub const fn tlv_size(value_len: usize) -> usize {
    TLV_HEADER_SIZE + value_len
}

fn too_short(expected: usize, actual: usize) -> WireError {
    WireError::TooShort { expected, actual }
}

/// Cursor writing into a fixed buffer.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

/// Position of an open container, for back-patching its length.
#[must_use]
pub struct ContainerMark {
    start: usize,
}

impl<'a> Writer<'a> {
    /// Start writing at offset 0 of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::TlvOverrun)?;
        let available = self.buf.len();
        let out = self
            .buf
            .get_mut(self.pos..end)
            .ok_or_else(|| too_short(end, available))?;
        self.pos = end;
        Ok(out)
    }

    /// Write one byte
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if the buffer is full.
    pub fn put_u8(&mut self, v: u8) -> Result<(), WireError> {
        self.reserve(1)?[0] = v;
        Ok(())
    }

    /// Write a big-endian u16
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if the buffer is full.
    pub fn put_u16(&mut self, v: u16) -> Result<(), WireError> {
        self.put_bytes(&v.to_be_bytes())
    }

    /// Write a big-endian u32
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if the buffer is full.
    pub fn put_u32(&mut self, v: u32) -> Result<(), WireError> {
        self.put_bytes(&v.to_be_bytes())
    }

    /// Write raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if the buffer is full.
    pub fn put_bytes(&mut self, v: &[u8]) -> Result<(), WireError> {
        self.reserve(v.len())?.copy_from_slice(v);
        Ok(())
    }

    /// Write a TLV field.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooLarge`] if the value does not fit a u16 length.
    pub fn put_tlv(&mut self, tag: u16, value: &[u8]) -> Result<(), WireError> {
        let total = tlv_size(value.len());
        let len = u16::try_from(total).map_err(|_| WireError::TooLarge(total))?;
        self.put_u16(tag)?;
        self.put_u16(len)?;
        self.put_bytes(value)
    }

    /// Write a UTF-8 string TLV
    ///
    /// # Errors
    ///
    /// See [`Writer::put_tlv`].
    pub fn put_string_tlv(&mut self, tag: u16, value: &str) -> Result<(), WireError> {
        self.put_tlv(tag, value.as_bytes())
    }

    /// Write a u32 TLV
    ///
    /// # Errors
    ///
    /// See [`Writer::put_tlv`].
    pub fn put_u32_tlv(&mut self, tag: u16, value: u32) -> Result<(), WireError> {
        self.put_tlv(tag, &value.to_be_bytes())
    }

    /// Write a u64 TLV
    ///
    /// # Errors
    ///
    /// See [`Writer::put_tlv`].
    pub fn put_u64_tlv(&mut self, tag: u16, value: u64) -> Result<(), WireError> {
        self.put_tlv(tag, &value.to_be_bytes())
    }

    /// Write an IPv4 address TLV (4 address bytes, 2 port bytes)
    ///
    /// # Errors
    ///
    /// See [`Writer::put_tlv`].
    pub fn put_addr_tlv(&mut self, tag: u16, addr: SocketAddrV4) -> Result<(), WireError> {
        let mut value = [0u8; ADDR_VALUE_SIZE];
        value[..4].copy_from_slice(&addr.ip().octets());
        value[4..].copy_from_slice(&addr.port().to_be_bytes());
        self.put_tlv(tag, &value)
    }

    /// Open a container TLV whose length is filled in by [`Writer::end_container`].
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if the header does not fit.
    pub fn begin_container(&mut self, tag: u16) -> Result<ContainerMark, WireError> {
        let start = self.pos;
        self.put_u16(tag)?;
        self.put_u16(0)?;
        Ok(ContainerMark { start })
    }

    /// Close a container, writing its final length.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooLarge`] if the container exceeds a u16 length.
    pub fn end_container(&mut self, mark: ContainerMark) -> Result<(), WireError> {
        let total = self.pos - mark.start;
        let len = u16::try_from(total).map_err(|_| WireError::TooLarge(total))?;
        self.buf[mark.start + 2..mark.start + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

/// Cursor reading from a bounded slice.
#[derive(Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Read `buf` from the start; nothing past its end is ever touched.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when everything has been consumed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read `n` raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than `n` bytes remain.
    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::TlvOverrun)?;
        let out = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| too_short(end, self.buf.len()))?;
        self.pos = end;
        Ok(out)
    }

    /// Read one byte
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] at end of input.
    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.get_bytes(1)?[0])
    }

    /// Read a big-endian u16
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] at end of input.
    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] at end of input.
    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Tag of the next TLV without consuming it
    #[must_use]
    pub fn peek_tag(&self) -> Option<u16> {
        let b = self.buf.get(self.pos..self.pos.checked_add(2)?)?;
        Some(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read the next TLV of any tag, returning `(tag, value)`.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TooShort`] if fewer than 4 bytes remain and
    /// [`WireError::TlvOverrun`] if the declared length is below the header
    /// size or runs past the end of this reader.
    pub fn read_any_tlv(&mut self) -> Result<(u16, &'a [u8]), WireError> {
        if self.remaining() < TLV_HEADER_SIZE {
            return Err(too_short(TLV_HEADER_SIZE, self.remaining()));
        }
        let mut ahead = self.clone();
        let tag = ahead.get_u16()?;
        let len = usize::from(ahead.get_u16()?);
        if len < TLV_HEADER_SIZE || len > self.remaining() {
            return Err(WireError::TlvOverrun);
        }
        let value = ahead.get_bytes(len - TLV_HEADER_SIZE)?;
        self.pos = ahead.pos;
        Ok((tag, value))
    }

    /// Read a TLV that must carry `expected` as its tag.
    ///
    /// # Errors
    ///
    /// As [`Reader::read_any_tlv`], plus [`WireError::UnexpectedTag`].
    pub fn read_tlv(&mut self, expected: u16) -> Result<&'a [u8], WireError> {
        match self.peek_tag() {
            Some(found) if found != expected => return Err(WireError::UnexpectedTag { expected, found }),
            _ => {}
        }
        let (_, value) = self.read_any_tlv()?;
        Ok(value)
    }

    /// Read a UTF-8 string TLV
    ///
    /// # Errors
    ///
    /// As [`Reader::read_tlv`], plus [`WireError::InvalidUtf8`].
    pub fn read_string_tlv(&mut self, tag: u16) -> Result<String, WireError> {
        decode_string(self.read_tlv(tag)?)
    }

    /// Read a u32 TLV
    ///
    /// # Errors
    ///
    /// As [`Reader::read_tlv`], plus [`WireError::LengthMismatch`] if the
    /// value is not 4 bytes.
    pub fn read_u32_tlv(&mut self, tag: u16) -> Result<u32, WireError> {
        decode_u32(self.read_tlv(tag)?)
    }

    /// Read a u64 TLV
    ///
    /// # Errors
    ///
    /// As [`Reader::read_tlv`], plus [`WireError::LengthMismatch`] if the
    /// value is not 8 bytes.
    pub fn read_u64_tlv(&mut self, tag: u16) -> Result<u64, WireError> {
        decode_u64(self.read_tlv(tag)?)
    }

    /// Read the value of a container TLV as a nested reader bounded by it.
    ///
    /// # Errors
    ///
    /// As [`Reader::read_tlv`].
    pub fn read_container(&mut self, tag: u16) -> Result<Reader<'a>, WireError> {
        Ok(Reader::new(self.read_tlv(tag)?))
    }

    /// Require that everything was consumed.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::TrailingBytes`] otherwise.
    pub fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// Decode a UTF-8 TLV value.
///
/// # Errors
///
/// Returns [`WireError::InvalidUtf8`] for malformed input.
pub fn decode_string(value: &[u8]) -> Result<String, WireError> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| WireError::InvalidUtf8)
}

/// Decode a 4-byte big-endian TLV value.
///
/// # Errors
///
/// Returns [`WireError::LengthMismatch`] if `value` is not 4 bytes.
pub fn decode_u32(value: &[u8]) -> Result<u32, WireError> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| WireError::LengthMismatch {
        declared: 4,
        actual: value.len(),
    })?;
    Ok(u32::from_be_bytes(bytes))
}

/// Decode an 8-byte big-endian TLV value.
///
/// # Errors
///
/// Returns [`WireError::LengthMismatch`] if `value` is not 8 bytes.
pub fn decode_u64(value: &[u8]) -> Result<u64, WireError> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| WireError::LengthMismatch {
        declared: 8,
        actual: value.len(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Decode a 6-byte IPv4 address TLV value.
///
/// # Errors
///
/// Returns [`WireError::LengthMismatch`] if `value` is not 6 bytes.
pub fn decode_addr(value: &[u8]) -> Result<SocketAddrV4, WireError> {
    let bytes: [u8; ADDR_VALUE_SIZE] = value.try_into().map_err(|_| WireError::LengthMismatch {
        declared: ADDR_VALUE_SIZE,
        actual: value.len(),
    })?;
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    Ok(SocketAddrV4::new(ip, u16::from_be_bytes([bytes[4], bytes[5]])))
}
