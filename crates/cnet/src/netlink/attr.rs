//! Netlink attribute (rtattr) encoding and decoding.
//!
//! Attributes are TLVs: a 4-byte header carrying total length and type,
//! followed by the payload, padded to a 4-byte boundary on the wire. The
//! length field counts header + payload but never the padding.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::error::{Error, Result};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to the attribute boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4;

/// Attribute header (mirrors struct rtattr / struct nlattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header, excluding padding.
    pub nla_len: u16,
    /// Attribute type, possibly carrying the nested/byte-order flag bits.
    pub nla_type: u16,
}

/// High bit marking a nested attribute.
pub const NLA_F_NESTED: u16 = 1 << 15;
/// Bit marking network-byte-order payloads.
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
/// Mask selecting the attribute type without flag bits.
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

impl NlAttr {
    /// Create a new attribute header for a payload of `data_len` bytes.
    pub fn new(attr_type: u16, data_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + data_len) as u16,
            nla_type: attr_type,
        }
    }

    /// Attribute type without flag bits.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse from the front of a buffer.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::ShortResponse {
                expected: NLA_HDRLEN,
                actual: data.len(),
            })
    }
}

/// Iterator over the attributes in a message payload.
///
/// Yields `(type-without-flags, payload)` pairs. Malformed trailing bytes end
/// the iteration rather than failing it; the kernel never emits them.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Create a new attribute iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }

        let attr = NlAttr::from_bytes(self.data).ok()?;
        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }

        let payload = &self.data[NLA_HDRLEN..len];
        let aligned = nla_align(len);
        self.data = if aligned >= self.data.len() {
            &[]
        } else {
            &self.data[aligned..]
        };

        Some((attr.kind(), payload))
    }
}

/// Typed extraction helpers for attribute payloads.
pub mod get {
    use super::*;

    /// Extract a u8 value.
    pub fn u8(data: &[u8]) -> Result<u8> {
        data.first()
            .copied()
            .ok_or_else(|| Error::InvalidAttribute("empty u8 attribute".into()))
    }

    /// Extract a u16 value (native endian).
    pub fn u16_ne(data: &[u8]) -> Result<u16> {
        let bytes: [u8; 2] = data
            .get(..2)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::InvalidAttribute("truncated u16 attribute".into()))?;
        Ok(u16::from_ne_bytes(bytes))
    }

    /// Extract a u32 value (native endian).
    pub fn u32_ne(data: &[u8]) -> Result<u32> {
        let bytes: [u8; 4] = data
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::InvalidAttribute("truncated u32 attribute".into()))?;
        Ok(u32::from_ne_bytes(bytes))
    }

    /// Extract an i32 value (native endian).
    pub fn i32_ne(data: &[u8]) -> Result<i32> {
        u32_ne(data).map(|v| v as i32)
    }

    /// Extract a null-terminated string.
    pub fn string(data: &[u8]) -> Result<&str> {
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {e}")))
    }

    /// Extract a 6-byte hardware address.
    pub fn mac(data: &[u8]) -> Result<[u8; 6]> {
        data.get(..6)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::InvalidAttribute("truncated hardware address".into()))
    }
}
