//! Request construction.
//!
//! A request is an ordered tree: the fixed netlink header, one ancillary
//! message (ifinfomsg / ifaddrmsg / rtmsg / ndmsg), then zero or more TLV
//! attributes, possibly nested. The builder keeps everything in a single
//! buffer and patches lengths when nests close and when the message is
//! finished.

use super::attr::{NLA_F_NESTED, NlAttr, nla_align};
use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};

/// Token returned when opening a nested attribute; closing the nest patches
/// the length field it points at.
#[derive(Debug, Clone, Copy)]
#[must_use = "a nest left open produces a zero-length attribute"]
pub struct NestToken {
    offset: usize,
}

/// Builder for netlink request messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    /// Create a new builder with the given message type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let header = NlMsgHdr::new(msg_type, flags);
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[..std::mem::size_of::<NlMsgHdr>()].copy_from_slice(header.as_bytes());
        Self { buf }
    }

    /// Append raw bytes, padding to the message alignment.
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a fixed-size ancillary struct.
    ///
    /// The type must be `repr(C)` with a wire-stable layout; all ancillary
    /// structs in [`super::types`] qualify.
    pub fn append<T: zerocopy::IntoBytes + zerocopy::Immutable>(&mut self, data: &T) {
        self.append_bytes(data.as_bytes());
    }

    /// Append an attribute with an arbitrary payload.
    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) {
        let attr = NlAttr::new(attr_type, data.len());
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a u8 attribute.
    pub fn append_attr_u8(&mut self, attr_type: u16, value: u8) {
        self.append_attr(attr_type, &[value]);
    }

    /// Append a u16 attribute (native endian).
    pub fn append_attr_u16(&mut self, attr_type: u16, value: u16) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a u32 attribute (native endian).
    pub fn append_attr_u32(&mut self, attr_type: u16, value: u32) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a null-terminated string attribute.
    pub fn append_attr_str(&mut self, attr_type: u16, value: &str) {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.append_attr(attr_type, &data);
    }

    /// Open a nested attribute. The returned token must be passed to
    /// [`Self::nest_end`].
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.buf.len();
        let attr = NlAttr::new(attr_type | NLA_F_NESTED, 0);
        self.buf.extend_from_slice(attr.as_bytes());
        NestToken { offset }
    }

    /// Close a nested attribute, patching its length.
    pub fn nest_end(&mut self, token: NestToken) {
        let len = (self.buf.len() - token.offset) as u16;
        self.buf[token.offset..token.offset + 2].copy_from_slice(&len.to_ne_bytes());
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Stamp the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Stamp the sender port ID.
    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Finalize: patch the total length and return the wire bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }

    /// Current buffer contents, for inspection.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::{AttrIter, NLA_HDRLEN};
    use crate::netlink::message::{NlMsgHdr, flags, msg_type};

    #[test]
    fn test_empty_message() {
        let msg = MessageBuilder::new(msg_type::RTM_GETLINK, flags::REQUEST).finish();
        assert_eq!(msg.len(), NLMSG_HDRLEN);
        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_len as usize, NLMSG_HDRLEN);
        assert_eq!(header.nlmsg_type, msg_type::RTM_GETLINK);
    }

    #[test]
    fn test_length_and_stamps() {
        let mut builder = MessageBuilder::new(msg_type::RTM_NEWLINK, flags::REQUEST | flags::ACK);
        builder.append_attr_u32(4, 1500);
        builder.set_seq(42);
        builder.set_pid(777);
        let msg = builder.finish();

        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_len as usize, msg.len());
        assert_eq!(header.nlmsg_seq, 42);
        assert_eq!(header.nlmsg_pid, 777);
        assert_eq!(msg.len(), NLMSG_HDRLEN + NLA_HDRLEN + 4);
    }

    #[test]
    fn test_string_attr_is_null_terminated_and_padded() {
        let mut builder = MessageBuilder::new(msg_type::RTM_NEWLINK, flags::REQUEST);
        builder.append_attr_str(3, "br0");
        let msg = builder.finish();

        let (kind, payload) = AttrIter::new(&msg[NLMSG_HDRLEN..]).next().unwrap();
        assert_eq!(kind, 3);
        assert_eq!(payload, b"br0\0");
        // padded to 4
        assert_eq!(msg.len() % 4, 0);
    }

    #[test]
    fn test_nested_attribute_length_patched() {
        let mut builder = MessageBuilder::new(msg_type::RTM_NEWLINK, flags::REQUEST);
        let nest = builder.nest_start(18);
        builder.append_attr_str(1, "veth");
        builder.nest_end(nest);
        let msg = builder.finish();

        let (kind, nested) = AttrIter::new(&msg[NLMSG_HDRLEN..]).next().unwrap();
        assert_eq!(kind, 18);
        let (inner_kind, inner) = AttrIter::new(nested).next().unwrap();
        assert_eq!(inner_kind, 1);
        assert_eq!(inner, b"veth\0");
    }
}
