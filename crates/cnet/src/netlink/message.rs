//! Netlink message header, framing, and error replies.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::error::{Error, Result};

/// Netlink message alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to the netlink message boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// Netlink message header (mirrors struct nlmsghdr).
///
/// Integer fields are host-byte-order on the wire; the zerocopy
/// representation writes whatever the running machine uses, which is exactly
/// what the kernel expects on both little- and big-endian hosts.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Additional flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending process port ID.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Create a new message header.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }

    /// Check if this is an error (or ACK) message.
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == msg_type::ERROR
    }

    /// Check if this terminates a multi-part reply.
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == msg_type::DONE
    }

    /// Check if this message is part of a multi-part reply.
    pub fn is_multi(&self) -> bool {
        self.nlmsg_flags & flags::MULTI != 0
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from the front of a buffer.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::ShortResponse {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Netlink and RTNETLINK message types used by this crate.
pub mod msg_type {
    /// Error message or ACK.
    pub const ERROR: u16 = 2;
    /// End of multipart message.
    pub const DONE: u16 = 3;

    pub const RTM_NEWLINK: u16 = 16;
    pub const RTM_DELLINK: u16 = 17;
    pub const RTM_GETLINK: u16 = 18;
    pub const RTM_SETLINK: u16 = 19;

    pub const RTM_NEWADDR: u16 = 20;
    pub const RTM_DELADDR: u16 = 21;
    pub const RTM_GETADDR: u16 = 22;

    pub const RTM_NEWROUTE: u16 = 24;
    pub const RTM_DELROUTE: u16 = 25;
    pub const RTM_GETROUTE: u16 = 26;

    pub const RTM_NEWNEIGH: u16 = 28;
    pub const RTM_DELNEIGH: u16 = 29;
    pub const RTM_GETNEIGH: u16 = 30;

    pub const RTM_NEWRULE: u16 = 32;
    pub const RTM_DELRULE: u16 = 33;
}

/// Netlink message flags.
pub mod flags {
    pub const REQUEST: u16 = 0x01;
    pub const MULTI: u16 = 0x02;
    pub const ACK: u16 = 0x04;
    pub const ECHO: u16 = 0x08;

    // GET request modifiers
    pub const ROOT: u16 = 0x100;
    pub const MATCH: u16 = 0x200;
    pub const DUMP: u16 = ROOT | MATCH;

    // NEW request modifiers
    pub const REPLACE: u16 = 0x100;
    pub const EXCL: u16 = 0x200;
    pub const CREATE: u16 = 0x400;
    pub const APPEND: u16 = 0x800;
}

/// Iterator over the kernel messages packed into one receive buffer.
///
/// A single page read from the socket may hold several messages; the iterator
/// walks them honoring each header's length field and the 4-byte alignment
/// between messages.
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    /// Create a new message iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<(&'a NlMsgHdr, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < NLMSG_HDRLEN {
            let item = Err(Error::ShortResponse {
                expected: NLMSG_HDRLEN,
                actual: self.data.len(),
            });
            self.data = &[];
            return Some(item);
        }

        let header = match NlMsgHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => {
                self.data = &[];
                return Some(Err(e));
            }
        };

        let msg_len = header.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > self.data.len() {
            self.data = &[];
            return Some(Err(Error::InvalidMessage(format!(
                "bad message length {msg_len} in {} byte buffer",
                self.data.len()
            ))));
        }

        let payload = &self.data[NLMSG_HDRLEN..msg_len];
        let aligned = nlmsg_align(msg_len);
        self.data = if aligned >= self.data.len() {
            &[]
        } else {
            &self.data[aligned..]
        };

        Some(Ok((header, payload)))
    }
}

/// Netlink error message payload (struct nlmsgerr).
///
/// An error code of zero is an acknowledgement, not a failure.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// Error code (negative errno, or 0 for ACK).
    pub error: i32,
    /// Header of the request that triggered this reply.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    /// Parse an error payload.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::ShortResponse {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }

    /// Check if this is an ACK.
    pub fn is_ack(&self) -> bool {
        self.error == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(nlmsg_align(0), 0);
        assert_eq!(nlmsg_align(1), 4);
        assert_eq!(nlmsg_align(4), 4);
        assert_eq!(nlmsg_align(17), 20);
        assert_eq!(NLMSG_HDRLEN, 16);
    }

    #[test]
    fn test_header_round_trip() {
        let mut hdr = NlMsgHdr::new(msg_type::RTM_GETROUTE, flags::REQUEST | flags::DUMP);
        hdr.nlmsg_seq = 7;
        hdr.nlmsg_pid = 1234;
        let parsed = NlMsgHdr::from_bytes(hdr.as_bytes()).unwrap();
        assert_eq!(parsed.nlmsg_type, msg_type::RTM_GETROUTE);
        assert_eq!(parsed.nlmsg_seq, 7);
        assert_eq!(parsed.nlmsg_pid, 1234);
    }

    #[test]
    fn test_short_buffer_is_error() {
        let buf = [0u8; 7];
        let mut iter = MessageIter::new(&buf);
        assert!(matches!(
            iter.next(),
            Some(Err(Error::ShortResponse { .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_iterates_packed_messages() {
        // Two empty DONE messages back to back.
        let mut buf = Vec::new();
        for seq in [1u32, 2] {
            let mut hdr = NlMsgHdr::new(msg_type::DONE, flags::MULTI);
            hdr.nlmsg_seq = seq;
            buf.extend_from_slice(hdr.as_bytes());
        }
        let headers: Vec<u32> = MessageIter::new(&buf)
            .map(|r| r.unwrap().0.nlmsg_seq)
            .collect();
        assert_eq!(headers, vec![1, 2]);
    }

    #[test]
    fn test_ack_detection() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0i32.to_ne_bytes());
        payload.extend_from_slice(NlMsgHdr::new(msg_type::RTM_NEWLINK, 0).as_bytes());
        let err = NlMsgError::from_bytes(&payload).unwrap();
        assert!(err.is_ack());

        let mut payload = Vec::new();
        payload.extend_from_slice(&(-libc::EEXIST).to_ne_bytes());
        payload.extend_from_slice(NlMsgHdr::new(msg_type::RTM_NEWADDR, 0).as_bytes());
        let err = NlMsgError::from_bytes(&payload).unwrap();
        assert!(!err.is_ack());
        assert_eq!(err.error, -libc::EEXIST);
    }
}
