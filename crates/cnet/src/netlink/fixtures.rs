//! Captured netlink payloads for parser tests.
//!
//! Each function returns the payload that follows the nlmsghdr, exactly as
//! the kernel lays it out on a little-endian machine. The buffers are built
//! with `to_ne_bytes` where a field is wider than one byte so the fixtures
//! stay valid on big-endian hosts too.

#![cfg(test)]

fn attr(kind: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&((payload.len() + 4) as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf.resize((buf.len() + 3) & !3, 0);
    buf
}

/// Link payload for the loopback interface, as returned by RTM_GETLINK.
pub fn link_loopback() -> Vec<u8> {
    let mut buf = Vec::new();
    // ifinfomsg: family=0, type=772 (ARPHRD_LOOPBACK), index=1,
    // flags=UP|LOOPBACK|RUNNING, change=0
    buf.push(0);
    buf.push(0);
    buf.extend_from_slice(&772u16.to_ne_bytes());
    buf.extend_from_slice(&1i32.to_ne_bytes());
    buf.extend_from_slice(&0x49u32.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());

    buf.extend_from_slice(&attr(3, b"lo\0")); // IFLA_IFNAME
    buf.extend_from_slice(&attr(4, &65536u32.to_ne_bytes())); // IFLA_MTU
    buf.extend_from_slice(&attr(13, &1000u32.to_ne_bytes())); // IFLA_TXQLEN
    buf
}

/// Address payload for 127.0.0.1/8 on loopback.
pub fn addr_loopback_v4() -> Vec<u8> {
    let mut buf = Vec::new();
    // ifaddrmsg: family=AF_INET, prefixlen=8, flags=PERMANENT, scope=HOST, index=1
    buf.push(2);
    buf.push(8);
    buf.push(0x80);
    buf.push(0xfe);
    buf.extend_from_slice(&1u32.to_ne_bytes());

    buf.extend_from_slice(&attr(1, &[127, 0, 0, 1])); // IFA_ADDRESS
    buf.extend_from_slice(&attr(2, &[127, 0, 0, 1])); // IFA_LOCAL
    buf.extend_from_slice(&attr(3, b"lo\0")); // IFA_LABEL
    buf
}

/// Route payload for a default route via 192.168.1.1 on link 2.
pub fn route_default_v4() -> Vec<u8> {
    let mut buf = Vec::new();
    // rtmsg: AF_INET, dst_len=0, src_len=0, tos=0, table=MAIN,
    // proto=STATIC, scope=UNIVERSE, type=UNICAST, flags=0
    buf.extend_from_slice(&[2, 0, 0, 0, 254, 4, 0, 1]);
    buf.extend_from_slice(&0u32.to_ne_bytes());

    buf.extend_from_slice(&attr(5, &[192, 168, 1, 1])); // RTA_GATEWAY
    buf.extend_from_slice(&attr(4, &2u32.to_ne_bytes())); // RTA_OIF
    buf
}

/// Route payload for a /32 host route to 10.0.0.4 out link 7.
pub fn route_host_v4() -> Vec<u8> {
    let mut buf = Vec::new();
    // rtmsg: AF_INET, dst_len=32, table=MAIN, proto=BOOT, scope=LINK, type=UNICAST
    buf.extend_from_slice(&[2, 32, 0, 0, 254, 3, 253, 1]);
    buf.extend_from_slice(&0u32.to_ne_bytes());

    buf.extend_from_slice(&attr(1, &[10, 0, 0, 4])); // RTA_DST
    buf.extend_from_slice(&attr(4, &7u32.to_ne_bytes())); // RTA_OIF
    buf
}

/// A full dump reply: two RTM_NEWROUTE messages then NLMSG_DONE, framed with
/// headers, as one receive buffer.
pub fn route_dump_reply(seq: u32, pid: u32) -> Vec<u8> {
    use crate::netlink::message::{NLMSG_HDRLEN, NlMsgHdr, flags, msg_type};

    let mut buf = Vec::new();
    for payload in [route_default_v4(), route_host_v4()] {
        let mut hdr = NlMsgHdr::new(msg_type::RTM_NEWROUTE, flags::MULTI);
        hdr.nlmsg_len = (NLMSG_HDRLEN + payload.len()) as u32;
        hdr.nlmsg_seq = seq;
        hdr.nlmsg_pid = pid;
        buf.extend_from_slice(hdr.as_bytes());
        buf.extend_from_slice(&payload);
    }

    let mut done = NlMsgHdr::new(msg_type::DONE, flags::MULTI);
    done.nlmsg_len = (NLMSG_HDRLEN + 4) as u32;
    done.nlmsg_seq = seq;
    done.nlmsg_pid = pid;
    buf.extend_from_slice(done.as_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf
}
