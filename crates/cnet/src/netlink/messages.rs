//! Decoders for the kernel's reply payloads.
//!
//! Replies carry a fixed ancillary header followed by TLV attributes; the
//! fixed part is consumed with winnow combinators and the attribute stream
//! with [`parse_attr`]. Integer fields use the host's byte order, which is
//! what RTNETLINK puts on the wire regardless of machine endianness.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use winnow::binary::{Endianness, u8 as wu8, u16 as wu16, u32 as wu32};
use winnow::error::ContextError;
use winnow::prelude::*;
use winnow::token::take;

use super::attr::AttrIter;
use super::error::{Error, Result};
use super::route::Route;
use super::types::{AF_INET, AF_INET6, ifa, ifla, rta};

/// Result type for winnow parsers.
pub type PResult<T> = core::result::Result<T, winnow::error::ErrMode<ContextError>>;

const NE: Endianness = Endianness::Native;

fn fail<T>() -> PResult<T> {
    Err(winnow::error::ErrMode::Cut(ContextError::new()))
}

/// Parse one attribute header and payload, consuming trailing padding.
pub fn parse_attr<'a>(input: &mut &'a [u8]) -> PResult<(u16, &'a [u8])> {
    let len = wu16(NE).parse_next(input)? as usize;
    let attr_type = wu16(NE).parse_next(input)?;
    if len < 4 {
        return fail();
    }

    let payload: &[u8] = take(len - 4).parse_next(input)?;

    let aligned = (len + 3) & !3;
    let padding = aligned - len;
    if input.len() >= padding {
        let _: &[u8] = take(padding).parse_next(input)?;
    } else {
        *input = &[];
    }

    Ok((attr_type & super::attr::NLA_TYPE_MASK, payload))
}

/// Parse all remaining attributes.
pub fn parse_attrs<'a>(input: &mut &'a [u8]) -> PResult<Vec<(u16, &'a [u8])>> {
    let mut attrs = Vec::new();
    while input.len() >= 4 {
        match parse_attr(input) {
            Ok(attr) => attrs.push(attr),
            Err(_) => break,
        }
    }
    Ok(attrs)
}

/// Decode an IP address payload by its length.
fn ip_from_payload(data: &[u8]) -> Option<IpAddr> {
    match data.len() {
        4 => {
            let octets: [u8; 4] = data.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = data.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

// ============================================================================
// Links
// ============================================================================

/// A decoded RTM_NEWLINK reply.
#[derive(Debug, Clone, Default)]
pub struct LinkMessage {
    /// Interface index.
    pub index: i32,
    /// Interface flags (IFF_*).
    pub flags: u32,
    /// Interface name (IFLA_IFNAME).
    pub name: Option<String>,
    /// Hardware address (IFLA_ADDRESS).
    pub mac: Option<[u8; 6]>,
    /// MTU (IFLA_MTU).
    pub mtu: Option<u32>,
    /// Master device index (IFLA_MASTER).
    pub master: Option<u32>,
    /// Link kind from the LINKINFO nest ("veth", "bridge", ...).
    pub kind: Option<String>,
}

impl LinkMessage {
    /// Parse from a message payload (after the nlmsghdr).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut input = payload;
        Self::parse_impl(&mut input).map_err(|e| Error::Parse(format!("link message: {e}")))
    }

    fn parse_impl(input: &mut &[u8]) -> PResult<Self> {
        let _family = wu8.parse_next(input)?;
        let _pad = wu8.parse_next(input)?;
        let _iftype = wu16(NE).parse_next(input)?;
        let index = wu32(NE).parse_next(input)? as i32;
        let flags = wu32(NE).parse_next(input)?;
        let _change = wu32(NE).parse_next(input)?;

        let mut msg = Self {
            index,
            flags,
            ..Default::default()
        };

        for (kind, payload) in parse_attrs(input)? {
            match kind {
                ifla::IFNAME => {
                    msg.name = super::attr::get::string(payload).ok().map(str::to_string);
                }
                ifla::ADDRESS => {
                    msg.mac = super::attr::get::mac(payload).ok();
                }
                ifla::MTU => {
                    msg.mtu = super::attr::get::u32_ne(payload).ok();
                }
                ifla::MASTER => {
                    msg.master = super::attr::get::u32_ne(payload).ok();
                }
                ifla::LINKINFO => {
                    for (inner, data) in AttrIter::new(payload) {
                        if inner == ifla::info::KIND {
                            msg.kind =
                                super::attr::get::string(data).ok().map(str::to_string);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(msg)
    }

    /// Interface index as unsigned.
    pub fn ifindex(&self) -> u32 {
        self.index as u32
    }

    /// Whether the interface is administratively up.
    pub fn is_up(&self) -> bool {
        self.flags & super::types::iff::UP != 0
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// A decoded RTM_NEWADDR reply.
#[derive(Debug, Clone, Default)]
pub struct AddressMessage {
    /// Address family.
    pub family: u8,
    /// Prefix length.
    pub prefix_len: u8,
    /// Interface index.
    pub index: u32,
    /// The address itself (IFA_LOCAL preferred, IFA_ADDRESS otherwise).
    pub address: Option<IpAddr>,
    /// Address label (IFA_LABEL).
    pub label: Option<String>,
}

impl AddressMessage {
    /// Parse from a message payload (after the nlmsghdr).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut input = payload;
        Self::parse_impl(&mut input).map_err(|e| Error::Parse(format!("address message: {e}")))
    }

    fn parse_impl(input: &mut &[u8]) -> PResult<Self> {
        let family = wu8.parse_next(input)?;
        let prefix_len = wu8.parse_next(input)?;
        let _flags = wu8.parse_next(input)?;
        let _scope = wu8.parse_next(input)?;
        let index = wu32(NE).parse_next(input)?;

        let mut msg = Self {
            family,
            prefix_len,
            index,
            ..Default::default()
        };

        let mut fallback = None;
        for (kind, payload) in parse_attrs(input)? {
            match kind {
                ifa::LOCAL => msg.address = ip_from_payload(payload),
                ifa::ADDRESS => fallback = ip_from_payload(payload),
                ifa::LABEL => {
                    msg.label = super::attr::get::string(payload).ok().map(str::to_string);
                }
                _ => {}
            }
        }
        if msg.address.is_none() {
            msg.address = fallback;
        }
        Ok(msg)
    }

    /// Interface index.
    pub fn ifindex(&self) -> u32 {
        self.index
    }

    /// Whether this is an IPv6 address.
    pub fn is_v6(&self) -> bool {
        self.family == AF_INET6
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Parse an RTM_NEWROUTE payload into a [`Route`].
pub fn parse_route(payload: &[u8]) -> Result<Route> {
    let mut input = payload;
    parse_route_impl(&mut input).map_err(|e| Error::Parse(format!("route message: {e}")))
}

fn parse_route_impl(input: &mut &[u8]) -> PResult<Route> {
    let family = wu8.parse_next(input)?;
    let dst_len = wu8.parse_next(input)?;
    let _src_len = wu8.parse_next(input)?;
    let tos = wu8.parse_next(input)?;
    let table = wu8.parse_next(input)?;
    let protocol = wu8.parse_next(input)?;
    let scope = wu8.parse_next(input)?;
    let rtype = wu8.parse_next(input)?;
    let flags = wu32(NE).parse_next(input)?;

    if family != AF_INET && family != AF_INET6 {
        return fail();
    }

    let mut route = Route {
        family,
        tos,
        table: table as u32,
        protocol,
        scope,
        rtype,
        flags,
        ..Default::default()
    };

    for (kind, payload) in parse_attrs(input)? {
        match kind {
            rta::DST => {
                if let Some(ip) = ip_from_payload(payload) {
                    route.dst = Some((ip, dst_len));
                }
            }
            rta::PREFSRC => route.src = ip_from_payload(payload),
            rta::GATEWAY => route.gateway = ip_from_payload(payload),
            rta::OIF => {
                route.link_index = super::attr::get::u32_ne(payload).unwrap_or(0);
            }
            rta::IIF => {
                route.in_link_index = super::attr::get::u32_ne(payload).unwrap_or(0);
            }
            rta::PRIORITY => {
                route.priority = super::attr::get::u32_ne(payload).unwrap_or(0);
            }
            rta::TABLE => {
                route.table = super::attr::get::u32_ne(payload).unwrap_or(route.table);
            }
            _ => {}
        }
    }

    Ok(route)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::fixtures;

    #[test]
    fn test_parse_link_fixture() {
        let msg = LinkMessage::parse(&fixtures::link_loopback()).unwrap();
        assert_eq!(msg.index, 1);
        assert_eq!(msg.name.as_deref(), Some("lo"));
        assert_eq!(msg.mtu, Some(65536));
        assert!(msg.is_up());
    }

    #[test]
    fn test_parse_address_fixture() {
        let msg = AddressMessage::parse(&fixtures::addr_loopback_v4()).unwrap();
        assert_eq!(msg.family, AF_INET);
        assert_eq!(msg.prefix_len, 8);
        assert_eq!(msg.ifindex(), 1);
        assert_eq!(msg.address, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(msg.label.as_deref(), Some("lo"));
    }

    #[test]
    fn test_parse_default_route_fixture() {
        let route = parse_route(&fixtures::route_default_v4()).unwrap();
        assert_eq!(route.family, AF_INET);
        assert!(route.dst.is_none());
        assert_eq!(route.gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(route.link_index, 2);
    }

    #[test]
    fn test_parse_host_route_fixture() {
        let route = parse_route(&fixtures::route_host_v4()).unwrap();
        assert_eq!(route.dst, Some(("10.0.0.4".parse().unwrap(), 32)));
        assert_eq!(route.link_index, 7);
        assert!(route.gateway.is_none());
    }

    #[test]
    fn test_route_dump_reply_yields_exactly_two_routes() {
        use crate::netlink::message::{MessageIter, msg_type};

        let buf = fixtures::route_dump_reply(9, 4242);
        let mut routes = Vec::new();
        let mut done = false;
        for item in MessageIter::new(&buf) {
            let (hdr, payload) = item.unwrap();
            assert_eq!(hdr.nlmsg_seq, 9);
            assert_eq!(hdr.nlmsg_pid, 4242);
            if hdr.is_done() {
                done = true;
                break;
            }
            assert_eq!(hdr.nlmsg_type, msg_type::RTM_NEWROUTE);
            routes.push(parse_route(payload).unwrap());
        }
        assert!(done, "dump must terminate with DONE");
        assert_eq!(routes.len(), 2);
        assert!(routes[0].dst.is_none());
        assert_eq!(routes[0].gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(routes[1].dst, Some(("10.0.0.4".parse().unwrap(), 32)));
        assert_eq!(routes[1].link_index, 7);
    }

    #[test]
    fn test_link_round_trip_through_attr_iter() {
        // The attribute stream survives parse -> re-encode -> parse.
        let payload = fixtures::link_loopback();
        let mut input = &payload[16..];
        let attrs = parse_attrs(&mut input).unwrap();

        let mut rebuilt = Vec::new();
        for (kind, data) in &attrs {
            let attr = crate::netlink::attr::NlAttr::new(*kind, data.len());
            rebuilt.extend_from_slice(attr.as_bytes());
            rebuilt.extend_from_slice(data);
            rebuilt.resize(crate::netlink::attr::nla_align(rebuilt.len()), 0);
        }
        assert_eq!(&payload[16..], rebuilt.as_slice());
    }
}
