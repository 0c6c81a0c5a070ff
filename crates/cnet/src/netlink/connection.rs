//! RTNETLINK connection: request/reply correlation and high-level operations.

use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::path::Path;

use tracing::debug;

use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::link::LinkConfig;
use super::message::{MessageIter, NlMsgError, flags, msg_type};
use super::messages::{AddressMessage, LinkMessage};
use super::route::{Route, RouteFilter};
use super::socket::NetlinkSocket;
use super::types::{self, IfAddrMsg, IfInfoMsg, NdMsg, RtMsg, ifa, ifla, nda, ntf, nud};

/// Bridge family for port-level (protinfo) operations.
const AF_BRIDGE: u8 = 7;

/// A netlink connection to the kernel's routing subsystem.
///
/// The connection owns its socket and never leaves the namespace the socket
/// was created in; requests made concurrently from several tasks serialize
/// on an internal lock so replies cannot interleave.
pub struct Connection {
    socket: NetlinkSocket,
    /// Held across each send/receive exchange.
    io_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Create a connection in the current network namespace.
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new()?,
            io_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Create a connection whose socket lives in the namespace behind `ns_fd`.
    pub fn in_namespace(ns_fd: RawFd) -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new_in_namespace(ns_fd)?,
            io_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Create a connection for the namespace at `ns_path`
    /// (`/var/run/netns/<name>` or `/proc/<pid>/ns/net`).
    pub fn in_namespace_path<P: AsRef<Path>>(ns_path: P) -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new_in_namespace_path(ns_path)?,
            io_lock: tokio::sync::Mutex::new(()),
        })
    }

    // ========================================================================
    // Request primitives
    // ========================================================================

    /// Send a request and wait for its acknowledgement.
    pub(crate) async fn request_ack(&self, mut builder: MessageBuilder) -> Result<()> {
        let _io = self.io_lock.lock().await;

        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());
        self.socket.send(&builder.finish()).await?;

        loop {
            let page = self.socket.recv_page().await?;
            for item in MessageIter::new(&page) {
                let (header, payload) = item?;
                if !self.matches(header, seq) {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if err.is_ack() {
                        return Ok(());
                    }
                    return Err(Error::from_errno(err.error));
                }
            }
        }
    }

    /// Send a request and return the raw payloads of its data replies.
    ///
    /// A single-shot request yields one payload; a dump (caller sets the DUMP
    /// flag) yields every part until the kernel's DONE, a zero-code error
    /// acknowledgement, or a failure code.
    pub(crate) async fn request_data(&self, mut builder: MessageBuilder) -> Result<Vec<Vec<u8>>> {
        let is_dump = {
            let hdr = super::message::NlMsgHdr::from_bytes(builder.as_bytes())?;
            hdr.nlmsg_flags & flags::DUMP == flags::DUMP
        };

        let _io = self.io_lock.lock().await;

        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());
        self.socket.send(&builder.finish()).await?;

        let mut parts = Vec::new();
        loop {
            let page = self.socket.recv_page().await?;
            for item in MessageIter::new(&page) {
                let (header, payload) = item?;
                if !self.matches(header, seq) {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if err.is_ack() {
                        return Ok(parts);
                    }
                    return Err(Error::from_errno(err.error));
                }
                if header.is_done() {
                    return Ok(parts);
                }
                let is_multi = header.is_multi();
                parts.push(payload.to_vec());
                if !is_dump && !is_multi {
                    // Single-shot reply; nothing more is coming.
                    return Ok(parts);
                }
            }
        }
    }

    /// A reply belongs to us iff both sequence and port ID match the request.
    /// Anything else is another requester's traffic and is dropped silently.
    fn matches(&self, header: &super::message::NlMsgHdr, seq: u32) -> bool {
        if header.nlmsg_seq != seq || header.nlmsg_pid != self.socket.pid() {
            debug!(
                seq = header.nlmsg_seq,
                pid = header.nlmsg_pid,
                expected_seq = seq,
                expected_pid = self.socket.pid(),
                "dropping mismatched netlink reply"
            );
            return false;
        }
        true
    }

    /// Resolve an interface name to its index through this connection's own
    /// socket. Resolution must not go through the host's sysfs: this
    /// connection may live in another namespace where the same name means a
    /// different device.
    pub async fn ifindex(&self, name: &str) -> Result<u32> {
        let mut builder = MessageBuilder::new(msg_type::RTM_GETLINK, flags::REQUEST);
        builder.append(&IfInfoMsg::new());
        builder.append_attr_str(ifla::IFNAME, name);

        let parts = self.request_data(builder).await.map_err(|e| {
            if e.is_not_found() {
                Error::InterfaceNotFound { name: name.into() }
            } else {
                e
            }
        })?;
        let payload = parts
            .first()
            .ok_or_else(|| Error::InterfaceNotFound { name: name.into() })?;
        Ok(LinkMessage::parse(payload)?.ifindex())
    }

    // ========================================================================
    // Probes
    // ========================================================================

    /// Round-trip probe: ask for the loopback link and check the reply comes
    /// back correlated. Verifies the socket is alive in its namespace.
    pub async fn echo(&self) -> Result<()> {
        let mut builder = MessageBuilder::new(msg_type::RTM_GETLINK, flags::REQUEST);
        builder.append(&IfInfoMsg::new().with_index(1));
        let parts = self.request_data(builder).await?;
        if parts.is_empty() {
            return Err(Error::InvalidMessage("no reply to echo probe".into()));
        }
        Ok(())
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Create a virtual link from a descriptor.
    pub async fn add_link(&self, link: impl LinkConfig) -> Result<()> {
        let builder = link.build()?;
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("adding link {}", link.name())))
    }

    /// Delete a link by name. Veth peers vanish together.
    pub async fn delete_link(&self, name: &str) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let mut builder = MessageBuilder::new(msg_type::RTM_DELLINK, flags::REQUEST | flags::ACK);
        builder.append(&IfInfoMsg::new().with_index(ifindex as i32));
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("deleting link {name}")))
    }

    /// Rename a link. The link should be down while renamed.
    pub async fn rename_link(&self, name: &str, new_name: &str) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let mut builder = MessageBuilder::new(msg_type::RTM_SETLINK, flags::REQUEST | flags::ACK);
        builder.append(&IfInfoMsg::new().with_index(ifindex as i32));
        builder.append_attr_str(ifla::IFNAME, new_name);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("renaming link {name} to {new_name}")))
    }

    /// Bring a link up or down.
    pub async fn set_link_state(&self, name: &str, up: bool) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let mut ifinfo = IfInfoMsg::new().with_index(ifindex as i32);
        ifinfo.ifi_flags = if up { types::iff::UP } else { 0 };
        ifinfo.ifi_change = types::iff::UP;

        let mut builder = MessageBuilder::new(msg_type::RTM_SETLINK, flags::REQUEST | flags::ACK);
        builder.append(&ifinfo);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("setting link {name} {}", if up { "up" } else { "down" })))
    }

    /// Set a link's MTU.
    pub async fn set_link_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let mut builder = MessageBuilder::new(msg_type::RTM_SETLINK, flags::REQUEST | flags::ACK);
        builder.append(&IfInfoMsg::new().with_index(ifindex as i32));
        builder.append_attr_u32(ifla::MTU, mtu);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("setting mtu {mtu} on {name}")))
    }

    /// Attach a link to a master device (bridge); empty master detaches.
    pub async fn set_link_master(&self, name: &str, master: &str) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let master_index = if master.is_empty() {
            0
        } else {
            self.ifindex(master).await?
        };
        let mut builder = MessageBuilder::new(msg_type::RTM_SETLINK, flags::REQUEST | flags::ACK);
        builder.append(&IfInfoMsg::new().with_index(ifindex as i32));
        builder.append_attr_u32(ifla::MASTER, master_index);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("setting master of {name} to {master:?}")))
    }

    /// Move a link into the namespace behind an open fd.
    pub async fn set_link_netns(&self, name: &str, ns_fd: RawFd) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let mut builder = MessageBuilder::new(msg_type::RTM_SETLINK, flags::REQUEST | flags::ACK);
        builder.append(&IfInfoMsg::new().with_index(ifindex as i32));
        builder.append_attr_u32(ifla::NET_NS_FD, ns_fd as u32);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("moving link {name} to another namespace")))
    }

    /// Set a link's hardware address.
    pub async fn set_link_address(&self, name: &str, mac: [u8; 6]) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let mut builder = MessageBuilder::new(msg_type::RTM_SETLINK, flags::REQUEST | flags::ACK);
        builder.append(&IfInfoMsg::new().with_index(ifindex as i32));
        builder.append_attr(ifla::ADDRESS, &mac);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("setting address on {name}")))
    }

    /// Toggle promiscuous mode on a link.
    pub async fn set_link_promisc(&self, name: &str, on: bool) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let mut ifinfo = IfInfoMsg::new().with_index(ifindex as i32);
        ifinfo.ifi_flags = if on { types::iff::PROMISC } else { 0 };
        ifinfo.ifi_change = types::iff::PROMISC;

        let mut builder = MessageBuilder::new(msg_type::RTM_SETLINK, flags::REQUEST | flags::ACK);
        builder.append(&ifinfo);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("setting promiscuous mode on {name}")))
    }

    /// Toggle hairpin (reflective relay) on a bridge port.
    pub async fn set_link_hairpin(&self, name: &str, on: bool) -> Result<()> {
        let ifindex = self.ifindex(name).await?;
        let mut ifinfo = IfInfoMsg::new().with_index(ifindex as i32);
        ifinfo.ifi_family = AF_BRIDGE;

        let mut builder = MessageBuilder::new(msg_type::RTM_SETLINK, flags::REQUEST | flags::ACK);
        builder.append(&ifinfo);
        let nest = builder.nest_start(types::IFLA_PROTINFO);
        builder.append_attr_u8(ifla::brport::MODE, on as u8);
        builder.nest_end(nest);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("setting hairpin on {name}")))
    }

    /// Dump every link visible in this namespace.
    pub async fn get_links(&self) -> Result<Vec<LinkMessage>> {
        let mut builder = MessageBuilder::new(msg_type::RTM_GETLINK, flags::REQUEST | flags::DUMP);
        builder.append(&IfInfoMsg::new());
        let parts = self.request_data(builder).await?;
        Ok(parts
            .iter()
            .filter_map(|p| LinkMessage::parse(p).ok())
            .collect())
    }

    /// Look up one link by name.
    pub async fn get_link_by_name(&self, name: &str) -> Result<LinkMessage> {
        let links = self.get_links().await?;
        links
            .into_iter()
            .find(|l| l.name.as_deref() == Some(name))
            .ok_or_else(|| Error::InterfaceNotFound { name: name.into() })
    }

    // ========================================================================
    // Neighbors (static ARP)
    // ========================================================================

    /// Install a permanent neighbor entry for `ip` on `ifname`.
    ///
    /// With `proxy` set the entry is a proxy-ARP entry: the host answers ARP
    /// for the address itself rather than caching a mapping.
    pub async fn add_static_arp(
        &self,
        ifname: &str,
        ip: IpAddr,
        mac: [u8; 6],
        proxy: bool,
    ) -> Result<()> {
        let builder = self
            .neigh_request(msg_type::RTM_NEWNEIGH, flags::CREATE | flags::REPLACE, ifname, ip, Some(mac), proxy)
            .await?;
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("adding static arp for {ip} on {ifname}")))
    }

    /// Remove a neighbor entry for `ip` on `ifname`.
    pub async fn delete_static_arp(&self, ifname: &str, ip: IpAddr, proxy: bool) -> Result<()> {
        let builder = self
            .neigh_request(msg_type::RTM_DELNEIGH, 0, ifname, ip, None, proxy)
            .await?;
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("deleting static arp for {ip} on {ifname}")))
    }

    async fn neigh_request(
        &self,
        kind: u16,
        extra_flags: u16,
        ifname: &str,
        ip: IpAddr,
        mac: Option<[u8; 6]>,
        proxy: bool,
    ) -> Result<MessageBuilder> {
        let ifindex = self.ifindex(ifname).await?;
        let mut ndm = NdMsg::new();
        ndm.ndm_family = super::addr::family_of(ip);
        ndm.ndm_ifindex = ifindex as i32;
        ndm.ndm_state = nud::PERMANENT;
        if proxy {
            ndm.ndm_flags = ntf::PROXY;
        }

        let mut builder = MessageBuilder::new(kind, flags::REQUEST | flags::ACK | extra_flags);
        builder.append(&ndm);
        match ip {
            IpAddr::V4(v4) => builder.append_attr(nda::DST, &v4.octets()),
            IpAddr::V6(v6) => builder.append_attr(nda::DST, &v6.octets()),
        }
        if let Some(mac) = mac {
            builder.append_attr(nda::LLADDR, &mac);
        }
        Ok(builder)
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    /// Assign an address to a link. EEXIST is surfaced; callers that want
    /// idempotency wrap with [`super::error::ok_if_exists`].
    pub async fn add_ip_address(&self, ifname: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let builder = self
            .addr_request(msg_type::RTM_NEWADDR, flags::CREATE | flags::EXCL, ifname, addr, prefix_len)
            .await?;
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("adding address {addr}/{prefix_len} to {ifname}")))
    }

    /// Remove an address from a link.
    pub async fn delete_ip_address(&self, ifname: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let builder = self
            .addr_request(msg_type::RTM_DELADDR, 0, ifname, addr, prefix_len)
            .await?;
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("deleting address {addr}/{prefix_len} from {ifname}")))
    }

    async fn addr_request(
        &self,
        kind: u16,
        extra_flags: u16,
        ifname: &str,
        addr: IpAddr,
        prefix_len: u8,
    ) -> Result<MessageBuilder> {
        let ifindex = self.ifindex(ifname).await?;
        let mut ifa_msg = IfAddrMsg::new();
        ifa_msg.ifa_family = super::addr::family_of(addr);
        ifa_msg.ifa_prefixlen = prefix_len;
        ifa_msg.ifa_index = ifindex;

        let mut builder = MessageBuilder::new(kind, flags::REQUEST | flags::ACK | extra_flags);
        builder.append(&ifa_msg);
        match addr {
            IpAddr::V4(v4) => {
                builder.append_attr(ifa::LOCAL, &v4.octets());
                builder.append_attr(ifa::ADDRESS, &v4.octets());
                if let Some(bcast) = super::addr::v4_broadcast(v4, prefix_len) {
                    builder.append_attr(ifa::BROADCAST, &bcast.octets());
                }
            }
            IpAddr::V6(v6) => {
                builder.append_attr(ifa::LOCAL, &v6.octets());
                builder.append_attr(ifa::ADDRESS, &v6.octets());
            }
        }
        Ok(builder)
    }

    /// Dump addresses, optionally restricted to one link.
    pub async fn get_addresses(&self, ifname: Option<&str>) -> Result<Vec<AddressMessage>> {
        let mut builder = MessageBuilder::new(msg_type::RTM_GETADDR, flags::REQUEST | flags::DUMP);
        builder.append(&IfAddrMsg::new());
        let parts = self.request_data(builder).await?;
        let mut addrs: Vec<AddressMessage> = parts
            .iter()
            .filter_map(|p| AddressMessage::parse(p).ok())
            .collect();
        if let Some(name) = ifname {
            let ifindex = self.ifindex(name).await?;
            addrs.retain(|a| a.ifindex() == ifindex);
        }
        Ok(addrs)
    }

    // ========================================================================
    // Routes
    // ========================================================================

    /// Dump routes and apply the client-side filter.
    pub async fn get_routes(&self, filter: &RouteFilter) -> Result<Vec<Route>> {
        let mut builder = MessageBuilder::new(msg_type::RTM_GETROUTE, flags::REQUEST | flags::DUMP);
        let mut rtm = RtMsg::new();
        rtm.rtm_family = filter.family;
        builder.append(&rtm);

        let parts = self.request_data(builder).await?;
        Ok(parts
            .iter()
            .filter_map(|p| super::messages::parse_route(p).ok())
            .filter(|r| filter.matches(r))
            .collect())
    }

    /// Install a route. EEXIST is surfaced for the caller to collapse.
    pub async fn add_route(&self, route: &Route) -> Result<()> {
        let builder = route.build(msg_type::RTM_NEWROUTE, flags::CREATE | flags::EXCL)?;
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("adding route {route}")))
    }

    /// Remove a route.
    pub async fn delete_route(&self, route: &Route) -> Result<()> {
        let builder = route.build(msg_type::RTM_DELROUTE, 0)?;
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("deleting route {route}")))
    }

    // ========================================================================
    // Policy rules
    // ========================================================================

    /// Add a policy rule sending fwmark-tagged traffic to a routing table.
    pub async fn add_fwmark_rule(&self, mark: u32, table: u8) -> Result<()> {
        let builder = Self::fwmark_rule(msg_type::RTM_NEWRULE, flags::CREATE | flags::EXCL, mark, table);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("adding fwmark {mark} rule to table {table}")))
    }

    /// Delete a fwmark policy rule.
    pub async fn delete_fwmark_rule(&self, mark: u32, table: u8) -> Result<()> {
        let builder = Self::fwmark_rule(msg_type::RTM_DELRULE, 0, mark, table);
        self.request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("deleting fwmark {mark} rule")))
    }

    fn fwmark_rule(kind: u16, extra_flags: u16, mark: u32, table: u8) -> MessageBuilder {
        let mut hdr = types::FibRuleHdr::new();
        hdr.family = types::AF_INET;
        hdr.action = types::FR_ACT_TO_TBL;
        hdr.table = table;

        let mut builder = MessageBuilder::new(kind, flags::REQUEST | flags::ACK | extra_flags);
        builder.append(&hdr);
        builder.append_attr_u32(types::fra::FWMARK, mark);
        builder
    }
}
