//! Route model, request builder, and the client-side dump filter.

use std::fmt;
use std::net::IpAddr;

use super::addr::family_of;
use super::builder::MessageBuilder;
use super::error::Result;
use super::message::flags;
use super::types::{AF_INET, RtMsg, rt_proto, rt_table, rta, rtm_flags, rtn};
#[cfg(test)]
use super::types::rt_scope;

/// A kernel route, as sent to and decoded from RTNETLINK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    /// Address family (AF_INET / AF_INET6).
    pub family: u8,
    /// Destination prefix. `None` is the default route.
    pub dst: Option<(IpAddr, u8)>,
    /// Source-address hint.
    pub src: Option<IpAddr>,
    /// Next hop.
    pub gateway: Option<IpAddr>,
    /// Type of service.
    pub tos: u8,
    /// Routing table; 0 means main.
    pub table: u32,
    /// Installing protocol (RTPROT_*).
    pub protocol: u8,
    /// Scope (RT_SCOPE_*).
    pub scope: u8,
    /// Route type (RTN_*); defaults to unicast.
    pub rtype: u8,
    /// rtm_flags from the kernel.
    pub flags: u32,
    /// Metric.
    pub priority: u32,
    /// Output link index.
    pub link_index: u32,
    /// Input link index.
    pub in_link_index: u32,
}

impl Route {
    /// A unicast route to `dst` in the main table.
    pub fn unicast(dst: IpAddr, prefix_len: u8) -> Self {
        Self {
            family: family_of(dst),
            dst: Some((dst, prefix_len)),
            rtype: rtn::UNICAST,
            ..Default::default()
        }
    }

    /// A default route via `gateway`.
    pub fn default_via(gateway: IpAddr) -> Self {
        Self {
            family: family_of(gateway),
            gateway: Some(gateway),
            rtype: rtn::UNICAST,
            ..Default::default()
        }
    }

    pub fn gateway(mut self, gw: IpAddr) -> Self {
        self.gateway = Some(gw);
        self
    }

    pub fn link_index(mut self, index: u32) -> Self {
        self.link_index = index;
        self
    }

    pub fn table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    pub fn scope(mut self, scope: u8) -> Self {
        self.scope = scope;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Effective table id (header field or 0 = main).
    pub fn table_id(&self) -> u32 {
        if self.table == 0 {
            rt_table::MAIN as u32
        } else {
            self.table
        }
    }

    /// Whether the kernel cloned this route (never programmed by us).
    pub fn is_cloned(&self) -> bool {
        self.flags & rtm_flags::CLONED != 0
    }

    /// Build the RTM_NEWROUTE / RTM_DELROUTE request.
    pub(crate) fn build(&self, kind: u16, extra_flags: u16) -> Result<MessageBuilder> {
        let mut rtm = RtMsg::new();
        rtm.rtm_family = if self.family == 0 { AF_INET } else { self.family };
        rtm.rtm_tos = self.tos;
        // New routes default to proto "boot"; deletes leave an unset
        // protocol as the wildcard so kernel-installed routes match too.
        rtm.rtm_protocol = match (self.protocol, kind) {
            (0, super::message::msg_type::RTM_NEWROUTE) => rt_proto::BOOT,
            (p, _) => p,
        };
        rtm.rtm_scope = self.scope;
        rtm.rtm_type = if self.rtype == 0 { rtn::UNICAST } else { self.rtype };
        let table_id = self.table_id();
        rtm.rtm_table = if table_id <= u8::MAX as u32 {
            table_id as u8
        } else {
            rt_table::UNSPEC
        };
        if let Some((_, prefix_len)) = self.dst {
            rtm.rtm_dst_len = prefix_len;
        }

        let mut builder = MessageBuilder::new(kind, flags::REQUEST | flags::ACK | extra_flags);
        builder.append(&rtm);

        if let Some((dst, _)) = self.dst {
            append_ip(&mut builder, rta::DST, dst);
        }
        if let Some(src) = self.src {
            append_ip(&mut builder, rta::PREFSRC, src);
        }
        if let Some(gw) = self.gateway {
            append_ip(&mut builder, rta::GATEWAY, gw);
        }
        if self.link_index != 0 {
            builder.append_attr_u32(rta::OIF, self.link_index);
        }
        if self.in_link_index != 0 {
            builder.append_attr_u32(rta::IIF, self.in_link_index);
        }
        if self.priority != 0 {
            builder.append_attr_u32(rta::PRIORITY, self.priority);
        }
        if table_id > u8::MAX as u32 {
            builder.append_attr_u32(rta::TABLE, table_id);
        }
        Ok(builder)
    }
}

fn append_ip(builder: &mut MessageBuilder, attr: u16, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => builder.append_attr(attr, &v4.octets()),
        IpAddr::V6(v6) => builder.append_attr(attr, &v6.octets()),
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dst {
            Some((dst, len)) => write!(f, "{dst}/{len}")?,
            None => write!(f, "default")?,
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        if self.link_index != 0 {
            write!(f, " dev #{}", self.link_index)?;
        }
        if self.table != 0 {
            write!(f, " table {}", self.table)?;
        }
        Ok(())
    }
}

/// Client-side filter applied to route dumps.
///
/// The kernel dump returns every route for the family; filtering happens
/// after decode, mirroring the semantics callers rely on:
/// - cloned routes never match,
/// - table 0 selects the main table only,
/// - a zero protocol or link index means "any",
/// - a destination filter requires both address and width to match, and a
///   `None` destination matches only zero-width (default) routes.
#[derive(Debug, Clone)]
pub struct RouteFilter {
    /// Address family to dump.
    pub family: u8,
    /// Table to match; 0 = main table.
    pub table: u32,
    /// Protocol to match; 0 = any.
    pub protocol: u8,
    /// Destination prefix filter. `Some(None)` matches default routes only.
    pub dst: Option<Option<(IpAddr, u8)>>,
    /// Output link index; 0 = any.
    pub link_index: u32,
}

impl Default for RouteFilter {
    fn default() -> Self {
        Self {
            family: AF_INET,
            table: 0,
            protocol: 0,
            dst: None,
            link_index: 0,
        }
    }
}

impl RouteFilter {
    pub fn v4() -> Self {
        Self::default()
    }

    pub fn v6() -> Self {
        Self {
            family: super::types::AF_INET6,
            ..Self::default()
        }
    }

    pub fn table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Match a specific destination prefix.
    pub fn destination(mut self, dst: IpAddr, prefix_len: u8) -> Self {
        self.dst = Some(Some((dst, prefix_len)));
        self
    }

    /// Match default routes only.
    pub fn default_route(mut self) -> Self {
        self.dst = Some(None);
        self
    }

    pub fn link_index(mut self, index: u32) -> Self {
        self.link_index = index;
        self
    }

    /// Apply the filter to a decoded route.
    pub fn matches(&self, route: &Route) -> bool {
        if route.is_cloned() {
            return false;
        }

        let wanted_table = if self.table == 0 {
            rt_table::MAIN as u32
        } else {
            self.table
        };
        if route.table_id() != wanted_table {
            return false;
        }

        if self.protocol != 0 && route.protocol != self.protocol {
            return false;
        }

        if let Some(dst_filter) = self.dst {
            match (dst_filter, route.dst) {
                (None, None) => {}
                (None, Some(_)) | (Some(_), None) => return false,
                (Some((ip, len)), Some((rip, rlen))) => {
                    if ip != rip || len != rlen {
                        return false;
                    }
                }
            }
        }

        if self.link_index != 0 && route.link_index != self.link_index {
            return false;
        }

        true
    }
}
