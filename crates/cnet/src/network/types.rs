//! Public data types: network and endpoint descriptors, address newtypes,
//! and the deterministic interface-naming scheme.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::Error;
use crate::netlink::route::Route;
use crate::netlink::types::{rt_proto, rt_scope};

// ============================================================================
// Address newtypes
// ============================================================================

/// An IP prefix in CIDR shape. Serializes as `"addr/len"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// Whether this prefix contains the address.
    pub fn contains(&self, ip: IpAddr) -> bool {
        use crate::netlink::addr::network_of;
        match (self.addr, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                network_of(ip, self.prefix_len) == network_of(self.addr, self.prefix_len)
            }
            _ => false,
        }
    }

    pub fn is_v6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpNet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| Error::MalformedIp(s.to_string()))?;
        let addr: IpAddr = addr.parse().map_err(|_| Error::MalformedIp(s.to_string()))?;
        let prefix_len: u8 = len.parse().map_err(|_| Error::MalformedIp(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(Error::MalformedIp(s.to_string()));
        }
        Ok(Self { addr, prefix_len })
    }
}

impl Serialize for IpNet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A hardware address. Serializes in colon notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::netif::format_mac(&self.0))
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        crate::netif::parse_mac(s)
            .map(MacAddr)
            .map_err(|_| Error::MalformedIp(s.to_string()))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Modes
// ============================================================================

/// How a network forwards container traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// Host bridge; containers share a Linux bridge.
    Bridge,
    /// Same bridge, VEPA-style egress: every frame hairpins via the fabric.
    #[default]
    Tunnel,
    /// No bridge; per-IP host routes and proxy-ARP.
    Transparent,
    /// Dedicated namespace per VLAN with policy-routed tunneling.
    TransparentVlan,
}

impl FromStr for NetworkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "" | "tunnel" => Ok(Self::Tunnel),
            "bridge" => Ok(Self::Bridge),
            "transparent" => Ok(Self::Transparent),
            "transparent-vlan" => Ok(Self::TransparentVlan),
            other => Err(Error::InvalidNetworkMode(other.to_string())),
        }
    }
}

/// IPv6 data-plane treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpV6Mode {
    /// IPv6 disabled.
    #[default]
    Disabled,
    /// NAT'd IPv6.
    Ipv6Nat,
}

impl IpV6Mode {
    pub fn enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

// ============================================================================
// DNS, subnets, routes
// ============================================================================

/// DNS configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsInfo {
    pub suffix: String,
    pub servers: Vec<String>,
    pub options: Vec<String>,
}

/// One subnet a network spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub prefix: IpNet,
    pub gateway: Option<IpAddr>,
    /// Primary host address inside the subnet, when one is reserved.
    pub primary_ip: Option<IpAddr>,
}

/// A route requested for an endpoint or saved from an external interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Destination; `None` is the default route.
    pub dst: Option<IpNet>,
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub scope: u8,
    #[serde(default)]
    pub protocol: u8,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub table: u32,
    /// Device the route binds to; resolved to an index at programming time.
    #[serde(default)]
    pub dev_name: String,
}

impl RouteInfo {
    /// Default route via a gateway.
    pub fn default_via(gateway: IpAddr) -> Self {
        Self {
            dst: None,
            gateway: Some(gateway),
            scope: rt_scope::UNIVERSE,
            protocol: 0,
            priority: 0,
            table: 0,
            dev_name: String::new(),
        }
    }

    /// Scoped link route to a prefix on a device.
    pub fn on_link(dst: IpNet, dev_name: impl Into<String>) -> Self {
        Self {
            dst: Some(dst),
            gateway: None,
            scope: rt_scope::LINK,
            protocol: 0,
            priority: 0,
            table: 0,
            dev_name: dev_name.into(),
        }
    }

    /// Lower to a netlink route, resolving the device name.
    pub fn to_route(&self) -> crate::netlink::Result<Route> {
        let mut route = match self.dst {
            Some(dst) => Route::unicast(dst.addr, dst.prefix_len),
            None => {
                let gw = self.gateway.ok_or_else(|| {
                    crate::netlink::Error::InvalidMessage(
                        "default route requires a gateway".into(),
                    )
                })?;
                Route::default_via(gw)
            }
        };
        if let Some(gw) = self.gateway {
            route = route.gateway(gw);
        }
        route.scope = self.scope;
        route.protocol = if self.protocol == 0 {
            rt_proto::BOOT
        } else {
            self.protocol
        };
        route.priority = self.priority;
        route.table = self.table;
        if !self.dev_name.is_empty() {
            route.link_index = crate::netif::ifindex(&self.dev_name)?;
        }
        Ok(route)
    }
}

// ============================================================================
// Network / endpoint descriptors
// ============================================================================

/// Everything needed to create a network.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    pub id: String,
    pub mode: NetworkMode,
    /// 0 means untagged. A non-zero vlan selects the OVS data plane.
    pub vlan_id: u16,
    pub subnets: Vec<SubnetInfo>,
    pub pod_subnet: Option<SubnetInfo>,
    pub dns: DnsInfo,
    pub bridge_name: String,
    pub enable_snat_on_host: bool,
    pub netns: String,
    pub snat_bridge_ip: Option<IpNet>,
    pub disable_hairpin_on_host_interface: bool,
    pub ipv6_mode: IpV6Mode,
    pub service_cidrs: Vec<IpNet>,
    /// Host NIC this network rides on.
    pub master_if_name: String,
    /// Platform adapter name, when it differs from the master interface.
    pub adapter_name: String,
    /// Opaque runtime policies, carried through untouched.
    pub policies: Vec<String>,
    /// IPAM driver the caller allocated addresses with.
    pub ipam_type: String,
    /// Mode-specific pass-through options.
    pub options: HashMap<String, String>,
}

/// Everything needed to create an endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointInfo {
    pub id: String,
    pub container_id: String,
    /// Path to the container's network namespace.
    pub netns_path: String,
    /// Interface name the container sees.
    pub if_name: String,
    pub ip_addresses: Vec<IpNet>,
    pub routes: Vec<RouteInfo>,
    pub mac_address: Option<MacAddr>,
    pub dns: DnsInfo,
    pub enable_snat_on_host: bool,
    pub enable_snat_for_dns: bool,
    pub enable_infra_vnet: bool,
    pub allow_inbound_from_host_to_nc: bool,
    pub allow_inbound_from_nc_to_host: bool,
    /// Prefixes punted to layer 3 on the host bridge.
    pub ips_to_route_via_host: Vec<IpNet>,
    pub infra_vnet_ip: Option<IpNet>,
    /// Address assigned to the SNAT-side container interface.
    pub local_ip: Option<IpNet>,
    pub ipv6_mode: IpV6Mode,
    pub vnet_cidrs: Vec<IpNet>,
    pub pod_name: String,
    pub pod_namespace: String,
    /// Mode-specific pass-through options.
    pub data: HashMap<String, String>,
}

impl EndpointInfo {
    /// Whether any SNAT feature is requested.
    pub fn wants_snat(&self) -> bool {
        self.enable_snat_on_host
            || self.enable_snat_for_dns
            || self.allow_inbound_from_host_to_nc
            || self.allow_inbound_from_nc_to_host
    }
}

// ============================================================================
// Deterministic naming
// ============================================================================

/// Well-known names and constants of the data plane.
pub mod names {
    /// SNAT bridge device.
    pub const SNAT_BRIDGE: &str = "azSnatbr";
    /// Link-local virtual gateway used by transparent modes.
    pub const VIRTUAL_GW_V4: &str = "169.254.1.1";
    /// IPv6 link-local virtual gateway.
    pub const VIRTUAL_GW_V6: &str = "fe80::1234:5678:9abc";
    /// Virtual MAC answering ARP in tunnel mode to force hairpinning.
    pub const VIRTUAL_MAC: &str = "12:34:56:78:9a:bc";
    /// Packet mark steering non-vlan traffic to the tunneling table.
    pub const TUNNEL_MARK: u32 = 333;
    /// Routing table holding the duplicated default route.
    pub const TUNNEL_TABLE: u8 = 2;
    /// iptables chains hooked under INPUT/OUTPUT for host<->NC traffic.
    pub const CNI_INPUT_CHAIN: &str = "CNIInputChain";
    pub const CNI_OUTPUT_CHAIN: &str = "CNIOutputChain";
}

fn id_prefix(endpoint_id: &str) -> &str {
    &endpoint_id[..endpoint_id.len().min(7)]
}

/// Host-side veth name for an endpoint.
pub fn host_veth_name(endpoint_id: &str) -> String {
    format!("veth{}", id_prefix(endpoint_id))
}

/// Container-side veth name before it is renamed inside the container.
pub fn container_veth_name(endpoint_id: &str) -> String {
    format!("veth{}-2", id_prefix(endpoint_id))
}

/// Host-side SNAT veth name. The prefix is short enough that name + id
/// prefix + peer suffix stays under the kernel's 15-character limit.
pub fn snat_veth_name(endpoint_id: &str) -> String {
    format!("snat{}", id_prefix(endpoint_id))
}

/// Container-side SNAT veth name.
pub fn snat_container_veth_name(endpoint_id: &str) -> String {
    format!("snat{}-2", id_prefix(endpoint_id))
}

/// Host-side infra-vnet veth name.
pub fn infra_veth_name(endpoint_id: &str) -> String {
    format!("infr{}", id_prefix(endpoint_id))
}

/// Container-side infra-vnet veth name.
pub fn infra_container_veth_name(endpoint_id: &str) -> String {
    format!("infr{}-2", id_prefix(endpoint_id))
}

/// Named namespace holding one VLAN's sub-interface and veths.
pub fn vnet_ns_name(vlan_id: u16) -> String {
    format!("az_ns_{vlan_id}")
}

/// VLAN sub-interface of the primary NIC.
pub fn vlan_if_name(primary_if: &str, vlan_id: u16) -> String {
    format!("{primary_if}_{vlan_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_pure_functions_of_id() {
        assert_eq!(host_veth_name("epabcdefg"), "vethepabcde");
        assert_eq!(container_veth_name("epabcdefg"), "vethepabcde-2");
        assert_eq!(snat_veth_name("epabcdefg"), "snatepabcde");
        assert_eq!(snat_container_veth_name("epabcdefg"), "snatepabcde-2");
        assert_eq!(infra_veth_name("epabcdefg"), "infrepabcde");
        assert_eq!(vnet_ns_name(1), "az_ns_1");
        assert_eq!(vlan_if_name("eth0", 1), "eth0_1");
        // Short ids use what they have.
        assert_eq!(host_veth_name("ab"), "vethab");

        // Every derived interface name fits the kernel's 15-char limit.
        for name in [
            host_veth_name("epabcdefg"),
            container_veth_name("epabcdefg"),
            snat_veth_name("epabcdefg"),
            snat_container_veth_name("epabcdefg"),
            infra_veth_name("epabcdefg"),
            infra_container_veth_name("epabcdefg"),
        ] {
            assert!(name.len() <= 15, "{name} is too long for an ifname");
        }
    }

    #[test]
    fn test_ipnet_parse_and_display() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/24");
        assert!(net.contains("10.0.0.17".parse().unwrap()));
        assert!(!net.contains("10.0.1.17".parse().unwrap()));
        assert!(!net.contains("fe80::1".parse().unwrap()));

        assert!(matches!(
            "10.0.0.0".parse::<IpNet>(),
            Err(Error::MalformedIp(_))
        ));
        assert!(matches!(
            "10.0.0.0/33".parse::<IpNet>(),
            Err(Error::MalformedIp(_))
        ));
    }

    #[test]
    fn test_ipnet_serde_round_trip() {
        let net: IpNet = "fc00::/64".parse().unwrap();
        let json = serde_json::to_string(&net).unwrap();
        assert_eq!(json, "\"fc00::/64\"");
        let back: IpNet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, net);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("bridge".parse::<NetworkMode>().unwrap(), NetworkMode::Bridge);
        assert_eq!("".parse::<NetworkMode>().unwrap(), NetworkMode::Tunnel);
        assert_eq!(
            "transparent-vlan".parse::<NetworkMode>().unwrap(),
            NetworkMode::TransparentVlan
        );
        assert!(matches!(
            "hns".parse::<NetworkMode>(),
            Err(Error::InvalidNetworkMode(_))
        ));
    }

    #[test]
    fn test_mac_serde() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"aa:bb:cc:dd:ee:ff\"");
        assert_eq!(serde_json::from_str::<MacAddr>(&json).unwrap(), mac);
    }

    #[test]
    fn test_route_info_default_requires_gateway() {
        let info = RouteInfo {
            dst: None,
            gateway: None,
            scope: 0,
            protocol: 0,
            priority: 0,
            table: 0,
            dev_name: String::new(),
        };
        assert!(info.to_route().is_err());
    }
}
