//! Persisted records: endpoints, networks, external interfaces, and the
//! state document that wraps them.
//!
//! Children are indexed by id; the network's back-reference to its external
//! interface is deliberately not serialized and is recomputed after load.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::types::{
    DnsInfo, EndpointInfo, IpNet, IpV6Mode, MacAddr, NetworkInfo, NetworkMode, RouteInfo,
    SubnetInfo, host_veth_name,
};

/// Store key the state document lives under.
pub const STORE_KEY: &str = "Network";

/// Version stamped into every persisted document.
pub const STATE_VERSION: &str = "v2";

/// One container attachment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    pub id: String,
    pub container_id: String,
    /// Container runtime handle; set by attach, cleared by detach.
    pub sandbox_key: String,
    /// Interface name inside the container.
    pub if_name: String,
    /// Host-side veth name.
    pub host_if_name: String,
    pub mac_address: MacAddr,
    #[serde(rename = "IPAddresses")]
    pub ip_addresses: Vec<IpNet>,
    pub gateways: Vec<IpAddr>,
    pub routes: Vec<RouteInfo>,
    pub vlan_id: u16,
    pub enable_snat_on_host: bool,
    pub enable_snat_for_dns: bool,
    pub enable_infra_vnet: bool,
    #[serde(rename = "AllowInboundFromHostToNC")]
    pub allow_inbound_from_host_to_nc: bool,
    #[serde(rename = "AllowInboundFromNCToHost")]
    pub allow_inbound_from_nc_to_host: bool,
    #[serde(rename = "IPsToRouteViaHost")]
    pub ips_to_route_via_host: Vec<IpNet>,
    pub infra_vnet_ip: Option<IpNet>,
    #[serde(rename = "LocalIP")]
    pub local_ip: Option<IpNet>,
    pub netns_path: String,
    #[serde(rename = "IPV6Mode")]
    pub ipv6_mode: IpV6Mode,
    pub pod_name: String,
    pub pod_namespace: String,
}

impl Endpoint {
    /// Seed a record from a creation request; the MAC is filled in once the
    /// veth pair exists.
    pub fn from_info(info: &EndpointInfo, vlan_id: u16) -> Self {
        Self {
            id: info.id.clone(),
            container_id: info.container_id.clone(),
            sandbox_key: String::new(),
            if_name: info.if_name.clone(),
            host_if_name: host_veth_name(&info.id),
            mac_address: info.mac_address.unwrap_or_default(),
            ip_addresses: info.ip_addresses.clone(),
            gateways: info.routes.iter().filter_map(|r| r.gateway).collect(),
            routes: info.routes.clone(),
            vlan_id,
            enable_snat_on_host: info.enable_snat_on_host,
            enable_snat_for_dns: info.enable_snat_for_dns,
            enable_infra_vnet: info.enable_infra_vnet,
            allow_inbound_from_host_to_nc: info.allow_inbound_from_host_to_nc,
            allow_inbound_from_nc_to_host: info.allow_inbound_from_nc_to_host,
            ips_to_route_via_host: info.ips_to_route_via_host.clone(),
            infra_vnet_ip: info.infra_vnet_ip,
            local_ip: info.local_ip,
            netns_path: info.netns_path.clone(),
            ipv6_mode: info.ipv6_mode,
            pod_name: info.pod_name.clone(),
            pod_namespace: info.pod_namespace.clone(),
        }
    }

    /// Project the record back into the info shape callers consume.
    pub fn to_info(&self) -> EndpointInfo {
        EndpointInfo {
            id: self.id.clone(),
            container_id: self.container_id.clone(),
            netns_path: self.netns_path.clone(),
            if_name: self.if_name.clone(),
            ip_addresses: self.ip_addresses.clone(),
            routes: self.routes.clone(),
            mac_address: Some(self.mac_address),
            enable_snat_on_host: self.enable_snat_on_host,
            enable_snat_for_dns: self.enable_snat_for_dns,
            enable_infra_vnet: self.enable_infra_vnet,
            allow_inbound_from_host_to_nc: self.allow_inbound_from_host_to_nc,
            allow_inbound_from_nc_to_host: self.allow_inbound_from_nc_to_host,
            ips_to_route_via_host: self.ips_to_route_via_host.clone(),
            infra_vnet_ip: self.infra_vnet_ip,
            local_ip: self.local_ip,
            ipv6_mode: self.ipv6_mode,
            pod_name: self.pod_name.clone(),
            pod_namespace: self.pod_namespace.clone(),
            ..Default::default()
        }
    }

    /// Whether a sandbox currently holds this endpoint.
    pub fn is_attached(&self) -> bool {
        !self.sandbox_key.is_empty()
    }
}

/// One logical network on an external interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Network {
    pub id: String,
    /// Platform network id on HNS-backed hosts; unused here but kept in the
    /// document so state written by those hosts survives a round-trip.
    pub hns_id: String,
    pub mode: NetworkMode,
    pub vlan_id: u16,
    pub subnets: Vec<SubnetInfo>,
    pub endpoints: BTreeMap<String, Endpoint>,
    #[serde(rename = "DNS")]
    pub dns: DnsInfo,
    pub enable_snat_on_host: bool,
    pub net_ns: String,
    #[serde(rename = "SnatBridgeIP")]
    pub snat_bridge_ip: Option<IpNet>,
    /// Name of the owning external interface; recomputed on load.
    #[serde(skip)]
    pub ext_if_name: String,
}

impl Network {
    pub fn from_info(info: &NetworkInfo, ext_if_name: &str) -> Self {
        Self {
            id: info.id.clone(),
            hns_id: String::new(),
            mode: info.mode,
            vlan_id: info.vlan_id,
            subnets: info.subnets.clone(),
            endpoints: BTreeMap::new(),
            dns: info.dns.clone(),
            enable_snat_on_host: info.enable_snat_on_host,
            net_ns: info.netns.clone(),
            snat_bridge_ip: info.snat_bridge_ip,
            ext_if_name: ext_if_name.to_string(),
        }
    }
}

/// One host NIC bridging containers to the outside world.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExternalInterface {
    pub name: String,
    pub networks: BTreeMap<String, Network>,
    pub subnets: Vec<IpNet>,
    pub bridge_name: String,
    #[serde(rename = "DNSInfo")]
    pub dns_info: DnsInfo,
    pub mac_address: MacAddr,
    #[serde(rename = "IPAddresses")]
    pub ip_addresses: Vec<IpNet>,
    pub routes: Vec<RouteInfo>,
    #[serde(rename = "IPv4Gateway")]
    pub ipv4_gateway: Option<IpAddr>,
    #[serde(rename = "IPv6Gateway")]
    pub ipv6_gateway: Option<IpAddr>,
}

/// The whole persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    pub version: String,
    pub time_stamp: SystemTime,
    pub external_interfaces: BTreeMap<String, ExternalInterface>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            time_stamp: SystemTime::UNIX_EPOCH,
            external_interfaces: BTreeMap::new(),
        }
    }
}

impl State {
    /// Restore in-memory links the serializer drops: each network learns the
    /// name of the external interface that contains it.
    pub fn relink(&mut self) {
        for (name, ext_if) in &mut self.external_interfaces {
            for network in ext_if.networks.values_mut() {
                network.ext_if_name = name.clone();
            }
        }
    }

    /// Find the external interface owning a network id.
    pub fn interface_of(&self, network_id: &str) -> Option<&str> {
        self.external_interfaces
            .values()
            .find(|e| e.networks.contains_key(network_id))
            .map(|e| e.name.as_str())
    }
}
