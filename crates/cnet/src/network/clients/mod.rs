//! Endpoint-client variants.
//!
//! Four interchangeable data-plane wirings share one seven-step lifecycle;
//! [`EndpointClient`] dispatches on the variant. SNAT and infra-vnet are
//! composable sub-clients toggled by endpoint flags.

pub mod bridge;
pub mod infravnet;
pub mod ovs;
pub mod snat;
pub mod transparent;
pub mod transparent_vlan;

use std::net::IpAddr;
use std::sync::Arc;

use crate::dataplane::{Ebtables, Iptables, Ovs};
use crate::netlink::{Connection, VethLink, ok_if_exists};
use crate::platform::{Exec, Sysctl};

use super::error::Result;
use super::model::Endpoint;
use super::types::EndpointInfo;

pub use bridge::LinuxBridgeEndpointClient;
pub use ovs::OvsEndpointClient;
pub use transparent::TransparentEndpointClient;
pub use transparent_vlan::TransparentVlanEndpointClient;

/// Shared handles every client programs the data plane through.
#[derive(Clone)]
pub struct DataPlane {
    /// Netlink connection in the host namespace.
    pub conn: Arc<Connection>,
    pub exec: Exec,
    pub ebtables: Ebtables,
    pub ipt4: Iptables,
    pub ipt6: Iptables,
    pub ovs: Ovs,
    pub sysctl: Sysctl,
}

impl DataPlane {
    pub fn new(conn: Arc<Connection>, exec: Exec) -> Self {
        Self {
            conn,
            ebtables: Ebtables::new(exec.clone()),
            ipt4: Iptables::v4(exec.clone()),
            ipt6: Iptables::v6(exec.clone()),
            ovs: Ovs::new(exec.clone()),
            sysctl: Sysctl::new(exec.clone()),
            exec,
        }
    }
}

/// The variant in play for one endpoint operation.
pub enum EndpointClient {
    Bridge(LinuxBridgeEndpointClient),
    Ovs(OvsEndpointClient),
    Transparent(TransparentEndpointClient),
    TransparentVlan(TransparentVlanEndpointClient),
}

impl EndpointClient {
    /// Step 1: create the veth pair(s) and snapshot MACs and MTUs.
    pub async fn add_endpoints(&mut self, ep: &EndpointInfo) -> Result<()> {
        match self {
            Self::Bridge(c) => c.add_endpoints(ep).await,
            Self::Ovs(c) => c.add_endpoints(ep).await,
            Self::Transparent(c) => c.add_endpoints(ep).await,
            Self::TransparentVlan(c) => c.add_endpoints(ep).await,
        }
    }

    /// Step 2: program per-endpoint data-plane rules.
    pub async fn add_endpoint_rules(&mut self, ep: &EndpointInfo) -> Result<()> {
        match self {
            Self::Bridge(c) => c.add_endpoint_rules(ep).await,
            Self::Ovs(c) => c.add_endpoint_rules(ep).await,
            Self::Transparent(c) => c.add_endpoint_rules(ep).await,
            Self::TransparentVlan(c) => c.add_endpoint_rules(ep).await,
        }
    }

    /// Step 3: move the container-side interfaces into the target namespace.
    pub async fn move_endpoints_to_container_ns(&mut self, ep: &EndpointInfo) -> Result<()> {
        match self {
            Self::Bridge(c) => c.move_endpoints_to_container_ns(ep).await,
            Self::Ovs(c) => c.move_endpoints_to_container_ns(ep).await,
            Self::Transparent(c) => c.move_endpoints_to_container_ns(ep).await,
            Self::TransparentVlan(c) => c.move_endpoints_to_container_ns(ep).await,
        }
    }

    /// Step 4: rename and raise the interfaces inside the container.
    pub async fn setup_container_interfaces(&mut self, ep: &EndpointInfo) -> Result<()> {
        match self {
            Self::Bridge(c) => c.setup_container_interfaces(ep).await,
            Self::Ovs(c) => c.setup_container_interfaces(ep).await,
            Self::Transparent(c) => c.setup_container_interfaces(ep).await,
            Self::TransparentVlan(c) => c.setup_container_interfaces(ep).await,
        }
    }

    /// Step 5: assign addresses and install routes inside the container.
    pub async fn configure_container_interfaces_and_routes(
        &mut self,
        ep: &EndpointInfo,
    ) -> Result<()> {
        match self {
            Self::Bridge(c) => c.configure_container_interfaces_and_routes(ep).await,
            Self::Ovs(c) => c.configure_container_interfaces_and_routes(ep).await,
            Self::Transparent(c) => c.configure_container_interfaces_and_routes(ep).await,
            Self::TransparentVlan(c) => c.configure_container_interfaces_and_routes(ep).await,
        }
    }

    /// MAC the container-side interface ended up with.
    pub fn container_mac(&self) -> [u8; 6] {
        match self {
            Self::Bridge(c) => c.container_mac(),
            Self::Ovs(c) => c.container_mac(),
            Self::Transparent(c) => c.container_mac(),
            Self::TransparentVlan(c) => c.container_mac(),
        }
    }

    /// Teardown: remove the endpoint's data-plane rules. Idempotent.
    pub async fn delete_endpoint_rules(&mut self, ep: &Endpoint) -> Result<()> {
        match self {
            Self::Bridge(c) => c.delete_endpoint_rules(ep).await,
            Self::Ovs(c) => c.delete_endpoint_rules(ep).await,
            Self::Transparent(c) => c.delete_endpoint_rules(ep).await,
            Self::TransparentVlan(c) => c.delete_endpoint_rules(ep).await,
        }
    }

    /// Teardown: delete the veth pair(s); the peer vanishes with the host
    /// side.
    pub async fn delete_endpoints(&mut self, ep: &Endpoint) -> Result<()> {
        match self {
            Self::Bridge(c) => c.delete_endpoints(ep).await,
            Self::Ovs(c) => c.delete_endpoints(ep).await,
            Self::Transparent(c) => c.delete_endpoints(ep).await,
            Self::TransparentVlan(c) => c.delete_endpoints(ep).await,
        }
    }
}

// ============================================================================
// Helpers shared by all variants
// ============================================================================

/// Create a veth pair in the host namespace, mirroring the primary
/// interface's MTU onto both ends, and raise the host side.
pub(crate) async fn create_veth_pair(
    conn: &Connection,
    host_name: &str,
    container_name: &str,
    primary_if: &str,
) -> Result<()> {
    let mut veth = VethLink::new(host_name, container_name);
    match conn.get_link_by_name(primary_if).await {
        Ok(link) => {
            if let Some(mtu) = link.mtu {
                veth = veth.mtu(mtu);
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, primary_if, "cannot snapshot primary MTU, using default");
        }
    }
    conn.add_link(veth).await?;
    conn.set_link_state(host_name, true).await?;
    Ok(())
}

/// Read the MAC the kernel assigned to a freshly created link.
pub(crate) async fn link_mac(conn: &Connection, name: &str) -> Result<[u8; 6]> {
    let link = conn.get_link_by_name(name).await?;
    link.mac.ok_or_else(|| {
        crate::netlink::Error::InvalidMessage(format!("link {name} has no hardware address"))
            .into()
    })
}

/// Move a host-side interface into the namespace at `netns_path`.
pub(crate) async fn move_link_to_ns(
    conn: &Connection,
    ifname: &str,
    netns_path: &str,
) -> Result<()> {
    let ns = crate::netlink::NetNs::open(netns_path)?;
    conn.set_link_netns(ifname, ns.fd()).await?;
    Ok(())
}

/// Inside the container namespace: rename an interface and bring it up.
pub(crate) async fn setup_container_interface(
    netns_path: &str,
    old_name: &str,
    new_name: &str,
) -> Result<()> {
    let conn = Connection::in_namespace_path(netns_path)?;
    conn.set_link_state(old_name, false).await?;
    conn.rename_link(old_name, new_name).await?;
    conn.set_link_state(new_name, true).await?;
    Ok(())
}

/// Inside the container namespace: assign addresses to an interface.
/// Re-assignment of an existing address succeeds.
pub(crate) async fn assign_container_addresses(
    netns_path: &str,
    if_name: &str,
    addresses: &[super::types::IpNet],
) -> Result<()> {
    let conn = Connection::in_namespace_path(netns_path)?;
    for addr in addresses {
        ok_if_exists(conn.add_ip_address(if_name, addr.addr, addr.prefix_len).await)?;
    }
    Ok(())
}

/// Inside the container namespace: install the virtual-gateway plumbing on
/// `if_name`: a /32 (or /128) on-link route to the gateway, a default route
/// through it, and a static ARP/neighbor entry resolving it to `gw_mac`.
pub(crate) async fn install_virtual_gateway(
    conn: &Connection,
    if_name: &str,
    gateway: IpAddr,
    gw_mac: [u8; 6],
    table: u32,
) -> Result<()> {
    use crate::netlink::Route;
    use crate::netlink::types::rt_scope;

    let ifindex = conn.get_link_by_name(if_name).await?.ifindex();
    let host_len = if gateway.is_ipv4() { 32 } else { 128 };

    let gw_route = Route::unicast(gateway, host_len)
        .link_index(ifindex)
        .scope(rt_scope::LINK)
        .table(table);
    ok_if_exists(conn.add_route(&gw_route).await)?;

    let default = Route::default_via(gateway).link_index(ifindex).table(table);
    ok_if_exists(conn.add_route(&default).await)?;

    ok_if_exists(conn.add_static_arp(if_name, gateway, gw_mac, false).await)?;
    Ok(())
}

/// Install an endpoint's requested routes inside the container namespace,
/// resolving empty device names to the container interface.
pub(crate) async fn install_container_routes(
    conn: &Connection,
    default_if: &str,
    routes: &[super::types::RouteInfo],
) -> Result<()> {
    use crate::netlink::Route;

    let default_ifindex = conn.get_link_by_name(default_if).await?.ifindex();
    for info in routes {
        let mut route = match info.dst {
            Some(dst) => Route::unicast(dst.addr, dst.prefix_len),
            None => {
                let Some(gw) = info.gateway else {
                    continue;
                };
                Route::default_via(gw)
            }
        };
        if let Some(gw) = info.gateway {
            route = route.gateway(gw);
        }
        route.scope = info.scope;
        route.priority = info.priority;
        route.table = info.table;
        route.link_index = if info.dev_name.is_empty() {
            default_ifindex
        } else {
            conn.get_link_by_name(&info.dev_name).await?.ifindex()
        };
        ok_if_exists(conn.add_route(&route).await)?;
    }
    Ok(())
}
