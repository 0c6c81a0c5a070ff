//! Transparent-VLAN endpoint wiring.
//!
//! One dedicated network namespace per VLAN (`az_ns_<vlan>`) holds a VLAN
//! sub-interface of the primary NIC and one vnet-side veth per endpoint.
//! Packets entering the vnet namespace on the VLAN interface route normally;
//! everything else is marked and routed through a secondary table whose
//! default route tunnels it out.

use tracing::info;

use super::super::error::{ClientContext, Result};
use super::super::model::Endpoint;
use super::super::types::{
    EndpointInfo, container_veth_name, host_veth_name, names, vlan_if_name, vnet_ns_name,
};
use super::{
    DataPlane, assign_container_addresses, create_veth_pair, install_container_routes,
    install_virtual_gateway, link_mac, move_link_to_ns, setup_container_interface,
};
use crate::netlink::types::rt_scope;
use crate::netlink::{Connection, Route, RouteFilter, VlanLink, namespace, ok_if_exists};

const CLIENT: &str = "TransparentVlanEndpointClient";

/// Routes a vnet namespace carries when no endpoints remain: the virtual
/// gateway host-route and the default route through it.
const EMPTY_VNET_ROUTE_COUNT: usize = 2;

pub struct TransparentVlanEndpointClient {
    dp: DataPlane,
    primary_if: String,
    vlan_id: u16,
    vnet_ns: String,
    vlan_if: String,
    vnet_veth: String,
    container_veth: String,
    vnet_veth_mac: [u8; 6],
    container_mac: [u8; 6],
}

impl TransparentVlanEndpointClient {
    pub fn new(dp: DataPlane, primary_if: impl Into<String>, vlan_id: u16) -> Self {
        let primary_if = primary_if.into();
        Self {
            vnet_ns: vnet_ns_name(vlan_id),
            vlan_if: vlan_if_name(&primary_if, vlan_id),
            dp,
            primary_if,
            vlan_id,
            vnet_veth: String::new(),
            container_veth: String::new(),
            vnet_veth_mac: [0; 6],
            container_mac: [0; 6],
        }
    }

    /// MAC the veth pair gave the container side.
    pub fn container_mac(&self) -> [u8; 6] {
        self.container_mac
    }

    fn vnet_ns_path(&self) -> std::path::PathBuf {
        namespace::named_path(&self.vnet_ns)
    }

    /// PopulateVM: make sure the vnet namespace and VLAN interface exist,
    /// then create this endpoint's veth pair and push one end into the vnet.
    pub(crate) async fn add_endpoints(&mut self, ep: &EndpointInfo) -> Result<()> {
        namespace::create_named(&self.vnet_ns).await.client(CLIENT)?;

        let vnet_conn = Connection::in_namespace_path(self.vnet_ns_path()).client(CLIENT)?;
        if vnet_conn.get_link_by_name(&self.vlan_if).await.is_err() {
            // First endpoint on this vlan: create the sub-interface in the VM
            // and move it over.
            let parent_index = self.dp.conn.ifindex(&self.primary_if).await.client(CLIENT)?;
            self.dp
                .conn
                .add_link(VlanLink::new(&self.vlan_if, parent_index, self.vlan_id))
                .await
                .client(CLIENT)?;
            let ns = crate::netlink::NetNs::open(self.vnet_ns_path()).client(CLIENT)?;
            self.dp
                .conn
                .set_link_netns(&self.vlan_if, ns.fd())
                .await
                .client(CLIENT)?;
        } else {
            info!(vlan_if = %self.vlan_if, ns = %self.vnet_ns, "reusing existing vlan interface");
        }

        self.vnet_veth = host_veth_name(&ep.id);
        self.container_veth = container_veth_name(&ep.id);
        create_veth_pair(&self.dp.conn, &self.vnet_veth, &self.container_veth, &self.primary_if)
            .await
            .client(CLIENT)?;
        self.vnet_veth_mac = link_mac(&self.dp.conn, &self.vnet_veth).await.client(CLIENT)?;
        self.container_mac = link_mac(&self.dp.conn, &self.container_veth)
            .await
            .client(CLIENT)?;

        let ns = crate::netlink::NetNs::open(self.vnet_ns_path()).client(CLIENT)?;
        self.dp
            .conn
            .set_link_netns(&self.vnet_veth, ns.fd())
            .await
            .client(CLIENT)?;

        self.populate_vnet(&vnet_conn).await
    }

    /// PopulateVnet: verify the pieces arrived, raise them, and relax
    /// reverse-path filtering so marked traffic can take the tunnel table.
    async fn populate_vnet(&self, vnet_conn: &Connection) -> Result<()> {
        vnet_conn.get_link_by_name(&self.vlan_if).await.client(CLIENT)?;
        vnet_conn.get_link_by_name(&self.vnet_veth).await.client(CLIENT)?;

        vnet_conn.set_link_state(&self.vlan_if, true).await.client(CLIENT)?;
        vnet_conn.set_link_state(&self.vnet_veth, true).await.client(CLIENT)?;

        let vlan_if = self.vlan_if.clone();
        let sysctl = self.dp.sysctl.clone();
        namespace::run_in_namespace(self.vnet_ns_path(), move || {
            sysctl
                .disable_rp_filter_blocking("all")
                .map_err(|e| crate::netlink::Error::InvalidMessage(e.to_string()))?;
            sysctl
                .disable_rp_filter_blocking(&vlan_if)
                .map_err(|e| crate::netlink::Error::InvalidMessage(e.to_string()))?;
            Ok(())
        })
        .await
        .client(CLIENT)
    }

    /// AddVnetRules: mark everything that did not enter on the VLAN
    /// interface and steer marked packets through the tunneling table.
    pub(crate) async fn add_endpoint_rules(&mut self, _ep: &EndpointInfo) -> Result<()> {
        let mark = names::TUNNEL_MARK.to_string();
        let exec = self.dp.exec.clone();
        let vlan_if = self.vlan_if.clone();
        namespace::run_in_namespace(self.vnet_ns_path(), move || {
            let mark_rule = [
                "-t", "mangle", "-C", "PREROUTING", "-j", "MARK", "--set-mark",
                mark.as_str(),
            ];
            let mut insert = mark_rule;
            insert[2] = "-I";
            if exec.run_blocking("iptables", &mark_rule).is_err() {
                exec.run_blocking("iptables", &insert)
                    .map_err(|e| crate::netlink::Error::InvalidMessage(e.to_string()))?;
            }

            let accept_rule = [
                "-t", "mangle", "-C", "PREROUTING", "-i", vlan_if.as_str(), "-j", "ACCEPT",
            ];
            let mut insert = accept_rule;
            insert[2] = "-I";
            if exec.run_blocking("iptables", &accept_rule).is_err() {
                exec.run_blocking("iptables", &insert)
                    .map_err(|e| crate::netlink::Error::InvalidMessage(e.to_string()))?;
            }
            Ok(())
        })
        .await
        .client(CLIENT)?;

        let vnet_conn = Connection::in_namespace_path(self.vnet_ns_path()).client(CLIENT)?;
        ok_if_exists(
            vnet_conn
                .add_fwmark_rule(names::TUNNEL_MARK, names::TUNNEL_TABLE)
                .await,
        )
        .client(CLIENT)?;
        Ok(())
    }

    pub(crate) async fn move_endpoints_to_container_ns(&mut self, ep: &EndpointInfo) -> Result<()> {
        move_link_to_ns(&self.dp.conn, &self.container_veth, &ep.netns_path)
            .await
            .client(CLIENT)
    }

    pub(crate) async fn setup_container_interfaces(&mut self, ep: &EndpointInfo) -> Result<()> {
        setup_container_interface(&ep.netns_path, &self.container_veth, &ep.if_name)
            .await
            .client(CLIENT)
    }

    pub(crate) async fn configure_container_interfaces_and_routes(
        &mut self,
        ep: &EndpointInfo,
    ) -> Result<()> {
        self.configure_container(ep).await?;
        self.configure_vnet(ep).await
    }

    /// Container side: addresses, the virtual-gateway trio, and the caller's
    /// routes. The kernel's automatic subnet route is removed so everything
    /// leaves via the virtual gateway.
    async fn configure_container(&self, ep: &EndpointInfo) -> Result<()> {
        assign_container_addresses(&ep.netns_path, &ep.if_name, &ep.ip_addresses)
            .await
            .client(CLIENT)?;

        let conn = Connection::in_namespace_path(&ep.netns_path).client(CLIENT)?;
        let ifindex = conn.get_link_by_name(&ep.if_name).await.client(CLIENT)?.ifindex();

        for addr in &ep.ip_addresses {
            let subnet = crate::netlink::addr::network_of(addr.addr, addr.prefix_len);
            let kernel_route = Route::unicast(subnet, addr.prefix_len)
                .link_index(ifindex)
                .scope(rt_scope::LINK);
            let res = conn.delete_route(&kernel_route).await;
            if let Err(e) = res {
                if !e.is_not_found() {
                    return Err(e).client(CLIENT);
                }
            }
        }

        let gw = names::VIRTUAL_GW_V4.parse().expect("well-formed literal");
        install_virtual_gateway(&conn, &ep.if_name, gw, self.vnet_veth_mac, 0)
            .await
            .client(CLIENT)?;
        install_container_routes(&conn, &ep.if_name, &ep.routes)
            .await
            .client(CLIENT)
    }

    /// Vnet side: per-endpoint /32 routes telling the namespace which veth a
    /// pod address lives on, the virtual-gateway trio on the VLAN interface,
    /// and the default route duplicated into the tunneling table.
    async fn configure_vnet(&self, ep: &EndpointInfo) -> Result<()> {
        let conn = Connection::in_namespace_path(self.vnet_ns_path()).client(CLIENT)?;
        conn.set_link_state("lo", true).await.client(CLIENT)?;

        let veth_index = conn
            .get_link_by_name(&self.vnet_veth)
            .await
            .client(CLIENT)?
            .ifindex();
        for addr in &ep.ip_addresses {
            let host_len = if addr.addr.is_ipv4() { 32 } else { 128 };
            let route = Route::unicast(addr.addr, host_len)
                .link_index(veth_index)
                .scope(rt_scope::LINK);
            ok_if_exists(conn.add_route(&route).await).client(CLIENT)?;
        }

        let gw = names::VIRTUAL_GW_V4.parse().expect("well-formed literal");
        let gw_mac = crate::netif::parse_mac(names::VIRTUAL_MAC).expect("well-formed literal");
        install_virtual_gateway(&conn, &self.vlan_if, gw, gw_mac, 0)
            .await
            .client(CLIENT)?;
        install_virtual_gateway(&conn, &self.vlan_if, gw, gw_mac, names::TUNNEL_TABLE as u32)
            .await
            .client(CLIENT)?;

        info!(endpoint = %ep.id, ns = %self.vnet_ns, "vnet routes installed");
        Ok(())
    }

    /// Remove this endpoint's /32 routes from the vnet namespace.
    pub(crate) async fn delete_endpoint_rules(&mut self, ep: &Endpoint) -> Result<()> {
        if !namespace::exists(&self.vnet_ns) {
            return Ok(());
        }
        let conn = Connection::in_namespace_path(self.vnet_ns_path()).client(CLIENT)?;
        let Ok(link) = conn.get_link_by_name(&ep.host_if_name).await else {
            return Ok(());
        };
        for addr in &ep.ip_addresses {
            let host_len = if addr.addr.is_ipv4() { 32 } else { 128 };
            let route = Route::unicast(addr.addr, host_len)
                .link_index(link.ifindex())
                .scope(rt_scope::LINK);
            let res = conn.delete_route(&route).await;
            if let Err(e) = res {
                if !e.is_not_found() {
                    return Err(e).client(CLIENT);
                }
            }
        }
        Ok(())
    }

    /// Delete the veth pair from the vnet side; when only the default
    /// plumbing remains, the whole namespace (and its VLAN interface) goes.
    pub(crate) async fn delete_endpoints(&mut self, ep: &Endpoint) -> Result<()> {
        if !namespace::exists(&self.vnet_ns) {
            return Ok(());
        }
        let conn = Connection::in_namespace_path(self.vnet_ns_path()).client(CLIENT)?;
        if conn.get_link_by_name(&ep.host_if_name).await.is_ok() {
            // Deleting from inside the vnet namespace; the container side of
            // the pair vanishes with it.
            let res = conn.delete_link(&ep.host_if_name).await;
            if let Err(e) = res {
                if !e.is_not_found() {
                    return Err(e).client(CLIENT);
                }
            }
        }

        let remaining = conn.get_routes(&RouteFilter::v4()).await.client(CLIENT)?;
        if remaining.len() <= EMPTY_VNET_ROUTE_COUNT {
            info!(ns = %self.vnet_ns, "last endpoint removed, deleting vnet namespace");
            namespace::delete_named(&self.vnet_ns).await.client(CLIENT)?;
        }
        Ok(())
    }
}
