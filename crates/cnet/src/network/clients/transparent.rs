//! Transparent endpoint wiring.
//!
//! No bridge: each container address gets a host route pointing at the veth
//! and proxy-ARP answers for it on the host side. Inside the container all
//! traffic leaves through a link-local virtual gateway.

use std::net::IpAddr;

use tracing::info;

use super::super::error::{ClientContext, Result};
use super::super::model::Endpoint;
use super::super::types::{EndpointInfo, IpV6Mode, container_veth_name, host_veth_name, names};
use super::{
    DataPlane, assign_container_addresses, create_veth_pair, install_container_routes,
    install_virtual_gateway, link_mac, move_link_to_ns, setup_container_interface,
};
use crate::netlink::types::rt_scope;
use crate::netlink::{Connection, Route, ok_if_exists};

const CLIENT: &str = "TransparentEndpointClient";

pub struct TransparentEndpointClient {
    dp: DataPlane,
    primary_if: String,
    ipv6_mode: IpV6Mode,
    host_veth: String,
    container_veth: String,
    host_veth_mac: [u8; 6],
    container_mac: [u8; 6],
}

impl TransparentEndpointClient {
    pub fn new(dp: DataPlane, primary_if: impl Into<String>, ipv6_mode: IpV6Mode) -> Self {
        Self {
            dp,
            primary_if: primary_if.into(),
            ipv6_mode,
            host_veth: String::new(),
            container_veth: String::new(),
            host_veth_mac: [0; 6],
            container_mac: [0; 6],
        }
    }

    /// MAC the veth pair gave the container side.
    pub fn container_mac(&self) -> [u8; 6] {
        self.container_mac
    }

    fn virtual_gateways(&self) -> Vec<IpAddr> {
        let mut gws: Vec<IpAddr> = vec![names::VIRTUAL_GW_V4.parse().expect("well-formed literal")];
        if self.ipv6_mode.enabled() {
            gws.push(names::VIRTUAL_GW_V6.parse().expect("well-formed literal"));
        }
        gws
    }

    pub(crate) async fn add_endpoints(&mut self, ep: &EndpointInfo) -> Result<()> {
        self.host_veth = host_veth_name(&ep.id);
        self.container_veth = container_veth_name(&ep.id);

        create_veth_pair(&self.dp.conn, &self.host_veth, &self.container_veth, &self.primary_if)
            .await
            .client(CLIENT)?;
        self.host_veth_mac = link_mac(&self.dp.conn, &self.host_veth).await.client(CLIENT)?;
        self.container_mac = link_mac(&self.dp.conn, &self.container_veth)
            .await
            .client(CLIENT)?;

        self.dp
            .sysctl
            .set_proxy_arp(&self.host_veth, true)
            .await
            .client(CLIENT)?;
        if self.ipv6_mode.enabled() {
            self.dp.sysctl.enable_ipv6_forwarding().await.client(CLIENT)?;
        }
        Ok(())
    }

    pub(crate) async fn add_endpoint_rules(&mut self, ep: &EndpointInfo) -> Result<()> {
        // Ingress: one host route per container address, out the veth.
        let ifindex = self.dp.conn.ifindex(&self.host_veth).await.client(CLIENT)?;
        for addr in &ep.ip_addresses {
            let host_len = if addr.addr.is_ipv4() { 32 } else { 128 };
            let route = Route::unicast(addr.addr, host_len)
                .link_index(ifindex)
                .scope(rt_scope::LINK);
            ok_if_exists(self.dp.conn.add_route(&route).await).client(CLIENT)?;
        }
        info!(endpoint = %ep.id, veth = %self.host_veth, "transparent host routes installed");
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
        assign_container_addresses(&ep.netns_path, &ep.if_name, &ep.ip_addresses)
            .await
            .client(CLIENT)?;

        let conn = Connection::in_namespace_path(&ep.netns_path).client(CLIENT)?;
        for gw in self.virtual_gateways() {
            install_virtual_gateway(&conn, &ep.if_name, gw, self.host_veth_mac, 0)
                .await
                .client(CLIENT)?;
        }
        install_container_routes(&conn, &ep.if_name, &ep.routes)
            .await
            .client(CLIENT)?;
        Ok(())
    }

    pub(crate) async fn delete_endpoint_rules(&mut self, ep: &Endpoint) -> Result<()> {
        let Ok(ifindex) = self.dp.conn.ifindex(&ep.host_if_name).await else {
            // Veth already gone; the routes died with it.
            return Ok(());
        };
        for addr in &ep.ip_addresses {
            let host_len = if addr.addr.is_ipv4() { 32 } else { 128 };
            let route = Route::unicast(addr.addr, host_len)
                .link_index(ifindex)
                .scope(rt_scope::LINK);
            let res = self.dp.conn.delete_route(&route).await;
            if let Err(e) = res {
                if !e.is_not_found() {
                    return Err(e).client(CLIENT);
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn delete_endpoints(&mut self, ep: &Endpoint) -> Result<()> {
        let res = self.dp.conn.delete_link(&ep.host_if_name).await;
        if let Err(e) = res {
            if !e.is_not_found() {
                return Err(e).client(CLIENT);
            }
        }
        info!(endpoint = %ep.id, "transparent endpoint deleted");
        Ok(())
    }
}
