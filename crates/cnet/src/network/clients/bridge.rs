//! Linux-bridge endpoint wiring.
//!
//! Containers share the host bridge; per-endpoint rules answer ARP on the
//! container's behalf and steer inbound traffic to the container MAC.

use tracing::info;

use super::super::error::{ClientContext, Result};
use super::super::model::Endpoint;
use super::super::types::{EndpointInfo, NetworkMode, container_veth_name, host_veth_name, names};
use super::snat::SnatClient;
use super::{
    DataPlane, assign_container_addresses, create_veth_pair, install_container_routes, link_mac,
    move_link_to_ns, setup_container_interface,
};
use crate::dataplane::Op;
use crate::netif::format_mac;
use crate::netlink::{Connection, ok_if_exists};

const CLIENT: &str = "LinuxBridgeEndpointClient";

pub struct LinuxBridgeEndpointClient {
    dp: DataPlane,
    bridge_name: String,
    primary_if: String,
    mode: NetworkMode,
    host_veth: String,
    container_veth: String,
    container_mac: [u8; 6],
    snat: Option<SnatClient>,
}

impl LinuxBridgeEndpointClient {
    pub fn new(
        dp: DataPlane,
        bridge_name: impl Into<String>,
        primary_if: impl Into<String>,
        mode: NetworkMode,
        snat: Option<SnatClient>,
    ) -> Self {
        Self {
            dp,
            bridge_name: bridge_name.into(),
            primary_if: primary_if.into(),
            mode,
            host_veth: String::new(),
            container_veth: String::new(),
            container_mac: [0; 6],
            snat,
        }
    }

    /// MAC the veth pair gave the container side.
    pub fn container_mac(&self) -> [u8; 6] {
        self.container_mac
    }

    pub(crate) async fn add_endpoints(&mut self, ep: &EndpointInfo) -> Result<()> {
        self.host_veth = host_veth_name(&ep.id);
        self.container_veth = container_veth_name(&ep.id);

        create_veth_pair(&self.dp.conn, &self.host_veth, &self.container_veth, &self.primary_if)
            .await
            .client(CLIENT)?;
        self.container_mac = link_mac(&self.dp.conn, &self.container_veth)
            .await
            .client(CLIENT)?;

        if let Some(snat) = &mut self.snat {
            snat.add_endpoints(ep).await?;
        }
        Ok(())
    }

    pub(crate) async fn add_endpoint_rules(&mut self, ep: &EndpointInfo) -> Result<()> {
        let conn = &self.dp.conn;
        conn.set_link_master(&self.host_veth, &self.bridge_name)
            .await
            .client(CLIENT)?;
        conn.set_link_hairpin(&self.host_veth, true)
            .await
            .client(CLIENT)?;

        // In tunnel mode ARP is answered with the fabric's virtual MAC so
        // replies hairpin up to the SDN instead of short-circuiting the
        // bridge.
        let arp_mac = match self.mode {
            NetworkMode::Tunnel => names::VIRTUAL_MAC.to_string(),
            _ => format_mac(&self.container_mac),
        };
        let container_mac = format_mac(&self.container_mac);

        for addr in &ep.ip_addresses {
            self.dp
                .ebtables
                .set_arp_reply(Op::Append, addr.addr, &arp_mac)
                .await
                .client(CLIENT)?;
            self.dp
                .ebtables
                .set_ip_mac_dnat(Op::Append, &self.primary_if, addr.addr, &container_mac)
                .await
                .client(CLIENT)?;

            if self.mode != NetworkMode::Tunnel {
                ok_if_exists(
                    conn.add_static_arp(&self.bridge_name, addr.addr, self.container_mac, false)
                        .await,
                )
                .client(CLIENT)?;
            }
        }

        for prefix in &ep.ips_to_route_via_host {
            self.dp
                .ebtables
                .set_broute_accept(Op::Append, &prefix.to_string(), prefix.is_v6())
                .await
                .client(CLIENT)?;
        }

        if let Some(snat) = &mut self.snat {
            snat.add_endpoint_rules(ep).await?;
        }

        info!(endpoint = %ep.id, bridge = %self.bridge_name, "bridge endpoint rules installed");
        Ok(())
    }

    pub(crate) async fn move_endpoints_to_container_ns(&mut self, ep: &EndpointInfo) -> Result<()> {
        move_link_to_ns(&self.dp.conn, &self.container_veth, &ep.netns_path)
            .await
            .client(CLIENT)?;
        if let Some(snat) = &mut self.snat {
            snat.move_endpoints_to_container_ns(ep).await?;
        }
        Ok(())
    }

    pub(crate) async fn setup_container_interfaces(&mut self, ep: &EndpointInfo) -> Result<()> {
        setup_container_interface(&ep.netns_path, &self.container_veth, &ep.if_name)
            .await
            .client(CLIENT)?;
        if let Some(snat) = &mut self.snat {
            snat.setup_container_interfaces(ep).await?;
        }
        Ok(())
    }

    pub(crate) async fn configure_container_interfaces_and_routes(
        &mut self,
        ep: &EndpointInfo,
    ) -> Result<()> {
        assign_container_addresses(&ep.netns_path, &ep.if_name, &ep.ip_addresses)
            .await
            .client(CLIENT)?;

        let conn = Connection::in_namespace_path(&ep.netns_path).client(CLIENT)?;
        install_container_routes(&conn, &ep.if_name, &ep.routes)
            .await
            .client(CLIENT)?;

        if let Some(snat) = &mut self.snat {
            snat.configure_container_interfaces(ep).await?;
        }
        Ok(())
    }

    pub(crate) async fn delete_endpoint_rules(&mut self, ep: &Endpoint) -> Result<()> {
        let arp_mac = match self.mode {
            NetworkMode::Tunnel => names::VIRTUAL_MAC.to_string(),
            _ => ep.mac_address.to_string(),
        };
        let container_mac = ep.mac_address.to_string();

        for addr in &ep.ip_addresses {
            self.dp
                .ebtables
                .set_arp_reply(Op::Delete, addr.addr, &arp_mac)
                .await
                .client(CLIENT)?;
            self.dp
                .ebtables
                .set_ip_mac_dnat(Op::Delete, &self.primary_if, addr.addr, &container_mac)
                .await
                .client(CLIENT)?;

            if self.mode != NetworkMode::Tunnel {
                let res = self
                    .dp
                    .conn
                    .delete_static_arp(&self.bridge_name, addr.addr, false)
                    .await;
                if let Err(e) = res {
                    if !e.is_not_found() {
                        return Err(e).client(CLIENT);
                    }
                }
            }
        }

        for prefix in &ep.ips_to_route_via_host {
            self.dp
                .ebtables
                .set_broute_accept(Op::Delete, &prefix.to_string(), prefix.is_v6())
                .await
                .client(CLIENT)?;
        }

        if let Some(snat) = &mut self.snat {
            snat.delete_endpoint_rules(ep).await?;
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
        if let Some(snat) = &mut self.snat {
            snat.delete_endpoints(ep).await?;
        }
        info!(endpoint = %ep.id, "bridge endpoint deleted");
        Ok(())
    }
}
