//! Open vSwitch endpoint wiring.
//!
//! The host veth joins the OVS bridge with the endpoint's vlan tag; flows
//! answer ARP, rewrite MACs in both directions, and pin the container's
//! source address to its own port so a spoofed source is dropped.

use tracing::info;

use super::super::error::{ClientContext, Result};
use super::super::model::Endpoint;
use super::super::types::{EndpointInfo, container_veth_name, host_veth_name};
use super::infravnet::InfraVnetClient;
use super::snat::SnatClient;
use super::{
    DataPlane, assign_container_addresses, create_veth_pair, install_container_routes, link_mac,
    move_link_to_ns, setup_container_interface,
};
use crate::netif::format_mac;
use crate::netlink::Connection;

const CLIENT: &str = "OvsEndpointClient";

pub struct OvsEndpointClient {
    dp: DataPlane,
    bridge_name: String,
    primary_if: String,
    host_mac: [u8; 6],
    vlan_id: u16,
    host_veth: String,
    container_veth: String,
    container_mac: [u8; 6],
    snat: Option<SnatClient>,
    infra: Option<InfraVnetClient>,
}

impl OvsEndpointClient {
    pub fn new(
        dp: DataPlane,
        bridge_name: impl Into<String>,
        primary_if: impl Into<String>,
        host_mac: [u8; 6],
        vlan_id: u16,
        snat: Option<SnatClient>,
        infra: Option<InfraVnetClient>,
    ) -> Self {
        Self {
            dp,
            bridge_name: bridge_name.into(),
            primary_if: primary_if.into(),
            host_mac,
            vlan_id,
            host_veth: String::new(),
            container_veth: String::new(),
            container_mac: [0; 6],
            snat,
            infra,
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
        if let Some(infra) = &mut self.infra {
            infra.add_endpoints(ep).await?;
        }
        Ok(())
    }

    pub(crate) async fn add_endpoint_rules(&mut self, ep: &EndpointInfo) -> Result<()> {
        let ovs = &self.dp.ovs;
        let vlan = (self.vlan_id != 0).then_some(self.vlan_id);
        ovs.add_port(&self.bridge_name, &self.host_veth, vlan)
            .await
            .client(CLIENT)?;

        let container_port = ovs.ofport(&self.host_veth).await.client(CLIENT)?;
        let uplink_port = ovs.ofport(&self.primary_if).await.client(CLIENT)?;

        let host_mac = format_mac(&self.host_mac);
        let container_mac = format_mac(&self.container_mac);

        for addr in &ep.ip_addresses {
            ovs.add_fake_arp_reply(&self.bridge_name, self.vlan_id, addr.addr, &container_mac)
                .await
                .client(CLIENT)?;
            ovs.add_ip_snat(&self.bridge_name, container_port, addr.addr, &host_mac)
                .await
                .client(CLIENT)?;
            ovs.add_mac_dnat(
                &self.bridge_name,
                uplink_port,
                addr.addr,
                &container_mac,
                self.vlan_id,
                container_port,
            )
            .await
            .client(CLIENT)?;
        }

        if let Some(snat) = &mut self.snat {
            snat.add_endpoint_rules(ep).await?;
        }
        if let Some(infra) = &mut self.infra {
            infra.add_endpoint_rules(ep).await?;
        }

        info!(
            endpoint = %ep.id,
            bridge = %self.bridge_name,
            vlan = self.vlan_id,
            "ovs endpoint rules installed"
        );
        Ok(())
    }

    pub(crate) async fn move_endpoints_to_container_ns(&mut self, ep: &EndpointInfo) -> Result<()> {
        move_link_to_ns(&self.dp.conn, &self.container_veth, &ep.netns_path)
            .await
            .client(CLIENT)?;
        if let Some(snat) = &mut self.snat {
            snat.move_endpoints_to_container_ns(ep).await?;
        }
        if let Some(infra) = &mut self.infra {
            infra.move_endpoints_to_container_ns(ep).await?;
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
        if let Some(infra) = &mut self.infra {
            infra.setup_container_interfaces(ep).await?;
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
        if let Some(infra) = &mut self.infra {
            infra.configure_container_interfaces(ep).await?;
        }
        Ok(())
    }

    pub(crate) async fn delete_endpoint_rules(&mut self, ep: &Endpoint) -> Result<()> {
        let ovs = &self.dp.ovs;

        // Port numbers may be gone along with the port; resolve best-effort.
        let container_port = ovs.ofport(&ep.host_if_name).await.unwrap_or(0);
        let uplink_port = ovs.ofport(&self.primary_if).await.unwrap_or(0);

        for addr in &ep.ip_addresses {
            ovs.delete_fake_arp_reply(&self.bridge_name, addr.addr).await;
            ovs.delete_ip_snat(&self.bridge_name, container_port, addr.addr).await;
            ovs.delete_mac_dnat(&self.bridge_name, uplink_port, addr.addr).await;
        }
        ovs.delete_port(&self.bridge_name, &ep.host_if_name).await;

        if let Some(snat) = &mut self.snat {
            snat.delete_endpoint_rules(ep).await?;
        }
        if let Some(infra) = &mut self.infra {
            infra.delete_endpoint_rules(ep).await?;
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
        if let Some(infra) = &mut self.infra {
            infra.delete_endpoints(ep).await?;
        }
        info!(endpoint = %ep.id, "ovs endpoint deleted");
        Ok(())
    }
}
