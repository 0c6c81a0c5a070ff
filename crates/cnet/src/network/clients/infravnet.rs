//! Infra-vnet sub-client.
//!
//! When an endpoint belongs to two logical networks, a second veth pair
//! carries the infra traffic: the host side joins the OVS bridge untagged
//! (vlan 0), with the same SNAT/DNAT flow pattern as the primary leg.

use tracing::info;

use super::super::error::{ClientContext, Error, Result};
use super::super::model::Endpoint;
use super::super::types::{
    EndpointInfo, infra_container_veth_name, infra_veth_name,
};
use super::{
    DataPlane, assign_container_addresses, create_veth_pair, link_mac, move_link_to_ns,
    setup_container_interface,
};
use crate::netif::format_mac;

const CLIENT: &str = "InfraVnetClient";

/// Interface name the infra leg gets inside the container.
const INFRA_CONTAINER_IF: &str = "eth2";

pub struct InfraVnetClient {
    dp: DataPlane,
    bridge_name: String,
    primary_if: String,
    host_mac: [u8; 6],
    host_veth: String,
    container_veth: String,
    container_mac: [u8; 6],
}

impl InfraVnetClient {
    pub fn new(
        dp: DataPlane,
        bridge_name: impl Into<String>,
        primary_if: impl Into<String>,
        host_mac: [u8; 6],
    ) -> Self {
        Self {
            dp,
            bridge_name: bridge_name.into(),
            primary_if: primary_if.into(),
            host_mac,
            host_veth: String::new(),
            container_veth: String::new(),
            container_mac: [0; 6],
        }
    }

    fn infra_ip(ep: &EndpointInfo) -> Result<super::super::types::IpNet> {
        ep.infra_vnet_ip.ok_or_else(|| {
            Error::MalformedIp("infra vnet requested without an InfraVnetIP".into())
                .in_client(CLIENT)
        })
    }

    pub(crate) async fn add_endpoints(&mut self, ep: &EndpointInfo) -> Result<()> {
        Self::infra_ip(ep)?;
        self.host_veth = infra_veth_name(&ep.id);
        self.container_veth = infra_container_veth_name(&ep.id);

        create_veth_pair(&self.dp.conn, &self.host_veth, &self.container_veth, &self.primary_if)
            .await
            .client(CLIENT)?;
        self.container_mac = link_mac(&self.dp.conn, &self.container_veth)
            .await
            .client(CLIENT)?;
        Ok(())
    }

    pub(crate) async fn add_endpoint_rules(&mut self, ep: &EndpointInfo) -> Result<()> {
        let infra_ip = Self::infra_ip(ep)?;
        let ovs = &self.dp.ovs;

        // Untagged port: infra traffic rides the bridge at vlan 0.
        ovs.add_port(&self.bridge_name, &self.host_veth, None)
            .await
            .client(CLIENT)?;

        let container_port = ovs.ofport(&self.host_veth).await.client(CLIENT)?;
        let uplink_port = ovs.ofport(&self.primary_if).await.client(CLIENT)?;

        ovs.add_ip_snat(
            &self.bridge_name,
            container_port,
            infra_ip.addr,
            &format_mac(&self.host_mac),
        )
        .await
        .client(CLIENT)?;
        ovs.add_mac_dnat(
            &self.bridge_name,
            uplink_port,
            infra_ip.addr,
            &format_mac(&self.container_mac),
            0,
            container_port,
        )
        .await
        .client(CLIENT)?;

        info!(endpoint = %ep.id, "infra vnet rules installed");
        Ok(())
    }

    pub(crate) async fn move_endpoints_to_container_ns(&mut self, ep: &EndpointInfo) -> Result<()> {
        move_link_to_ns(&self.dp.conn, &self.container_veth, &ep.netns_path)
            .await
            .client(CLIENT)
    }

    pub(crate) async fn setup_container_interfaces(&mut self, ep: &EndpointInfo) -> Result<()> {
        setup_container_interface(&ep.netns_path, &self.container_veth, INFRA_CONTAINER_IF)
            .await
            .client(CLIENT)
    }

    pub(crate) async fn configure_container_interfaces(&mut self, ep: &EndpointInfo) -> Result<()> {
        let infra_ip = Self::infra_ip(ep)?;
        assign_container_addresses(&ep.netns_path, INFRA_CONTAINER_IF, &[infra_ip])
            .await
            .client(CLIENT)
    }

    pub(crate) async fn delete_endpoint_rules(&mut self, ep: &Endpoint) -> Result<()> {
        let Some(infra_ip) = ep.infra_vnet_ip else {
            return Ok(());
        };
        let host_veth = infra_veth_name(&ep.id);
        let ovs = &self.dp.ovs;

        let container_port = ovs.ofport(&host_veth).await.unwrap_or(0);
        let uplink_port = ovs.ofport(&self.primary_if).await.unwrap_or(0);
        ovs.delete_ip_snat(&self.bridge_name, container_port, infra_ip.addr).await;
        ovs.delete_mac_dnat(&self.bridge_name, uplink_port, infra_ip.addr).await;
        ovs.delete_port(&self.bridge_name, &host_veth).await;
        Ok(())
    }

    pub(crate) async fn delete_endpoints(&mut self, ep: &Endpoint) -> Result<()> {
        let host_veth = infra_veth_name(&ep.id);
        let res = self.dp.conn.delete_link(&host_veth).await;
        if let Err(e) = res {
            if !e.is_not_found() {
                return Err(e).client(CLIENT);
            }
        }
        Ok(())
    }
}
