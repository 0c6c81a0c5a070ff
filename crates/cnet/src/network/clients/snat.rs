//! SNAT sub-client.
//!
//! A parallel bridge (`azSnatbr`) gives endpoints a second leg into APIPA
//! space: outbound traffic masquerades through the host, and optional
//! host<->NC rules open a narrow path between the VM and the container.
//! Composable with the bridge and OVS endpoint clients.

use std::net::IpAddr;

use tracing::info;

use super::super::error::{ClientContext, Error, Result};
use super::super::model::Endpoint;
use super::super::types::{
    EndpointInfo, IpNet, names, snat_container_veth_name, snat_veth_name,
};
use super::{DataPlane, create_veth_pair, link_mac, move_link_to_ns, setup_container_interface};
use crate::dataplane::{Op, Position};
use crate::netlink::{BridgeLink, ok_if_exists};

const CLIENT: &str = "SnatClient";

/// Interface name the SNAT leg gets inside the container.
const SNAT_CONTAINER_IF: &str = "eth1";

/// Private/link-local space blocked from leaving through the SNAT bridge.
const BLOCKED_PREFIXES: [&str; 4] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
];

pub struct SnatClient {
    dp: DataPlane,
    /// APIPA address carried by the SNAT bridge; its prefix is the
    /// masquerade source.
    bridge_ip: IpNet,
    host_mac: [u8; 6],
    /// Addresses exempted from the private-space block.
    skip_addresses: Vec<IpNet>,
    enable_snat_on_host: bool,
    allow_host_to_nc: bool,
    allow_nc_to_host: bool,
    host_veth: String,
    container_veth: String,
    container_mac: [u8; 6],
}

impl SnatClient {
    pub fn new(
        dp: DataPlane,
        bridge_ip: IpNet,
        host_mac: [u8; 6],
        skip_addresses: Vec<IpNet>,
        ep: &EndpointInfo,
    ) -> Self {
        Self {
            dp,
            bridge_ip,
            host_mac,
            skip_addresses,
            enable_snat_on_host: ep.enable_snat_on_host || ep.enable_snat_for_dns,
            allow_host_to_nc: ep.allow_inbound_from_host_to_nc,
            allow_nc_to_host: ep.allow_inbound_from_nc_to_host,
            host_veth: String::new(),
            container_veth: String::new(),
            container_mac: [0; 6],
        }
    }

    fn bridge_subnet(&self) -> IpNet {
        IpNet::new(
            crate::netlink::addr::network_of(self.bridge_ip.addr, self.bridge_ip.prefix_len),
            self.bridge_ip.prefix_len,
        )
    }

    /// Create the SNAT bridge if this host does not have one yet.
    async fn ensure_snat_bridge(&self) -> Result<()> {
        let conn = &self.dp.conn;
        if conn.get_link_by_name(names::SNAT_BRIDGE).await.is_err() {
            conn.add_link(BridgeLink::new(names::SNAT_BRIDGE))
                .await
                .client(CLIENT)?;
            // The fabric knows the VM by its primary MAC; the SNAT bridge
            // must present the same one.
            conn.set_link_address(names::SNAT_BRIDGE, self.host_mac)
                .await
                .client(CLIENT)?;
            if let Err(e) = self.dp.sysctl.set_accept_ra(names::SNAT_BRIDGE, false).await {
                tracing::warn!(error = %e, "cannot disable accept_ra on snat bridge");
            }
        }
        ok_if_exists(
            conn.add_ip_address(
                names::SNAT_BRIDGE,
                self.bridge_ip.addr,
                self.bridge_ip.prefix_len,
            )
            .await,
        )
        .client(CLIENT)?;
        conn.set_link_state(names::SNAT_BRIDGE, true)
            .await
            .client(CLIENT)?;

        self.dp
            .ebtables
            .set_drop_8021q(Op::Append, names::SNAT_BRIDGE)
            .await
            .client(CLIENT)?;
        Ok(())
    }

    pub(crate) async fn add_endpoints(&mut self, ep: &EndpointInfo) -> Result<()> {
        self.ensure_snat_bridge().await?;

        self.host_veth = snat_veth_name(&ep.id);
        self.container_veth = snat_container_veth_name(&ep.id);
        create_veth_pair(&self.dp.conn, &self.host_veth, &self.container_veth, names::SNAT_BRIDGE)
            .await
            .client(CLIENT)?;
        self.container_mac = link_mac(&self.dp.conn, &self.container_veth)
            .await
            .client(CLIENT)?;
        self.dp
            .conn
            .set_link_master(&self.host_veth, names::SNAT_BRIDGE)
            .await
            .client(CLIENT)?;
        Ok(())
    }

    pub(crate) async fn add_endpoint_rules(&mut self, ep: &EndpointInfo) -> Result<()> {
        if self.enable_snat_on_host {
            let subnet = self.bridge_subnet().to_string();
            self.dp
                .ipt4
                .ensure_rule(
                    "nat",
                    "POSTROUTING",
                    Position::Append,
                    &["-s", &subnet, "-j", "MASQUERADE"],
                )
                .await
                .client(CLIENT)?;
        }

        self.allow_skip_addresses().await?;
        self.block_private_space().await?;

        if self.allow_host_to_nc || self.allow_nc_to_host {
            self.add_host_nc_rules(ep).await?;
        }

        info!(endpoint = %ep.id, "snat rules installed");
        Ok(())
    }

    /// One ACCEPT per exempted address, ahead of the blanket drops.
    async fn allow_skip_addresses(&self) -> Result<()> {
        for chain in ["FORWARD", "INPUT", "OUTPUT"] {
            for addr in &self.skip_addresses {
                let dst = addr.to_string();
                self.dp
                    .ipt4
                    .ensure_rule("filter", chain, Position::Insert, &["-d", &dst, "-j", "ACCEPT"])
                    .await
                    .client(CLIENT)?;
            }
        }
        Ok(())
    }

    /// Containers must not reach private space through the SNAT leg.
    async fn block_private_space(&self) -> Result<()> {
        let subnet = self.bridge_subnet().to_string();
        for chain in ["FORWARD", "INPUT", "OUTPUT"] {
            for prefix in BLOCKED_PREFIXES {
                self.dp
                    .ipt4
                    .ensure_rule(
                        "filter",
                        chain,
                        Position::Append,
                        &["-s", &subnet, "-d", prefix, "-j", "DROP"],
                    )
                    .await
                    .client(CLIENT)?;
            }
        }
        Ok(())
    }

    async fn add_host_nc_rules(&self, ep: &EndpointInfo) -> Result<()> {
        let Some(container_ip) = self.container_ip(ep) else {
            return Err(Error::MalformedIp(
                "host<->NC rules require a LocalIP on the endpoint".into(),
            ))
            .client(CLIENT);
        };
        let bridge_ip = self.bridge_ip.addr.to_string();
        let container_ip = container_ip.to_string();
        let ipt = &self.dp.ipt4;

        ipt.ensure_chain("filter", names::CNI_INPUT_CHAIN).await.client(CLIENT)?;
        ipt.ensure_chain("filter", names::CNI_OUTPUT_CHAIN).await.client(CLIENT)?;
        ipt.ensure_jump("filter", "INPUT", names::CNI_INPUT_CHAIN)
            .await
            .client(CLIENT)?;
        ipt.ensure_jump("filter", "OUTPUT", names::CNI_OUTPUT_CHAIN)
            .await
            .client(CLIENT)?;

        if self.allow_host_to_nc {
            ipt.ensure_rule(
                "filter",
                names::CNI_OUTPUT_CHAIN,
                Position::Append,
                &["-s", &bridge_ip, "-d", &container_ip, "-j", "ACCEPT"],
            )
            .await
            .client(CLIENT)?;
            ipt.ensure_rule(
                "filter",
                names::CNI_INPUT_CHAIN,
                Position::Append,
                &[
                    "-i", names::SNAT_BRIDGE, "-m", "state", "--state", "ESTABLISHED,RELATED",
                    "-j", "ACCEPT",
                ],
            )
            .await
            .client(CLIENT)?;
        }

        if self.allow_nc_to_host {
            ipt.ensure_rule(
                "filter",
                names::CNI_INPUT_CHAIN,
                Position::Append,
                &["-s", &container_ip, "-d", &bridge_ip, "-j", "ACCEPT"],
            )
            .await
            .client(CLIENT)?;
            ipt.ensure_rule(
                "filter",
                names::CNI_OUTPUT_CHAIN,
                Position::Append,
                &[
                    "-o", names::SNAT_BRIDGE, "-m", "state", "--state", "ESTABLISHED,RELATED",
                    "-j", "ACCEPT",
                ],
            )
            .await
            .client(CLIENT)?;
        }

        // Keep ARP for the container address inside the VM.
        if let Some(ip) = self.container_ip(ep) {
            ok_if_exists(
                self.dp
                    .conn
                    .add_static_arp(names::SNAT_BRIDGE, ip, self.container_mac, false)
                    .await,
            )
            .client(CLIENT)?;
        }
        Ok(())
    }

    fn container_ip(&self, ep: &EndpointInfo) -> Option<IpAddr> {
        ep.local_ip.map(|net| net.addr)
    }

    pub(crate) async fn move_endpoints_to_container_ns(&mut self, ep: &EndpointInfo) -> Result<()> {
        move_link_to_ns(&self.dp.conn, &self.container_veth, &ep.netns_path)
            .await
            .client(CLIENT)
    }

    pub(crate) async fn setup_container_interfaces(&mut self, ep: &EndpointInfo) -> Result<()> {
        setup_container_interface(&ep.netns_path, &self.container_veth, SNAT_CONTAINER_IF)
            .await
            .client(CLIENT)
    }

    pub(crate) async fn configure_container_interfaces(&mut self, ep: &EndpointInfo) -> Result<()> {
        if let Some(local_ip) = ep.local_ip {
            super::assign_container_addresses(&ep.netns_path, SNAT_CONTAINER_IF, &[local_ip])
                .await
                .client(CLIENT)?;
        }
        Ok(())
    }

    pub(crate) async fn delete_endpoint_rules(&mut self, ep: &Endpoint) -> Result<()> {
        if let Some(local_ip) = ep.local_ip {
            let bridge_ip = self.bridge_ip.addr.to_string();
            let container_ip = local_ip.addr.to_string();
            let ipt = &self.dp.ipt4;

            ipt.delete_rule(
                "filter",
                names::CNI_OUTPUT_CHAIN,
                &["-s", &bridge_ip, "-d", &container_ip, "-j", "ACCEPT"],
            )
            .await;
            ipt.delete_rule(
                "filter",
                names::CNI_INPUT_CHAIN,
                &["-s", &container_ip, "-d", &bridge_ip, "-j", "ACCEPT"],
            )
            .await;

            let res = self
                .dp
                .conn
                .delete_static_arp(names::SNAT_BRIDGE, local_ip.addr, false)
                .await;
            if let Err(e) = res {
                if !e.is_not_found() {
                    return Err(e).client(CLIENT);
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn delete_endpoints(&mut self, ep: &Endpoint) -> Result<()> {
        let host_veth = snat_veth_name(&ep.id);
        let res = self.dp.conn.delete_link(&host_veth).await;
        if let Err(e) = res {
            if !e.is_not_found() {
                return Err(e).client(CLIENT);
            }
        }
        Ok(())
    }
}

/// Tear down the SNAT bridge and its bridge-wide rules. Called when the last
/// network that used SNAT goes away.
pub async fn delete_snat_bridge(dp: &DataPlane, bridge_ip: IpNet) -> Result<()> {
    let subnet = IpNet::new(
        crate::netlink::addr::network_of(bridge_ip.addr, bridge_ip.prefix_len),
        bridge_ip.prefix_len,
    )
    .to_string();

    dp.ipt4
        .delete_rule("nat", "POSTROUTING", &["-s", &subnet, "-j", "MASQUERADE"])
        .await;
    dp.ipt4.delete_rule("filter", "INPUT", &["-j", names::CNI_INPUT_CHAIN]).await;
    dp.ipt4.delete_rule("filter", "OUTPUT", &["-j", names::CNI_OUTPUT_CHAIN]).await;
    dp.ipt4.delete_chain("filter", names::CNI_INPUT_CHAIN).await;
    dp.ipt4.delete_chain("filter", names::CNI_OUTPUT_CHAIN).await;
    dp.ebtables
        .set_drop_8021q(Op::Delete, names::SNAT_BRIDGE)
        .await?;

    let res = dp.conn.delete_link(names::SNAT_BRIDGE).await;
    if let Err(e) = res {
        if !e.is_not_found() {
            return Err(e.into());
        }
    }
    Ok(())
}
