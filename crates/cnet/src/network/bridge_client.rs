//! Linux-bridge network client: the per-network L2 programming shared by
//! every endpoint riding the bridge.

use tracing::{info, warn};

use super::error::{ClientContext, Result};
use super::model::ExternalInterface;
use super::types::{IpNet, NetworkMode};
use crate::dataplane::Op;
use crate::netlink::BridgeLink;
use crate::network::clients::DataPlane;

const CLIENT: &str = "LinuxBridgeClient";

/// IPv6 multicast neighbor-solicit prefix that must reach containers.
const V6_SOLICIT_PREFIX: &str = "ff02::1:ff00:0/104";

pub struct LinuxBridgeClient {
    dp: DataPlane,
    bridge_name: String,
    primary_if: String,
    mode: NetworkMode,
    ipv6_enabled: bool,
    /// Pod prefix punted to layer 3 when IPv6 is on.
    pod_cidr: Option<IpNet>,
    disable_hairpin_on_host_interface: bool,
}

impl LinuxBridgeClient {
    pub fn new(
        dp: DataPlane,
        bridge_name: impl Into<String>,
        primary_if: impl Into<String>,
        mode: NetworkMode,
        ipv6_enabled: bool,
        pod_cidr: Option<IpNet>,
        disable_hairpin_on_host_interface: bool,
    ) -> Self {
        Self {
            dp,
            bridge_name: bridge_name.into(),
            primary_if: primary_if.into(),
            mode,
            ipv6_enabled,
            pod_cidr,
            disable_hairpin_on_host_interface,
        }
    }

    /// Create the host bridge and keep router advertisements away from it.
    pub async fn create_bridge(&self) -> Result<()> {
        if self.dp.conn.get_link_by_name(&self.bridge_name).await.is_err() {
            self.dp
                .conn
                .add_link(BridgeLink::new(&self.bridge_name))
                .await
                .client(CLIENT)?;
        }
        if let Err(e) = self.dp.sysctl.set_accept_ra(&self.bridge_name, false).await {
            warn!(error = %e, bridge = %self.bridge_name, "cannot disable accept_ra");
        }
        self.dp
            .conn
            .set_link_state(&self.bridge_name, true)
            .await
            .client(CLIENT)?;
        info!(bridge = %self.bridge_name, "bridge created");
        Ok(())
    }

    /// Detach the external NIC and delete the bridge. Best effort: teardown
    /// must survive a bridge that never finished connecting.
    pub async fn delete_bridge(&self) {
        if let Err(e) = self.dp.conn.set_link_master(&self.primary_if, "").await {
            warn!(error = %e, "cannot detach external interface from bridge");
        }
        if let Err(e) = self.dp.conn.delete_link(&self.bridge_name).await {
            if !e.is_not_found() {
                warn!(error = %e, bridge = %self.bridge_name, "cannot delete bridge");
            }
        }
    }

    /// Program the network-wide L2 rules on the external interface.
    pub async fn add_l2_rules(&self, ext_if: &ExternalInterface) -> Result<()> {
        self.set_l2_rules(Op::Append, ext_if).await?;

        if self.ipv6_enabled {
            self.dp.sysctl.enable_ipv6_forwarding().await.client(CLIENT)?;
        }

        // Tunnel mode is VEPA: the host NIC reflects every frame up to the
        // SDN, including bridge-local traffic.
        if self.mode == NetworkMode::Tunnel && !self.disable_hairpin_on_host_interface {
            self.dp
                .conn
                .set_link_hairpin(&self.primary_if, true)
                .await
                .client(CLIENT)?;
        }
        Ok(())
    }

    /// Remove the network-wide L2 rules; missing rules are not an error.
    pub async fn delete_l2_rules(&self, ext_if: &ExternalInterface) {
        if let Err(e) = self.set_l2_rules(Op::Delete, ext_if).await {
            warn!(error = %e, "tolerated failure deleting L2 rules");
        }
    }

    async fn set_l2_rules(&self, op: Op, ext_if: &ExternalInterface) -> Result<()> {
        let host_mac = ext_if.mac_address.to_string();
        let ebt = &self.dp.ebtables;

        ebt.set_egress_mac_snat(op, &self.primary_if, &host_mac)
            .await
            .client(CLIENT)?;

        // The fabric never answers ARP for the host's own address; the host
        // answers for itself.
        for addr in &ext_if.ip_addresses {
            if addr.addr.is_ipv4() {
                ebt.set_arp_reply(op, addr.addr, &host_mac).await.client(CLIENT)?;
            }
        }

        ebt.set_arp_reply_dnat(op, &self.primary_if)
            .await
            .client(CLIENT)?;

        if self.ipv6_enabled {
            if let Some(pod_cidr) = &self.pod_cidr {
                ebt.set_broute_accept(op, &pod_cidr.to_string(), true)
                    .await
                    .client(CLIENT)?;
            }
            ebt.set_broute_accept(op, V6_SOLICIT_PREFIX, true)
                .await
                .client(CLIENT)?;
            ebt.set_drop_icmpv6_solicit(op, &self.primary_if)
                .await
                .client(CLIENT)?;
        }
        Ok(())
    }
}
