//! OVS network client: bridge lifecycle and the uplink's ARP flows.

use tracing::{info, warn};

use super::error::{ClientContext, Result};
use super::model::ExternalInterface;
use crate::network::clients::DataPlane;

const CLIENT: &str = "OvsNetworkClient";

pub struct OvsNetworkClient {
    dp: DataPlane,
    bridge_name: String,
    primary_if: String,
}

impl OvsNetworkClient {
    pub fn new(dp: DataPlane, bridge_name: impl Into<String>, primary_if: impl Into<String>) -> Self {
        Self {
            dp,
            bridge_name: bridge_name.into(),
            primary_if: primary_if.into(),
        }
    }

    /// Create the OVS bridge.
    pub async fn create_bridge(&self) -> Result<()> {
        self.dp.ovs.create_bridge(&self.bridge_name).await.client(CLIENT)?;
        self.dp
            .conn
            .set_link_state(&self.bridge_name, true)
            .await
            .client(CLIENT)?;
        info!(bridge = %self.bridge_name, "ovs bridge created");
        Ok(())
    }

    /// Delete the OVS bridge; missing bridge is fine.
    pub async fn delete_bridge(&self) {
        self.dp.ovs.delete_bridge(&self.bridge_name).await;
    }

    /// Attach the uplink and program the bridge-wide ARP flows.
    pub async fn add_l2_rules(&self, ext_if: &ExternalInterface) -> Result<()> {
        let ovs = &self.dp.ovs;
        ovs.add_port(&self.bridge_name, &self.primary_if, None)
            .await
            .client(CLIENT)?;

        let uplink = ovs.ofport(&self.primary_if).await.client(CLIENT)?;
        ovs.add_arp_snat(&self.bridge_name, uplink, &ext_if.mac_address.to_string())
            .await
            .client(CLIENT)?;
        ovs.add_arp_reply_dnat(&self.bridge_name, uplink)
            .await
            .client(CLIENT)?;
        Ok(())
    }

    /// Remove the bridge-wide flows and detach the uplink. Idempotent.
    pub async fn delete_l2_rules(&self, _ext_if: &ExternalInterface) {
        let ovs = &self.dp.ovs;
        match ovs.ofport(&self.primary_if).await {
            Ok(uplink) => {
                ovs.delete_arp_snat(&self.bridge_name).await;
                ovs.delete_arp_reply_dnat(&self.bridge_name, uplink).await;
            }
            Err(e) => {
                warn!(error = %e, "uplink port already gone, skipping flow cleanup");
            }
        }
        ovs.delete_port(&self.bridge_name, &self.primary_if).await;
    }
}
