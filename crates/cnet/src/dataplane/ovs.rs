//! Open vSwitch programming through `ovs-vsctl` and `ovs-ofctl`.
//!
//! Bridge and port management is idempotent via `--may-exist`/`--if-exists`;
//! flows are keyed narrowly enough that `del-flows` with the original match
//! removes exactly what was added.

use std::net::IpAddr;

use crate::platform::exec::{Exec, ExecError, Result};

const VSCTL: &str = "ovs-vsctl";
const OFCTL: &str = "ovs-ofctl";

/// OVS bridge and flow programmer.
#[derive(Clone)]
pub struct Ovs {
    exec: Exec,
}

impl Ovs {
    pub fn new(exec: Exec) -> Self {
        Self { exec }
    }

    // ------------------------------------------------------------------------
    // Bridges and ports
    // ------------------------------------------------------------------------

    /// Create the bridge if missing.
    pub async fn create_bridge(&self, bridge: &str) -> Result<()> {
        self.exec
            .run(VSCTL, &["--may-exist", "add-br", bridge])
            .await?;
        Ok(())
    }

    /// Delete the bridge; missing bridge is fine.
    pub async fn delete_bridge(&self, bridge: &str) {
        self.exec
            .run_tolerated(VSCTL, &["--if-exists", "del-br", bridge])
            .await;
    }

    /// Add a port to the bridge, optionally tagging its traffic with a vlan.
    pub async fn add_port(&self, bridge: &str, port: &str, vlan: Option<u16>) -> Result<()> {
        let tag;
        let mut args = vec!["--may-exist", "add-port", bridge, port];
        if let Some(vlan) = vlan {
            tag = format!("tag={vlan}");
            args.push(&tag);
        }
        self.exec.run(VSCTL, &args).await?;
        Ok(())
    }

    /// Remove a port from the bridge; missing port is fine.
    pub async fn delete_port(&self, bridge: &str, port: &str) {
        self.exec
            .run_tolerated(VSCTL, &["--if-exists", "del-port", bridge, port])
            .await;
    }

    /// Resolve a port name to its OpenFlow port number.
    pub async fn ofport(&self, port: &str) -> Result<u32> {
        let out = self
            .exec
            .run(VSCTL, &["get", "Interface", port, "ofport"])
            .await?;
        out.trim().parse().map_err(|_| ExecError::CommandFailed {
            command: format!("{VSCTL} get Interface {port} ofport"),
            code: -1,
            stderr: format!("unparseable ofport {:?}", out.trim()),
        })
    }

    // ------------------------------------------------------------------------
    // Flows
    // ------------------------------------------------------------------------

    async fn add_flow(&self, bridge: &str, flow: &str) -> Result<()> {
        self.exec.run(OFCTL, &["add-flow", bridge, flow]).await?;
        Ok(())
    }

    async fn del_flows(&self, bridge: &str, matcher: &str) {
        self.exec
            .run_tolerated(OFCTL, &["del-flows", bridge, matcher])
            .await;
    }

    /// Rewrite the source MAC of ARP frames leaving through the uplink to
    /// the host's MAC.
    pub async fn add_arp_snat(&self, bridge: &str, uplink_ofport: u32, host_mac: &str) -> Result<()> {
        let flow = format!(
            "priority=10,arp,arp_op=1,actions=mod_dl_src:{host_mac},output:{uplink_ofport}"
        );
        self.add_flow(bridge, &flow).await
    }

    /// Drop the egress ARP rewrite.
    pub async fn delete_arp_snat(&self, bridge: &str) {
        self.del_flows(bridge, "arp,arp_op=1").await;
    }

    /// Rewrite inbound ARP replies on the uplink to broadcast so every port
    /// sees them; the per-endpoint DNAT flows then fix up the real MAC.
    pub async fn add_arp_reply_dnat(&self, bridge: &str, uplink_ofport: u32) -> Result<()> {
        let flow = format!(
            "priority=10,arp,arp_op=2,in_port={uplink_ofport},\
             actions=mod_dl_dst:ff:ff:ff:ff:ff:ff,normal"
        );
        self.add_flow(bridge, &flow).await
    }

    /// Drop the inbound ARP-reply rewrite.
    pub async fn delete_arp_reply_dnat(&self, bridge: &str, uplink_ofport: u32) {
        self.del_flows(bridge, &format!("arp,arp_op=2,in_port={uplink_ofport}"))
            .await;
    }

    /// Answer ARP requests for `ip` with `mac`, scoped to a vlan when the
    /// network is tagged. The flow turns the request around in place.
    pub async fn add_fake_arp_reply(
        &self,
        bridge: &str,
        vlan: u16,
        ip: IpAddr,
        mac: &str,
    ) -> Result<()> {
        let mac_hex = format!("0x{}", mac.replace(':', ""));
        let vlan_match = if vlan != 0 {
            format!("dl_vlan={vlan},")
        } else {
            String::new()
        };
        let flow = format!(
            "priority=20,arp,arp_op=1,{vlan_match}arp_tpa={ip},\
             actions=load:0x2->NXM_OF_ARP_OP[],\
             move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],\
             load:{mac_hex}->NXM_NX_ARP_SHA[],\
             move:NXM_OF_ARP_TPA[]->NXM_OF_ARP_SPA[],\
             strip_vlan,in_port"
        );
        self.add_flow(bridge, &flow).await
    }

    /// Remove the ARP responder flow for `ip`.
    pub async fn delete_fake_arp_reply(&self, bridge: &str, ip: IpAddr) {
        self.del_flows(bridge, &format!("arp,arp_tpa={ip}")).await;
    }

    /// Rewrite the source MAC of container traffic to the host MAC, bound to
    /// the container's port. A lower-priority drop catches the same source
    /// IP arriving on any other port (anti-spoofing).
    pub async fn add_ip_snat(
        &self,
        bridge: &str,
        ofport: u32,
        ip: IpAddr,
        host_mac: &str,
    ) -> Result<()> {
        let flow = format!(
            "priority=20,ip,in_port={ofport},nw_src={ip},actions=mod_dl_src:{host_mac},normal"
        );
        self.add_flow(bridge, &flow).await?;
        let drop = format!("priority=10,ip,nw_src={ip},actions=drop");
        self.add_flow(bridge, &drop).await
    }

    /// Remove the SNAT and anti-spoof flows for `ip`.
    pub async fn delete_ip_snat(&self, bridge: &str, ofport: u32, ip: IpAddr) {
        self.del_flows(bridge, &format!("ip,in_port={ofport},nw_src={ip}"))
            .await;
        self.del_flows(bridge, &format!("ip,nw_src={ip}")).await;
    }

    /// Steer inbound traffic for `ip` to the container port, restoring the
    /// container's MAC.
    pub async fn add_mac_dnat(
        &self,
        bridge: &str,
        uplink_ofport: u32,
        ip: IpAddr,
        mac: &str,
        vlan: u16,
        container_ofport: u32,
    ) -> Result<()> {
        let vlan_action = if vlan != 0 {
            format!("mod_vlan_vid:{vlan},")
        } else {
            String::new()
        };
        let flow = format!(
            "priority=20,ip,in_port={uplink_ofport},nw_dst={ip},\
             actions=mod_dl_dst:{mac},{vlan_action}output:{container_ofport}"
        );
        self.add_flow(bridge, &flow).await
    }

    /// Remove the inbound steering flow for `ip`.
    pub async fn delete_mac_dnat(&self, bridge: &str, uplink_ofport: u32, ip: IpAddr) {
        self.del_flows(bridge, &format!("ip,in_port={uplink_ofport},nw_dst={ip}"))
            .await;
    }
}
