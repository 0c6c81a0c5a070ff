//! Layer-2 rule programming through `ebtables`.
//!
//! All rules live in the nat/broute/filter tables and are keyed narrowly
//! enough to be deleted with the same argument vector that created them.
//! Deletion is tolerant: a missing rule is not an error, so teardown paths
//! can run after partial setup.

use crate::platform::exec::{Exec, Result};
use std::net::IpAddr;

const EBTABLES: &str = "ebtables";

/// Rule operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Append,
    Delete,
}

impl Op {
    fn flag(self) -> &'static str {
        match self {
            Op::Append => "-A",
            Op::Delete => "-D",
        }
    }
}

/// ebtables rule programmer.
#[derive(Clone)]
pub struct Ebtables {
    exec: Exec,
}

impl Ebtables {
    pub fn new(exec: Exec) -> Self {
        Self { exec }
    }

    async fn run(&self, op: Op, args: &[&str]) -> Result<()> {
        match op {
            Op::Append => {
                self.exec.run(EBTABLES, args).await?;
            }
            Op::Delete => {
                // Not-found is expected on repeated teardown.
                self.exec.run_tolerated(EBTABLES, args).await;
            }
        }
        Ok(())
    }

    /// Rewrite the source MAC of frames leaving through `ifname` to the
    /// host's MAC (and fix up ARP payloads to match).
    pub async fn set_egress_mac_snat(&self, op: Op, ifname: &str, host_mac: &str) -> Result<()> {
        self.run(
            op,
            &[
                "-t", "nat", op.flag(), "POSTROUTING", "-s", "Unicast", "-o", ifname, "-j",
                "snat", "--to-src", host_mac, "--snat-arp", "--snat-target", "ACCEPT",
            ],
        )
        .await
    }

    /// Answer ARP requests for `ip` with `mac` instead of flooding them.
    pub async fn set_arp_reply(&self, op: Op, ip: IpAddr, mac: &str) -> Result<()> {
        let ip_str = ip.to_string();
        self.run(
            op,
            &[
                "-t", "nat", op.flag(), "PREROUTING", "-p", "ARP", "--arp-op", "Request",
                "--arp-ip-dst", &ip_str, "-j", "arpreply", "--arpreply-mac", mac,
            ],
        )
        .await
    }

    /// Rewrite inbound ARP replies on `ifname` to broadcast so the bridge
    /// floods them to the container ports.
    pub async fn set_arp_reply_dnat(&self, op: Op, ifname: &str) -> Result<()> {
        self.run(
            op,
            &[
                "-t", "nat", op.flag(), "PREROUTING", "-i", ifname, "-p", "ARP", "--arp-op",
                "Reply", "-j", "dnat", "--to-dst", "ff:ff:ff:ff:ff:ff", "--dnat-target",
                "ACCEPT",
            ],
        )
        .await
    }

    /// Rewrite the destination MAC of traffic for `ip` arriving on `ifname`
    /// to the container's MAC.
    pub async fn set_ip_mac_dnat(&self, op: Op, ifname: &str, ip: IpAddr, mac: &str) -> Result<()> {
        let ip_str = ip.to_string();
        let (proto, dst_flag) = match ip {
            IpAddr::V4(_) => ("IPv4", "--ip-dst"),
            IpAddr::V6(_) => ("IPv6", "--ip6-dst"),
        };
        self.run(
            op,
            &[
                "-t", "nat", op.flag(), "PREROUTING", "-p", proto, "-i", ifname, dst_flag,
                &ip_str, "-j", "dnat", "--to-dst", mac, "--dnat-target", "ACCEPT",
            ],
        )
        .await
    }

    /// Punt traffic for a prefix up to layer 3 instead of bridging it.
    pub async fn set_broute_accept(&self, op: Op, prefix: &str, v6: bool) -> Result<()> {
        let (proto, dst_flag) = if v6 {
            ("IPv6", "--ip6-dst")
        } else {
            ("IPv4", "--ip-dst")
        };
        self.run(
            op,
            &[
                "-t", "broute", op.flag(), "BROUTING", "-p", proto, dst_flag, prefix, "-j",
                "redirect", "--redirect-target", "ACCEPT",
            ],
        )
        .await
    }

    /// Drop inbound ICMPv6 neighbor solicitations on `ifname`; the fabric
    /// must not learn container addresses from the host NIC.
    pub async fn set_drop_icmpv6_solicit(&self, op: Op, ifname: &str) -> Result<()> {
        self.run(
            op,
            &[
                "-t", "nat", op.flag(), "PREROUTING", "-i", ifname, "-p", "IPv6",
                "--ip6-proto", "ipv6-icmp", "--ip6-icmp-type", "neighbour-solicitation", "-j",
                "DROP",
            ],
        )
        .await
    }

    /// Drop all 802.1Q tagged frames traversing `bridge`.
    pub async fn set_drop_8021q(&self, op: Op, bridge: &str) -> Result<()> {
        self.run(
            op,
            &[
                "-t", "filter", op.flag(), "FORWARD", "-p", "802_1Q", "--logical-in", bridge,
                "-j", "DROP",
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_arp_reply_rule_shape() {
        let exec = Exec::mock();
        let ebt = Ebtables::new(exec.clone());
        ebt.set_arp_reply(Op::Append, "10.0.0.4".parse().unwrap(), "aa:bb:cc:dd:ee:ff")
            .await
            .unwrap();

        let recorded = exec.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(
            recorded[0],
            "ebtables -t nat -A PREROUTING -p ARP --arp-op Request \
             --arp-ip-dst 10.0.0.4 -j arpreply --arpreply-mac aa:bb:cc:dd:ee:ff"
        );
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_rule() {
        let exec = Exec::mock();
        exec.fail_on("ebtables", "rule does not exist");
        let ebt = Ebtables::new(exec.clone());
        ebt.set_ip_mac_dnat(
            Op::Delete,
            "eth0",
            "10.1.0.5".parse().unwrap(),
            "aa:bb:cc:dd:ee:01",
        )
        .await
        .unwrap();
        assert!(exec.saw("-D PREROUTING"));
    }

    #[tokio::test]
    async fn test_v6_dnat_uses_ip6_matches() {
        let exec = Exec::mock();
        let ebt = Ebtables::new(exec.clone());
        ebt.set_ip_mac_dnat(
            Op::Append,
            "eth0",
            "fc00::4".parse().unwrap(),
            "aa:bb:cc:dd:ee:02",
        )
        .await
        .unwrap();
        assert!(exec.saw("-p IPv6"));
        assert!(exec.saw("--ip6-dst fc00::4"));
    }
}
