//! Route-table snapshot and restore from `route print`-style text output.
//!
//! An auxiliary path for hosts whose routing stack is driven through the
//! `route` CLI rather than netlink; the netlink path remains primary. Data
//! lines carry exactly five whitespace fields (destination, netmask,
//! gateway, interface, metric). Anything else (banners, column headers,
//! truncated trailing entries) is filtered out rather than accounted for by
//! index arithmetic.

use std::net::Ipv4Addr;

use tracing::info;

use crate::platform::exec::{Exec, Result};

/// One IPv4 route-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Gateway address, or `None` for on-link routes.
    pub gateway: Option<Ipv4Addr>,
    pub interface: Ipv4Addr,
    pub metric: u32,
}

impl RouteEntry {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        Some(Self {
            destination: fields[0].parse().ok()?,
            netmask: fields[1].parse().ok()?,
            gateway: match fields[2] {
                "On-link" => None,
                gw => Some(gw.parse().ok()?),
            },
            interface: fields[3].parse().ok()?,
            metric: fields[4].parse().ok()?,
        })
    }
}

/// Parse a route-table dump, keeping only well-formed entries.
pub fn parse_route_table(output: &str) -> Vec<RouteEntry> {
    output.lines().filter_map(RouteEntry::parse).collect()
}

/// A saved routing table that can re-install entries lost underneath it.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    /// Snapshot the current table.
    pub async fn snapshot(exec: &Exec) -> Result<Self> {
        let output = exec.run("route", &["print", "-4"]).await?;
        Ok(Self {
            entries: parse_route_table(&output),
        })
    }

    /// Number of saved entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reinstall every saved entry missing from the current table.
    pub async fn restore(&self, exec: &Exec) -> Result<()> {
        let current = Self::snapshot(exec).await?;
        for entry in &self.entries {
            if current.entries.contains(entry) {
                continue;
            }
            let destination = entry.destination.to_string();
            let netmask = entry.netmask.to_string();
            let gateway = entry
                .gateway
                .map(|g| g.to_string())
                .unwrap_or_else(|| entry.interface.to_string());
            let metric = entry.metric.to_string();
            exec.run(
                "route",
                &[
                    "add", &destination, "mask", &netmask, &gateway, "metric", &metric,
                ],
            )
            .await?;
            info!(destination = %entry.destination, "restored missing route");
        }
        Ok(())
    }
}
