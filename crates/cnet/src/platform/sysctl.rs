//! Kernel tunables, driven through the `sysctl` binary.
//!
//! Invocations go through [`Exec`] so rule tests can assert on them, and the
//! blocking form works from a namespace-entered thread, where the spawned
//! child inherits the thread's namespace and tunes that namespace's knobs.

use crate::platform::exec::{Exec, Result};

/// Sysctl knob writer.
#[derive(Clone)]
pub struct Sysctl {
    exec: Exec,
}

impl Sysctl {
    pub fn new(exec: Exec) -> Self {
        Self { exec }
    }

    /// Set a knob by dotted key.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let assignment = format!("{key}={value}");
        self.exec.run("sysctl", &["-w", &assignment]).await?;
        Ok(())
    }

    /// Blocking form for namespace-entered threads.
    pub fn set_blocking(&self, key: &str, value: &str) -> Result<()> {
        let assignment = format!("{key}={value}");
        self.exec.run_blocking("sysctl", &["-w", &assignment])?;
        Ok(())
    }

    /// Enable or disable proxy-ARP on an interface.
    pub async fn set_proxy_arp(&self, ifname: &str, on: bool) -> Result<()> {
        self.set(
            &format!("net.ipv4.conf.{ifname}.proxy_arp"),
            if on { "1" } else { "0" },
        )
        .await
    }

    /// Enable or disable router-advertisement acceptance on an interface.
    pub async fn set_accept_ra(&self, ifname: &str, on: bool) -> Result<()> {
        self.set(
            &format!("net.ipv6.conf.{ifname}.accept_ra"),
            if on { "1" } else { "0" },
        )
        .await
    }

    /// Enable IPv4 forwarding host-wide.
    pub async fn enable_ipv4_forwarding(&self) -> Result<()> {
        self.set("net.ipv4.ip_forward", "1").await
    }

    /// Enable IPv6 forwarding on all interfaces.
    pub async fn enable_ipv6_forwarding(&self) -> Result<()> {
        self.set("net.ipv6.conf.all.forwarding", "1").await
    }

    /// Re-enable IPv6 on all interfaces.
    pub async fn enable_ipv6(&self) -> Result<()> {
        self.set("net.ipv6.conf.all.disable_ipv6", "0").await
    }

    /// Disable reverse-path filtering on one interface (or "all").
    /// Blocking: used inside vnet namespaces.
    pub fn disable_rp_filter_blocking(&self, ifname: &str) -> Result<()> {
        self.set_blocking(&format!("net.ipv4.conf.{ifname}.rp_filter"), "0")
    }
}
