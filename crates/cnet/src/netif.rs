//! Thin interface-lookup shim over `/sys/class/net`.
//!
//! Kept separate from the netlink connection so call sites that only need a
//! name/index/address lookup do not have to round-trip through the kernel's
//! dump machinery, and so tests can point it at a fake sysfs tree.

use std::path::PathBuf;

use crate::netlink::{Error, Result};

fn sys_class_net() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

/// Interface name to index.
pub fn ifindex(name: &str) -> Result<u32> {
    let path = sys_class_net().join(name).join("ifindex");
    let content = std::fs::read_to_string(&path)
        .map_err(|_| Error::InterfaceNotFound { name: name.into() })?;
    content
        .trim()
        .parse()
        .map_err(|_| Error::InvalidMessage(format!("bad ifindex for {name}")))
}

/// Check whether an interface exists.
pub fn exists(name: &str) -> bool {
    sys_class_net().join(name).exists()
}

/// Interface hardware address.
pub fn hardware_addr(name: &str) -> Result<[u8; 6]> {
    let path = sys_class_net().join(name).join("address");
    let content = std::fs::read_to_string(&path)
        .map_err(|_| Error::InterfaceNotFound { name: name.into() })?;
    parse_mac(content.trim())
}

/// Interface MTU.
pub fn mtu(name: &str) -> Result<u32> {
    let path = sys_class_net().join(name).join("mtu");
    let content = std::fs::read_to_string(&path)
        .map_err(|_| Error::InterfaceNotFound { name: name.into() })?;
    content
        .trim()
        .parse()
        .map_err(|_| Error::InvalidMessage(format!("bad mtu for {name}")))
}

/// Parse a colon-separated hardware address.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        let part = parts
            .next()
            .ok_or_else(|| Error::InvalidAttribute(format!("bad hardware address: {s}")))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::InvalidAttribute(format!("bad hardware address: {s}")))?;
    }
    if parts.next().is_some() {
        return Err(Error::InvalidAttribute(format!("bad hardware address: {s}")));
    }
    Ok(mac)
}

/// Format a hardware address in the conventional colon notation.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
