//! Container networking data-plane engine for Linux.
//!
//! `cnet` attaches container network interfaces to an external host NIC,
//! programs the kernel's forwarding plane, and persists its model of
//! networks and endpoints so it survives process restarts and host reboots.
//!
//! The crate is layered bottom-up:
//!
//! - [`netlink`]: an RTNETLINK protocol client built from scratch; message
//!   framing, TLV attributes, sequence/port correlation, and typed
//!   operations over links, addresses, routes, and neighbors, plus network
//!   namespace handling.
//! - [`platform`]: command execution (with a recording mock for tests) and
//!   kernel tunables.
//! - [`dataplane`]: ebtables / iptables / Open vSwitch rule programmers.
//! - [`network`]: the lifecycle engine; the [`network::NetworkManager`]
//!   façade, the four endpoint-client variants (Linux bridge, OVS,
//!   transparent, transparent-vlan), the composable SNAT and infra-vnet
//!   sub-clients, and the persistent store.
//!
//! # Example
//!
//! ```ignore
//! use cnet::network::{Config, NetworkInfo, NetworkManager, NetworkMode};
//!
//! let manager = NetworkManager::new()?;
//! manager.initialize(&Config {
//!     store_path: Some("/var/lib/cnet/state.json".into()),
//!     ..Config::default()
//! }).await?;
//!
//! manager.add_external_interface("eth0", Some("10.0.0.0/24".parse()?)).await?;
//! manager.create_network(&NetworkInfo {
//!     id: "nw1".into(),
//!     mode: NetworkMode::Transparent,
//!     master_if_name: "eth0".into(),
//!     ..Default::default()
//! }).await?;
//! ```

pub mod dataplane;
pub mod netif;
pub mod netlink;
pub mod network;
pub mod platform;

pub use netlink::Connection;
pub use network::{NetworkManager, Result};
