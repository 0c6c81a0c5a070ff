//! Integration test entry point.
//!
//! These tests drive real kernel state inside throwaway network namespaces
//! and require root:
//!
//! ```bash
//! sudo cargo test --test integration --features integration
//! ```
//!
//! Without root every test skips itself. CLI-driven layers (ebtables,
//! iptables, OVS, sysctl) run against the recording mock so the suite needs
//! no data-plane binaries; netlink state is exercised for real.

#![cfg(feature = "integration")]

#[macro_use]
#[path = "common/mod.rs"]
mod common;

#[path = "integration/link.rs"]
mod link;

#[path = "integration/route.rs"]
mod route;

#[path = "integration/namespace.rs"]
mod namespace;

#[path = "integration/endpoint.rs"]
mod endpoint;

#[path = "integration/manager.rs"]
mod manager;

#[path = "integration/vlan.rs"]
mod vlan;
