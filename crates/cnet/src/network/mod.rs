//! Network/endpoint lifecycle engine.
//!
//! [`NetworkManager`] is the single entry point: it owns the nested
//! external-interface → network → endpoint model, serializes every public
//! operation, dispatches to the mode-specific data-plane clients, and
//! persists after each mutation.

pub mod bridge_client;
pub mod clients;
mod endpoint;
mod error;
pub mod manager;
pub mod model;
pub mod ovs_network_client;
pub mod routetable;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use manager::{Config, NetworkManager};
pub use model::{Endpoint, ExternalInterface, Network, STORE_KEY, State};
pub use store::{DEFAULT_LOCK_TIMEOUT, FileStore};
pub use types::{
    DnsInfo, EndpointInfo, IpNet, IpV6Mode, MacAddr, NetworkInfo, NetworkMode, RouteInfo,
    SubnetInfo,
};
