//! RTNETLINK protocol client.
//!
//! Implements the kernel's routing netlink protocol from scratch: message
//! framing, TLV attributes with nesting, sequence/port correlation, and
//! typed operations over links, addresses, routes, neighbors, and policy
//! rules. A [`Connection`] owns one socket and one namespace; see
//! [`namespace`] for how work crosses namespaces.

pub mod addr;
mod builder;
pub mod connection;
mod error;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod link;
pub mod message;
pub mod messages;
pub mod namespace;
pub mod route;
mod socket;
pub mod types;

pub mod attr;

pub use builder::{MessageBuilder, NestToken};
pub use connection::Connection;
pub use error::{Error, Result, ok_if_exists};
pub use link::{BridgeLink, DummyLink, IpvlanLink, LinkConfig, VethLink, VlanLink};
pub use message::{MessageIter, NLMSG_HDRLEN, NlMsgHdr};
pub use messages::{AddressMessage, LinkMessage};
pub use namespace::{NetNs, NsGuard, run_in_namespace};
pub use route::{Route, RouteFilter};
pub use socket::NetlinkSocket;
pub use types::IpvlanMode;
