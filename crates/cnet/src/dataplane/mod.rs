//! CLI-driven data-plane programmers (ebtables, iptables, OVS).

pub mod ebtables;
pub mod iptables;
pub mod ovs;

pub use ebtables::{Ebtables, Op};
pub use iptables::{Iptables, Position};
pub use ovs::Ovs;
