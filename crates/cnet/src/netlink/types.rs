//! Fixed-layout ancillary messages and RTNETLINK constants.
//!
//! Each struct mirrors the corresponding kernel C struct; zerocopy derives
//! give alignment-checked parsing and native-layout serialization.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Address families.
pub const AF_UNSPEC: u8 = 0;
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

/// Interface info message (struct ifinfomsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfInfoMsg {
    pub ifi_family: u8,
    pub ifi_pad: u8,
    pub ifi_type: u16,
    pub ifi_index: i32,
    pub ifi_flags: u32,
    pub ifi_change: u32,
}

impl IfInfoMsg {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(mut self, index: i32) -> Self {
        self.ifi_index = index;
        self
    }

    /// Parse from the front of a message payload.
    pub fn from_bytes(data: &[u8]) -> crate::netlink::Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| crate::netlink::Error::ShortResponse {
                expected: Self::SIZE,
                actual: data.len(),
            })
    }
}

/// Interface flags (IFF_*).
pub mod iff {
    pub const UP: u32 = 0x1;
    pub const BROADCAST: u32 = 0x2;
    pub const LOOPBACK: u32 = 0x8;
    pub const RUNNING: u32 = 0x40;
    pub const PROMISC: u32 = 0x100;
    pub const MULTICAST: u32 = 0x1000;
}

/// Link attributes (IFLA_*).
pub mod ifla {
    pub const ADDRESS: u16 = 1;
    pub const IFNAME: u16 = 3;
    pub const MTU: u16 = 4;
    pub const LINK: u16 = 5;
    pub const MASTER: u16 = 10;
    pub const TXQLEN: u16 = 13;
    pub const OPERSTATE: u16 = 16;
    pub const LINKINFO: u16 = 18;
    pub const NET_NS_FD: u16 = 28;

    /// Nested under LINKINFO.
    pub mod info {
        pub const KIND: u16 = 1;
        pub const DATA: u16 = 2;
    }

    /// Nested under LINKINFO/DATA for kind "veth".
    pub mod veth {
        pub const PEER: u16 = 1;
    }

    /// Nested under LINKINFO/DATA for kind "vlan".
    pub mod vlan {
        pub const ID: u16 = 1;
    }

    /// Nested under LINKINFO/DATA for kind "ipvlan".
    pub mod ipvlan {
        pub const MODE: u16 = 1;
    }

    /// Nested under a bridge-port PROTINFO attribute.
    pub mod brport {
        pub const MODE: u16 = 4;
        pub const PROXYARP: u16 = 10;
    }
}

/// Bridge port protinfo attribute id (IFLA_PROTINFO).
pub const IFLA_PROTINFO: u16 = 7;

/// IPVLAN operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IpvlanMode {
    L2 = 0,
    L3 = 1,
    L3S = 2,
}

/// Address info message (struct ifaddrmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfAddrMsg {
    pub ifa_family: u8,
    pub ifa_prefixlen: u8,
    pub ifa_flags: u8,
    pub ifa_scope: u8,
    pub ifa_index: u32,
}

impl IfAddrMsg {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: &[u8]) -> crate::netlink::Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| crate::netlink::Error::ShortResponse {
                expected: Self::SIZE,
                actual: data.len(),
            })
    }
}

/// Address attributes (IFA_*).
pub mod ifa {
    pub const ADDRESS: u16 = 1;
    pub const LOCAL: u16 = 2;
    pub const LABEL: u16 = 3;
    pub const BROADCAST: u16 = 4;
}

/// Route message (struct rtmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RtMsg {
    pub rtm_family: u8,
    pub rtm_dst_len: u8,
    pub rtm_src_len: u8,
    pub rtm_tos: u8,
    pub rtm_table: u8,
    pub rtm_protocol: u8,
    pub rtm_scope: u8,
    pub rtm_type: u8,
    pub rtm_flags: u32,
}

impl RtMsg {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: &[u8]) -> crate::netlink::Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| crate::netlink::Error::ShortResponse {
                expected: Self::SIZE,
                actual: data.len(),
            })
    }
}

/// Route attributes (RTA_*).
pub mod rta {
    pub const DST: u16 = 1;
    pub const SRC: u16 = 2;
    pub const IIF: u16 = 3;
    pub const OIF: u16 = 4;
    pub const GATEWAY: u16 = 5;
    pub const PRIORITY: u16 = 6;
    pub const PREFSRC: u16 = 7;
    pub const TABLE: u16 = 15;
}

/// Routing tables.
pub mod rt_table {
    pub const UNSPEC: u8 = 0;
    pub const DEFAULT: u8 = 253;
    pub const MAIN: u8 = 254;
    pub const LOCAL: u8 = 255;
}

/// Route origin protocols.
pub mod rt_proto {
    pub const UNSPEC: u8 = 0;
    pub const KERNEL: u8 = 2;
    pub const BOOT: u8 = 3;
    pub const STATIC: u8 = 4;
}

/// Route scopes.
pub mod rt_scope {
    pub const UNIVERSE: u8 = 0;
    pub const LINK: u8 = 253;
    pub const HOST: u8 = 254;
}

/// Route types.
pub mod rtn {
    pub const UNSPEC: u8 = 0;
    pub const UNICAST: u8 = 1;
    pub const LOCAL: u8 = 2;
    pub const BROADCAST: u8 = 3;
    pub const THROW: u8 = 9;
}

/// Route flags (rtm_flags).
pub mod rtm_flags {
    /// Route was cloned from another route by the kernel.
    pub const CLONED: u32 = 0x200;
}

/// Neighbor message (struct ndmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NdMsg {
    pub ndm_family: u8,
    pub ndm_pad1: u8,
    pub ndm_pad2: u16,
    pub ndm_ifindex: i32,
    pub ndm_state: u16,
    pub ndm_flags: u8,
    pub ndm_type: u8,
}

impl NdMsg {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new() -> Self {
        Self::default()
    }
}

/// Neighbor attributes (NDA_*).
pub mod nda {
    pub const DST: u16 = 1;
    pub const LLADDR: u16 = 2;
}

/// Neighbor cache states (NUD_*).
pub mod nud {
    pub const REACHABLE: u16 = 0x02;
    pub const PERMANENT: u16 = 0x80;
}

/// Neighbor flags (NTF_*).
pub mod ntf {
    pub const PROXY: u8 = 0x08;
}

/// Rule message header (struct fib_rule_hdr); layout-compatible with rtmsg.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FibRuleHdr {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub res1: u8,
    pub res2: u8,
    pub action: u8,
    pub flags: u32,
}

impl FibRuleHdr {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Rule attributes (FRA_*).
pub mod fra {
    pub const PRIORITY: u16 = 6;
    pub const FWMARK: u16 = 10;
    pub const TABLE: u16 = 15;
    pub const FWMASK: u16 = 16;
}

/// Rule action: lookup the selected table.
pub const FR_ACT_TO_TBL: u8 = 1;
