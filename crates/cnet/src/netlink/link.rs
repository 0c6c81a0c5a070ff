//! Typed descriptors for the virtual link kinds this engine creates.
//!
//! Every descriptor carries the common link fields (name, MTU, transmit
//! queue length, hardware address) and serializes itself into an
//! RTM_NEWLINK request with the kind-specific LINKINFO nest.

use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::message::{flags, msg_type};
use super::types::{IfInfoMsg, IpvlanMode, ifla};

/// A link configuration that can be turned into an RTM_NEWLINK request.
pub trait LinkConfig {
    /// Interface name this descriptor will create.
    fn name(&self) -> &str;

    /// Kind string ("bridge", "veth", "ipvlan", "vlan", "dummy").
    fn kind(&self) -> &str;

    /// Build the creation request.
    fn build(&self) -> Result<MessageBuilder>;
}

/// Validate the common fields of a link descriptor.
pub fn validate(name: &str, kind: &str) -> Result<()> {
    if name.is_empty() || name.len() >= 16 || name.contains(['/', ' ']) {
        return Err(Error::InvalidLinkName(name.to_string()));
    }
    match kind {
        "bridge" | "veth" | "ipvlan" | "vlan" | "dummy" => Ok(()),
        other => Err(Error::InvalidLinkType(other.to_string())),
    }
}

/// Common optional link fields.
#[derive(Debug, Clone, Default)]
struct LinkAttrs {
    mtu: Option<u32>,
    txqlen: Option<u32>,
    address: Option<[u8; 6]>,
}

impl LinkAttrs {
    fn write_to(&self, builder: &mut MessageBuilder) {
        if let Some(mtu) = self.mtu {
            builder.append_attr_u32(ifla::MTU, mtu);
        }
        if let Some(txqlen) = self.txqlen {
            builder.append_attr_u32(ifla::TXQLEN, txqlen);
        }
        if let Some(addr) = self.address {
            builder.append_attr(ifla::ADDRESS, &addr);
        }
    }
}

fn new_link_request(name: &str, kind: &str, attrs: &LinkAttrs) -> Result<MessageBuilder> {
    validate(name, kind)?;
    let mut builder = MessageBuilder::new(
        msg_type::RTM_NEWLINK,
        flags::REQUEST | flags::ACK | flags::CREATE | flags::EXCL,
    );
    builder.append(&IfInfoMsg::new());
    builder.append_attr_str(ifla::IFNAME, name);
    attrs.write_to(&mut builder);
    Ok(builder)
}

// ============================================================================
// Bridge
// ============================================================================

/// A Linux bridge device.
#[derive(Debug, Clone)]
pub struct BridgeLink {
    name: String,
    attrs: LinkAttrs,
}

impl BridgeLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: LinkAttrs::default(),
        }
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.attrs.mtu = Some(mtu);
        self
    }
}

impl LinkConfig for BridgeLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "bridge"
    }

    fn build(&self) -> Result<MessageBuilder> {
        let mut builder = new_link_request(&self.name, self.kind(), &self.attrs)?;
        let info = builder.nest_start(ifla::LINKINFO);
        builder.append_attr_str(ifla::info::KIND, self.kind());
        builder.nest_end(info);
        Ok(builder)
    }
}

// ============================================================================
// Veth pair
// ============================================================================

/// A veth pair. The peer is created atomically with the first end; deleting
/// either end deletes both.
#[derive(Debug, Clone)]
pub struct VethLink {
    name: String,
    peer_name: String,
    attrs: LinkAttrs,
    peer_address: Option<[u8; 6]>,
}

impl VethLink {
    pub fn new(name: impl Into<String>, peer_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peer_name: peer_name.into(),
            attrs: LinkAttrs::default(),
            peer_address: None,
        }
    }

    /// MTU applied to both ends.
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.attrs.mtu = Some(mtu);
        self
    }

    pub fn txqlen(mut self, txqlen: u32) -> Self {
        self.attrs.txqlen = Some(txqlen);
        self
    }

    pub fn address(mut self, addr: [u8; 6]) -> Self {
        self.attrs.address = Some(addr);
        self
    }

    pub fn peer_address(mut self, addr: [u8; 6]) -> Self {
        self.peer_address = Some(addr);
        self
    }
}

impl LinkConfig for VethLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "veth"
    }

    fn build(&self) -> Result<MessageBuilder> {
        validate(&self.peer_name, self.kind())?;
        let mut builder = new_link_request(&self.name, self.kind(), &self.attrs)?;

        let info = builder.nest_start(ifla::LINKINFO);
        builder.append_attr_str(ifla::info::KIND, self.kind());
        let data = builder.nest_start(ifla::info::DATA);
        let peer = builder.nest_start(ifla::veth::PEER);
        // The peer nest holds a full ifinfomsg followed by the peer's own
        // attributes.
        builder.append(&IfInfoMsg::new());
        builder.append_attr_str(ifla::IFNAME, &self.peer_name);
        if let Some(mtu) = self.attrs.mtu {
            builder.append_attr_u32(ifla::MTU, mtu);
        }
        if let Some(addr) = self.peer_address {
            builder.append_attr(ifla::ADDRESS, &addr);
        }
        builder.nest_end(peer);
        builder.nest_end(data);
        builder.nest_end(info);
        Ok(builder)
    }
}

// ============================================================================
// IPVLAN
// ============================================================================

/// An IPVLAN child of a physical interface.
///
/// The parent is given by index; resolve it through the [`super::Connection`]
/// the link will be created on, so the lookup happens in the right namespace.
#[derive(Debug, Clone)]
pub struct IpvlanLink {
    name: String,
    parent_index: u32,
    mode: IpvlanMode,
    attrs: LinkAttrs,
}

impl IpvlanLink {
    pub fn new(name: impl Into<String>, parent_index: u32, mode: IpvlanMode) -> Self {
        Self {
            name: name.into(),
            parent_index,
            mode,
            attrs: LinkAttrs::default(),
        }
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.attrs.mtu = Some(mtu);
        self
    }
}

impl LinkConfig for IpvlanLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "ipvlan"
    }

    fn build(&self) -> Result<MessageBuilder> {
        let mut builder = new_link_request(&self.name, self.kind(), &self.attrs)?;
        builder.append_attr_u32(ifla::LINK, self.parent_index);

        let info = builder.nest_start(ifla::LINKINFO);
        builder.append_attr_str(ifla::info::KIND, self.kind());
        let data = builder.nest_start(ifla::info::DATA);
        builder.append_attr_u16(ifla::ipvlan::MODE, self.mode as u16);
        builder.nest_end(data);
        builder.nest_end(info);
        Ok(builder)
    }
}

// ============================================================================
// VLAN sub-interface
// ============================================================================

/// An 802.1Q VLAN child of a physical interface.
///
/// The parent is given by index, resolved through the connection the link
/// will be created on.
#[derive(Debug, Clone)]
pub struct VlanLink {
    name: String,
    parent_index: u32,
    vlan_id: u16,
    attrs: LinkAttrs,
}

impl VlanLink {
    pub fn new(name: impl Into<String>, parent_index: u32, vlan_id: u16) -> Self {
        Self {
            name: name.into(),
            parent_index,
            vlan_id,
            attrs: LinkAttrs::default(),
        }
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.attrs.mtu = Some(mtu);
        self
    }
}

impl LinkConfig for VlanLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "vlan"
    }

    fn build(&self) -> Result<MessageBuilder> {
        let mut builder = new_link_request(&self.name, self.kind(), &self.attrs)?;
        builder.append_attr_u32(ifla::LINK, self.parent_index);

        let info = builder.nest_start(ifla::LINKINFO);
        builder.append_attr_str(ifla::info::KIND, self.kind());
        let data = builder.nest_start(ifla::info::DATA);
        builder.append_attr_u16(ifla::vlan::ID, self.vlan_id);
        builder.nest_end(data);
        builder.nest_end(info);
        Ok(builder)
    }
}

// ============================================================================
// Dummy
// ============================================================================

/// A dummy interface; an anchor for addresses in tests and probes.
#[derive(Debug, Clone)]
pub struct DummyLink {
    name: String,
    attrs: LinkAttrs,
}

impl DummyLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: LinkAttrs::default(),
        }
    }
}

impl LinkConfig for DummyLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "dummy"
    }

    fn build(&self) -> Result<MessageBuilder> {
        let mut builder = new_link_request(&self.name, self.kind(), &self.attrs)?;
        let info = builder.nest_start(ifla::LINKINFO);
        builder.append_attr_str(ifla::info::KIND, self.kind());
        builder.nest_end(info);
        Ok(builder)
    }
}
