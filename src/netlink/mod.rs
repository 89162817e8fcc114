//! Link capability used by the VF and representor managers.
//!
//! The [`Netlink`] trait is the narrow set of link, VF-table and bridge VLAN
//! operations the plugin needs. [`iproute2::IpRoute2`] drives the kernel through
//! the `ip` and `bridge` tools, [`fake::FakeNetlink`] keeps everything in memory
//! and records every mutation for tests.

use std::collections::HashMap;

use crate::error::Result;
use crate::types::MacAddr;

pub mod fake;
pub mod iproute2;
pub mod netns;

pub use netns::{with_netns, NetNs, NetNsGuard, NetNsOps};

/// Link kind reported for Linux bridges.
pub const LINK_KIND_BRIDGE: &str = "bridge";
/// Link kind reported for bonding masters (and slave kind of their members).
pub const LINK_KIND_BOND: &str = "bond";

/// Administrative record of one VF in its physical function's VF table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfInfo {
    pub id: u32,
    pub mac: MacAddr,
}

/// Snapshot of a link's attributes, taken when the link was resolved.
///
/// The handle keeps its current name up to date when renamed through
/// [`Netlink::link_set_name`], the other attributes are not refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    /// `info_kind` of the link, e.g. `bridge` or `bond`. `None` for plain devices.
    pub kind: Option<String>,
    /// `info_slave_kind` when the link is enslaved, e.g. `bond` or `bridge`.
    pub slave_kind: Option<String>,
    pub master_index: Option<u32>,
    pub mac: Option<MacAddr>,
    pub mtu: u32,
    /// Administratively up (`IFF_UP`).
    pub up: bool,
    pub vfs: Vec<VfInfo>,
}

impl Link {
    /// Plain device handle with no master and no VF table.
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            kind: None,
            slave_kind: None,
            master_index: None,
            mac: None,
            mtu: 1500,
            up: false,
            vfs: Vec::new(),
        }
    }

    pub fn is_bridge(&self) -> bool {
        self.kind.as_deref() == Some(LINK_KIND_BRIDGE)
    }

    pub fn is_bond(&self) -> bool {
        self.kind.as_deref() == Some(LINK_KIND_BOND)
    }

    pub fn is_bond_slave(&self) -> bool {
        self.slave_kind.as_deref() == Some(LINK_KIND_BOND)
    }

    /// Finds the VF table entry with the given id.
    pub fn vf(&self, id: u32) -> Option<&VfInfo> {
        self.vfs.iter().find(|vf| vf.id == id)
    }
}

/// Flags accompanying a bridge VLAN add or delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct VlanFlags {
    /// VLAN is the port's PVID (untagged ingress default).
    pub pvid: bool,
    /// Egress frames leave the port untagged.
    pub untagged: bool,
    /// Apply to the bridge device itself.
    pub self_: bool,
    /// Apply to the port's bridge master.
    pub master: bool,
}

/// One entry of a port's bridge VLAN table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeVlanInfo {
    pub vid: u16,
    pub pvid: bool,
    pub untagged: bool,
}

/// Link operations the plugin orchestrates.
///
/// Handles are passed by reference and addressed by the name they carry, so a
/// rename must go through [`Netlink::link_set_name`] to keep the handle valid.
pub trait Netlink {
    fn link_by_name(&self, name: &str) -> Result<Link>;
    fn link_by_index(&self, index: u32) -> Result<Link>;
    fn link_set_up(&self, link: &Link) -> Result<()>;
    fn link_set_down(&self, link: &Link) -> Result<()>;
    /// Renames the link and updates the handle's name on success.
    fn link_set_name(&self, link: &mut Link, name: &str) -> Result<()>;
    fn link_set_hardware_addr(&self, link: &Link, mac: &MacAddr) -> Result<()>;
    /// Sets the administrative MAC of VF `vf` in the VF table of `pf`.
    fn link_set_vf_hardware_addr(&self, pf: &Link, vf: u32, mac: &MacAddr) -> Result<()>;
    fn link_set_mtu(&self, link: &Link, mtu: u32) -> Result<()>;
    /// Moves the link into the namespace referred to by `ns`.
    fn link_set_ns(&self, link: &Link, ns: &NetNs) -> Result<()>;
    fn link_set_master(&self, link: &Link, master: &Link) -> Result<()>;
    fn link_set_no_master(&self, link: &Link) -> Result<()>;
    fn bridge_vlan_add(&self, link: &Link, vid: u16, flags: VlanFlags) -> Result<()>;
    fn bridge_vlan_del(&self, link: &Link, vid: u16, flags: VlanFlags) -> Result<()>;
    /// VLAN tables of every bridge port in the current namespace, keyed by ifindex.
    fn bridge_vlan_list(&self) -> Result<HashMap<u32, Vec<BridgeVlanInfo>>>;
    /// Names of the links enslaved to the bridge called `bridge`.
    fn bridge_members(&self, bridge: &str) -> Result<Vec<String>>;
}
