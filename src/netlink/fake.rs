//! In-memory link capability that records every mutation.
//!
//! [`FakeNetlink`] models links living in namespaces identified by path, bridge
//! VLAN tables and VF tables closely enough to exercise the managers without
//! privileges. Namespaces are ordinary files (e.g. inside a temp dir) so that
//! [`NetNs`] handles can be opened on them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{BridgeVlanInfo, Link, NetNs, NetNsOps, Netlink, VlanFlags, LINK_KIND_BOND, LINK_KIND_BRIDGE};
use crate::error::{Error, Result};
use crate::types::MacAddr;

/// A mutation performed through the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SetUp(String),
    SetDown(String),
    SetName { from: String, to: String },
    SetHardwareAddr(String, MacAddr),
    SetVfHardwareAddr { pf: String, vf: u32, mac: MacAddr },
    SetMtu(String, u32),
    SetNs(String, PathBuf),
    SetMaster { link: String, master: String },
    SetNoMaster(String),
    VlanAdd { link: String, vid: u16, flags: VlanFlags },
    VlanDel { link: String, vid: u16, flags: VlanFlags },
}

impl Call {
    /// Name of the link the call targets.
    pub fn link(&self) -> &str {
        match self {
            Call::SetUp(l)
            | Call::SetDown(l)
            | Call::SetHardwareAddr(l, _)
            | Call::SetMtu(l, _)
            | Call::SetNs(l, _)
            | Call::SetNoMaster(l) => l,
            Call::SetName { from, .. } => from,
            Call::SetVfHardwareAddr { pf, .. } => pf,
            Call::SetMaster { link, .. } | Call::VlanAdd { link, .. } | Call::VlanDel { link, .. } => link,
        }
    }
}

type FailurePredicate = Box<dyn Fn(&Call) -> bool>;

#[derive(Debug, Clone)]
struct FakeLink {
    link: Link,
    ns: PathBuf,
    vlans: Vec<BridgeVlanInfo>,
    /// Re-adding a VLAN updates its flags instead of failing.
    shared: bool,
}

struct State {
    links: Vec<FakeLink>,
    next_index: u32,
    active_ns: PathBuf,
    calls: Vec<Call>,
    failures: Vec<FailurePredicate>,
    fail_ns_switch: bool,
}

/// Recording, in-memory [`Netlink`] and [`NetNsOps`] implementation.
pub struct FakeNetlink {
    host_ns: PathBuf,
    state: RefCell<State>,
}

impl FakeNetlink {
    /// Creates an empty fake whose calling thread starts in `host_ns`.
    pub fn new(host_ns: impl Into<PathBuf>) -> Self {
        let host_ns = host_ns.into();
        Self {
            state: RefCell::new(State {
                links: Vec::new(),
                next_index: 1,
                active_ns: host_ns.clone(),
                calls: Vec::new(),
                failures: Vec::new(),
                fail_ns_switch: false,
            }),
            host_ns,
        }
    }

    /// Adds a link to the host namespace. An index of 0 is replaced by the next free one.
    pub fn add_link(&self, link: Link) -> u32 {
        let host = self.host_ns.clone();
        self.add_link_in(&host, link)
    }

    /// Adds a link to the namespace at `ns`.
    pub fn add_link_in(&self, ns: &Path, mut link: Link) -> u32 {
        let mut state = self.state.borrow_mut();
        if link.index == 0 {
            link.index = state.next_index;
        }
        state.next_index = state.next_index.max(link.index) + 1;
        let index = link.index;
        state.links.push(FakeLink {
            link,
            ns: ns.to_path_buf(),
            vlans: Vec::new(),
            shared: false,
        });
        index
    }

    pub fn add_device(&self, name: &str) -> u32 {
        self.add_link(Link::new(0, name))
    }

    pub fn add_bridge(&self, name: &str) -> u32 {
        let mut link = Link::new(0, name);
        link.kind = Some(LINK_KIND_BRIDGE.to_string());
        self.add_link(link)
    }

    pub fn add_bond(&self, name: &str) -> u32 {
        let mut link = Link::new(0, name);
        link.kind = Some(LINK_KIND_BOND.to_string());
        self.add_link(link)
    }

    /// Enslaves `slave` to `master` without recording a call.
    ///
    /// Joining a bridge gives the port the kernel's default VLAN 1 (PVID, untagged).
    pub fn enslave(&self, slave: &str, master: &str) {
        let mut state = self.state.borrow_mut();
        let master = state
            .links
            .iter()
            .find(|l| l.link.name == master)
            .map(|l| l.link.clone())
            .unwrap_or_else(|| panic!("no link named {master}"));
        let slave = state
            .links
            .iter_mut()
            .find(|l| l.link.name == slave)
            .unwrap_or_else(|| panic!("no link named {slave}"));
        Self::attach(slave, &master);
    }

    /// Marks `link` as a port several attachments share, such as the PF uplink
    /// or its bond.
    ///
    /// A shared port accepts a VLAN it already carries and takes the new flags,
    /// as the kernel does. Other ports reject a duplicate add, so repeating an
    /// attach on the same representor fails.
    pub fn share_port(&self, link: &str) {
        let mut state = self.state.borrow_mut();
        let port = state
            .links
            .iter_mut()
            .find(|l| l.link.name == link)
            .unwrap_or_else(|| panic!("no link named {link}"));
        port.shared = true;
    }

    /// Seeds a VLAN entry on a port without recording a call.
    pub fn add_port_vlan(&self, link: &str, vid: u16, pvid: bool, untagged: bool) {
        let mut state = self.state.borrow_mut();
        let port = state
            .links
            .iter_mut()
            .find(|l| l.link.name == link)
            .unwrap_or_else(|| panic!("no link named {link}"));
        port.vlans.push(BridgeVlanInfo { vid, pvid, untagged });
    }

    /// Makes every future call matching `pred` fail with a kernel error.
    pub fn fail_when(&self, pred: impl Fn(&Call) -> bool + 'static) {
        self.state.borrow_mut().failures.push(Box::new(pred));
    }

    pub fn fail_ns_switch(&self, fail: bool) {
        self.state.borrow_mut().fail_ns_switch = fail;
    }

    /// Mutations performed so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Namespace the calling thread is currently in.
    pub fn active_ns(&self) -> PathBuf {
        self.state.borrow().active_ns.clone()
    }

    /// Current attributes of the link called `name`, in any namespace.
    pub fn link(&self, name: &str) -> Option<Link> {
        self.find_any(name).map(|l| l.link)
    }

    pub fn ns_of(&self, name: &str) -> Option<PathBuf> {
        self.find_any(name).map(|l| l.ns)
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.find_any(name).map(|l| l.link.up).unwrap_or(false)
    }

    pub fn port_vlans(&self, name: &str) -> Vec<BridgeVlanInfo> {
        self.find_any(name).map(|l| l.vlans).unwrap_or_default()
    }

    /// VLAN ids on a port, sorted.
    pub fn port_vids(&self, name: &str) -> Vec<u16> {
        let mut vids: Vec<u16> = self.port_vlans(name).iter().map(|v| v.vid).collect();
        vids.sort_unstable();
        vids
    }

    fn find_any(&self, name: &str) -> Option<FakeLink> {
        self.state.borrow().links.iter().find(|l| l.link.name == name).cloned()
    }

    fn attach(slave: &mut FakeLink, master: &Link) {
        slave.link.master_index = Some(master.index);
        slave.link.slave_kind = master.kind.clone();
        if master.is_bridge() {
            slave.vlans = vec![BridgeVlanInfo {
                vid: 1,
                pvid: true,
                untagged: true,
            }];
        }
    }

    /// Checks injected failures, applies `f` to the named link in the active
    /// namespace and records `call` on success.
    fn mutate<T>(
        &self,
        op: &'static str,
        call: Call,
        f: impl FnOnce(&mut State, usize) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.borrow_mut();
        let name = call.link().to_string();
        if state.failures.iter().any(|pred| pred(&call)) {
            return Err(Error::kernel(op, name, "injected failure"));
        }
        let pos = state
            .links
            .iter()
            .position(|l| l.link.name == name && l.ns == state.active_ns)
            .ok_or_else(|| Error::not_found("link", name.clone()))?;
        let out = f(&mut *state, pos)?;
        state.calls.push(call);
        Ok(out)
    }
}

impl Netlink for FakeNetlink {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        let state = self.state.borrow();
        state
            .links
            .iter()
            .find(|l| l.link.name == name && l.ns == state.active_ns)
            .map(|l| l.link.clone())
            .ok_or_else(|| Error::not_found("link", name))
    }

    fn link_by_index(&self, index: u32) -> Result<Link> {
        let state = self.state.borrow();
        state
            .links
            .iter()
            .find(|l| l.link.index == index && l.ns == state.active_ns)
            .map(|l| l.link.clone())
            .ok_or_else(|| Error::not_found("link index", index.to_string()))
    }

    fn link_set_up(&self, link: &Link) -> Result<()> {
        self.mutate("set link up", Call::SetUp(link.name.clone()), |s, i| {
            s.links[i].link.up = true;
            Ok(())
        })
    }

    fn link_set_down(&self, link: &Link) -> Result<()> {
        self.mutate("set link down", Call::SetDown(link.name.clone()), |s, i| {
            s.links[i].link.up = false;
            Ok(())
        })
    }

    fn link_set_name(&self, link: &mut Link, name: &str) -> Result<()> {
        let call = Call::SetName {
            from: link.name.clone(),
            to: name.to_string(),
        };
        self.mutate("rename link", call, |s, i| {
            let ns = s.links[i].ns.clone();
            if s.links.iter().any(|l| l.link.name == name && l.ns == ns) {
                return Err(Error::kernel("rename link", name, "File exists"));
            }
            s.links[i].link.name = name.to_string();
            Ok(())
        })?;
        link.name = name.to_string();
        Ok(())
    }

    fn link_set_hardware_addr(&self, link: &Link, mac: &MacAddr) -> Result<()> {
        self.mutate("set hardware address", Call::SetHardwareAddr(link.name.clone(), *mac), |s, i| {
            s.links[i].link.mac = Some(*mac);
            Ok(())
        })
    }

    fn link_set_vf_hardware_addr(&self, pf: &Link, vf: u32, mac: &MacAddr) -> Result<()> {
        let call = Call::SetVfHardwareAddr {
            pf: pf.name.clone(),
            vf,
            mac: *mac,
        };
        self.mutate("set VF hardware address", call, |s, i| {
            let entry = s.links[i]
                .link
                .vfs
                .iter_mut()
                .find(|e| e.id == vf)
                .ok_or_else(|| Error::not_found("VF", vf.to_string()))?;
            entry.mac = *mac;
            Ok(())
        })
    }

    fn link_set_mtu(&self, link: &Link, mtu: u32) -> Result<()> {
        self.mutate("set MTU", Call::SetMtu(link.name.clone(), mtu), |s, i| {
            s.links[i].link.mtu = mtu;
            Ok(())
        })
    }

    fn link_set_ns(&self, link: &Link, ns: &NetNs) -> Result<()> {
        let target = ns.path().to_path_buf();
        self.mutate("move link to namespace", Call::SetNs(link.name.clone(), target.clone()), |s, i| {
            let name = s.links[i].link.name.clone();
            if s.links.iter().any(|l| l.link.name == name && l.ns == target) {
                return Err(Error::kernel("move link to namespace", name, "File exists"));
            }
            let moved = &mut s.links[i];
            moved.ns = target;
            moved.link.master_index = None;
            moved.link.slave_kind = None;
            moved.vlans.clear();
            Ok(())
        })
    }

    fn link_set_master(&self, link: &Link, master: &Link) -> Result<()> {
        let call = Call::SetMaster {
            link: link.name.clone(),
            master: master.name.clone(),
        };
        let master_name = master.name.clone();
        self.mutate("set master", call, |s, i| {
            if s.links[i].link.master_index.is_some() {
                return Err(Error::kernel("set master", s.links[i].link.name.clone(), "device is already enslaved"));
            }
            let master = s
                .links
                .iter()
                .find(|l| l.link.name == master_name && l.ns == s.active_ns)
                .map(|l| l.link.clone())
                .ok_or_else(|| Error::not_found("link", master_name.clone()))?;
            Self::attach(&mut s.links[i], &master);
            Ok(())
        })
    }

    fn link_set_no_master(&self, link: &Link) -> Result<()> {
        self.mutate("clear master", Call::SetNoMaster(link.name.clone()), |s, i| {
            let port = &mut s.links[i];
            port.link.master_index = None;
            port.link.slave_kind = None;
            port.vlans.clear();
            Ok(())
        })
    }

    fn bridge_vlan_add(&self, link: &Link, vid: u16, flags: VlanFlags) -> Result<()> {
        let call = Call::VlanAdd {
            link: link.name.clone(),
            vid,
            flags,
        };
        self.mutate("add bridge VLAN", call, |s, i| {
            let port = &mut s.links[i];
            if port.link.slave_kind.as_deref() != Some(LINK_KIND_BRIDGE) && !port.link.is_bridge() {
                return Err(Error::kernel("add bridge VLAN", port.link.name.clone(), "not a bridge port"));
            }
            let existing = port.vlans.iter().position(|v| v.vid == vid);
            if existing.is_some() && !port.shared {
                return Err(Error::kernel("add bridge VLAN", port.link.name.clone(), format!("VLAN {vid} already exists")));
            }
            if flags.pvid {
                port.vlans.iter_mut().for_each(|v| v.pvid = false);
            }
            let entry = BridgeVlanInfo {
                vid,
                pvid: flags.pvid,
                untagged: flags.untagged,
            };
            match existing {
                Some(pos) => port.vlans[pos] = entry,
                None => port.vlans.push(entry),
            }
            Ok(())
        })
    }

    fn bridge_vlan_del(&self, link: &Link, vid: u16, flags: VlanFlags) -> Result<()> {
        let call = Call::VlanDel {
            link: link.name.clone(),
            vid,
            flags,
        };
        self.mutate("delete bridge VLAN", call, |s, i| {
            let port = &mut s.links[i];
            let pos = port
                .vlans
                .iter()
                .position(|v| v.vid == vid)
                .ok_or_else(|| Error::not_found("bridge VLAN", format!("{vid} on {}", port.link.name)))?;
            port.vlans.remove(pos);
            Ok(())
        })
    }

    fn bridge_vlan_list(&self) -> Result<HashMap<u32, Vec<BridgeVlanInfo>>> {
        let state = self.state.borrow();
        Ok(state
            .links
            .iter()
            .filter(|l| l.ns == state.active_ns && !l.vlans.is_empty())
            .map(|l| (l.link.index, l.vlans.clone()))
            .collect())
    }

    fn bridge_members(&self, bridge: &str) -> Result<Vec<String>> {
        let bridge = self.link_by_name(bridge)?;
        let state = self.state.borrow();
        Ok(state
            .links
            .iter()
            .filter(|l| l.ns == state.active_ns && l.link.master_index == Some(bridge.index))
            .map(|l| l.link.name.clone())
            .collect())
    }
}

impl NetNsOps for FakeNetlink {
    fn current_ns(&self) -> Result<NetNs> {
        let active = self.active_ns();
        NetNs::open(active)
    }

    fn switch_ns(&self, ns: &NetNs) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_ns_switch {
            return Err(Error::NamespaceSwitch {
                path: ns.path().display().to_string(),
                reason: "injected failure".to_string(),
            });
        }
        state.active_ns = ns.path().to_path_buf();
        Ok(())
    }
}
