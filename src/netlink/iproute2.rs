//! [`Netlink`] implementation driving the kernel through iproute2.
//!
//! Reads use the JSON output of `ip -j -d link show` and `bridge -j vlan show`.
//! Every command runs as a child of the calling thread, so it acts on whatever
//! network namespace that thread is currently in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use tracing::debug;

use super::{BridgeVlanInfo, Link, NetNs, Netlink, VfInfo, VlanFlags};
use crate::error::{Error, Result};
use crate::types::MacAddr;

/// Link capability backed by the `ip` and `bridge` binaries.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    ip: PathBuf,
    bridge: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            ip: PathBuf::from("ip"),
            bridge: PathBuf::from("bridge"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IpLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    address: Option<String>,
    master: Option<String>,
    linkinfo: Option<IpLinkInfo>,
    #[serde(default)]
    vfinfo_list: Vec<IpVfInfo>,
}

#[derive(Debug, Deserialize)]
struct IpLinkInfo {
    info_kind: Option<String>,
    info_slave_kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpVfInfo {
    vf: u32,
    #[serde(alias = "mac")]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BridgePort {
    ifname: String,
    #[serde(default)]
    vlans: Vec<BridgeVlan>,
}

#[derive(Debug, Deserialize)]
struct BridgeVlan {
    vlan: u16,
    #[serde(rename = "vlanEnd")]
    vlan_end: Option<u16>,
    #[serde(default)]
    flags: Vec<String>,
}

impl IpRoute2 {
    fn run(&self, tool: &Path, args: &[&str], op: &'static str, dev: &str) -> Result<Vec<u8>> {
        debug!("{} {}", tool.display(), args.join(" "));
        let output = Command::new(tool)
            .args(args)
            .output()
            .map_err(|e| Error::kernel(op, dev, format!("failed to execute {}: {}", tool.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("does not exist") || stderr.contains("Cannot find device") {
                return Err(Error::not_found("link", dev));
            }
            return Err(Error::kernel(op, dev, stderr));
        }

        Ok(output.stdout)
    }

    fn ip(&self, args: &[&str], op: &'static str, dev: &str) -> Result<Vec<u8>> {
        self.run(&self.ip, args, op, dev)
    }

    fn set(&self, link: &Link, op: &'static str, args: &[&str]) -> Result<()> {
        let mut full = vec!["link", "set", "dev", link.name.as_str()];
        full.extend_from_slice(args);
        self.ip(&full, op, &link.name).map(|_| ())
    }

    fn dump_links(&self) -> Result<Vec<IpLink>> {
        let out = self.ip(&["-j", "-d", "link", "show"], "link dump", "all")?;
        serde_json::from_slice(&out).map_err(|e| Error::kernel("link dump", "all", e))
    }

    /// Converts raw JSON links into handles, resolving master names to indexes.
    fn to_links(raw: Vec<IpLink>) -> Vec<Link> {
        let index_of: HashMap<String, u32> = raw.iter().map(|l| (l.ifname.clone(), l.ifindex)).collect();
        raw.into_iter()
            .map(|l| {
                let (kind, slave_kind) = match l.linkinfo {
                    Some(info) => (info.info_kind, info.info_slave_kind),
                    None => (None, None),
                };
                Link {
                    index: l.ifindex,
                    master_index: l.master.as_ref().and_then(|m| index_of.get(m).copied()),
                    mac: l.address.as_deref().and_then(|a| a.parse().ok()),
                    mtu: l.mtu,
                    up: l.flags.iter().any(|f| f == "UP"),
                    kind,
                    slave_kind,
                    vfs: l
                        .vfinfo_list
                        .into_iter()
                        .map(|vf| VfInfo {
                            id: vf.vf,
                            mac: vf.address.as_deref().and_then(|a| a.parse().ok()).unwrap_or_default(),
                        })
                        .collect(),
                    name: l.ifname,
                }
            })
            .collect()
    }

    fn vlan_args<'a>(verb: &'a str, link: &'a Link, vid: &'a str, flags: VlanFlags) -> Vec<&'a str> {
        let mut args = vec!["vlan", verb, "dev", link.name.as_str(), "vid", vid];
        if flags.pvid {
            args.push("pvid");
        }
        if flags.untagged {
            args.push("untagged");
        }
        if flags.self_ {
            args.push("self");
        }
        if flags.master {
            args.push("master");
        }
        args
    }
}

impl Netlink for IpRoute2 {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        // A full dump is needed to turn the master's name into an index.
        Self::to_links(self.dump_links()?)
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| Error::not_found("link", name))
    }

    fn link_by_index(&self, index: u32) -> Result<Link> {
        Self::to_links(self.dump_links()?)
            .into_iter()
            .find(|l| l.index == index)
            .ok_or_else(|| Error::not_found("link index", index.to_string()))
    }

    fn link_set_up(&self, link: &Link) -> Result<()> {
        self.set(link, "set link up", &["up"])
    }

    fn link_set_down(&self, link: &Link) -> Result<()> {
        self.set(link, "set link down", &["down"])
    }

    fn link_set_name(&self, link: &mut Link, name: &str) -> Result<()> {
        self.set(link, "rename link", &["name", name])?;
        link.name = name.to_string();
        Ok(())
    }

    fn link_set_hardware_addr(&self, link: &Link, mac: &MacAddr) -> Result<()> {
        self.set(link, "set hardware address", &["address", &mac.to_string()])
    }

    fn link_set_vf_hardware_addr(&self, pf: &Link, vf: u32, mac: &MacAddr) -> Result<()> {
        self.set(pf, "set VF hardware address", &["vf", &vf.to_string(), "mac", &mac.to_string()])
    }

    fn link_set_mtu(&self, link: &Link, mtu: u32) -> Result<()> {
        self.set(link, "set MTU", &["mtu", &mtu.to_string()])
    }

    fn link_set_ns(&self, link: &Link, ns: &NetNs) -> Result<()> {
        let target = ns.fd_path();
        self.set(link, "move link to namespace", &["netns", &target.to_string_lossy()])
    }

    fn link_set_master(&self, link: &Link, master: &Link) -> Result<()> {
        self.set(link, "set master", &["master", &master.name])
    }

    fn link_set_no_master(&self, link: &Link) -> Result<()> {
        self.set(link, "clear master", &["nomaster"])
    }

    fn bridge_vlan_add(&self, link: &Link, vid: u16, flags: VlanFlags) -> Result<()> {
        let vid = vid.to_string();
        let args = Self::vlan_args("add", link, &vid, flags);
        self.run(&self.bridge, &args, "add bridge VLAN", &link.name).map(|_| ())
    }

    fn bridge_vlan_del(&self, link: &Link, vid: u16, flags: VlanFlags) -> Result<()> {
        let vid = vid.to_string();
        let args = Self::vlan_args("del", link, &vid, flags);
        self.run(&self.bridge, &args, "delete bridge VLAN", &link.name).map(|_| ())
    }

    fn bridge_vlan_list(&self) -> Result<HashMap<u32, Vec<BridgeVlanInfo>>> {
        let out = self.run(&self.bridge, &["-j", "vlan", "show"], "list bridge VLANs", "all")?;
        let ports: Vec<BridgePort> =
            serde_json::from_slice(&out).map_err(|e| Error::kernel("list bridge VLANs", "all", e))?;
        let index_of: HashMap<String, u32> = self
            .dump_links()?
            .into_iter()
            .map(|l| (l.ifname, l.ifindex))
            .collect();

        let mut table = HashMap::new();
        for port in ports {
            let Some(&index) = index_of.get(&port.ifname) else {
                continue;
            };
            let entries: &mut Vec<BridgeVlanInfo> = table.entry(index).or_default();
            for vlan in port.vlans {
                let pvid = vlan.flags.iter().any(|f| f == "PVID");
                let untagged = vlan.flags.iter().any(|f| f == "Egress Untagged");
                for vid in vlan.vlan..=vlan.vlan_end.unwrap_or(vlan.vlan) {
                    entries.push(BridgeVlanInfo { vid, pvid, untagged });
                }
            }
        }
        Ok(table)
    }

    fn bridge_members(&self, bridge: &str) -> Result<Vec<String>> {
        let out = self.ip(&["-j", "link", "show", "master", bridge], "list bridge members", bridge)?;
        let links: Vec<IpLink> =
            serde_json::from_slice(&out).map_err(|e| Error::kernel("list bridge members", bridge, e))?;
        Ok(links.into_iter().map(|l| l.ifname).collect())
    }
}
