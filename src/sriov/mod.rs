//! SR-IOV device discovery through sysfs.
//!
//! Representors of a switchdev-mode NIC share the PF's `phys_switch_id` and
//! name themselves through `phys_port_name` as `pf<N>vf<M>` (optionally with a
//! `c<K>` controller prefix), or plain `<M>` on older drivers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Representor-naming collaborator of the representor manager.
pub trait SriovProvider {
    /// Name of the representor netdevice of VF `vf` on physical function `pf`.
    fn vf_representor(&self, pf: &str, vf: u32) -> Result<String>;
}

/// Sysfs-backed SR-IOV discovery.
#[derive(Debug, Clone)]
pub struct SysfsSriov {
    root: PathBuf,
}

impl Default for SysfsSriov {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsSriov {
    /// Discovery rooted at `root` instead of `/sys`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn net_dir(&self) -> PathBuf {
        self.root.join("class/net")
    }

    fn pci_device(&self, pci_addr: &str) -> PathBuf {
        self.root.join("bus/pci/devices").join(pci_addr)
    }

    /// Name of the PF netdevice owning the VF at `pci_addr`.
    pub fn pf_name(&self, pci_addr: &str) -> Result<String> {
        first_entry(&self.pci_device(pci_addr).join("physfn/net"))
            .map_err(|_| Error::not_found("PF netdevice of VF", pci_addr))
    }

    /// Index of the VF at `pci_addr` within its PF.
    pub fn vf_id(&self, pci_addr: &str) -> Result<u32> {
        let physfn = self.pci_device(pci_addr).join("physfn");
        for entry in fs::read_dir(&physfn)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_prefix("virtfn")) else {
                continue;
            };
            let target = fs::read_link(entry.path())?;
            if target.file_name().and_then(|n| n.to_str()) == Some(pci_addr) {
                return id
                    .parse()
                    .map_err(|e| Error::malformed("virtfn link", name.to_string_lossy(), e));
            }
        }
        Err(Error::not_found("VF index of", pci_addr))
    }

    /// Host netdevice name of the VF at `pci_addr`.
    pub fn vf_netdev_name(&self, pci_addr: &str) -> Result<String> {
        first_entry(&self.pci_device(pci_addr).join("net"))
            .map_err(|_| Error::not_found("netdevice of VF", pci_addr))
    }

    fn read_attr(&self, dev: &str, attr: &str) -> Option<String> {
        fs::read_to_string(self.net_dir().join(dev).join(attr))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl SriovProvider for SysfsSriov {
    fn vf_representor(&self, pf: &str, vf: u32) -> Result<String> {
        let switch_id = self
            .read_attr(pf, "phys_switch_id")
            .ok_or_else(|| Error::not_found("switch id of PF", pf))?;
        let pf_index = self
            .read_attr(pf, "phys_port_name")
            .and_then(|name| name.strip_prefix('p').and_then(|n| n.parse::<u32>().ok()));

        for entry in fs::read_dir(self.net_dir())? {
            let dev = entry?.file_name().to_string_lossy().into_owned();
            if dev == pf || self.read_attr(&dev, "phys_switch_id").as_deref() != Some(switch_id.as_str()) {
                continue;
            }
            let Some(port_name) = self.read_attr(&dev, "phys_port_name") else {
                continue;
            };
            if let Some((rep_pf, rep_vf)) = parse_port_name(&port_name) {
                let same_pf = match (rep_pf, pf_index) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                };
                if rep_vf == vf && same_pf {
                    debug!("representor of {} VF {} is {}", pf, vf, dev);
                    return Ok(dev);
                }
            }
        }

        Err(Error::not_found("representor", format!("{pf} VF {vf}")))
    }
}

/// Fixed representor names, for tests and tooling that already know them.
#[derive(Debug, Clone, Default)]
pub struct StaticRepresentors {
    names: HashMap<(String, u32), String>,
}

impl StaticRepresentors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pf: &str, vf: u32, representor: &str) -> Self {
        self.names.insert((pf.to_string(), vf), representor.to_string());
        self
    }
}

impl SriovProvider for StaticRepresentors {
    fn vf_representor(&self, pf: &str, vf: u32) -> Result<String> {
        self.names
            .get(&(pf.to_string(), vf))
            .cloned()
            .ok_or_else(|| Error::not_found("representor", format!("{pf} VF {vf}")))
    }
}

/// Parses a representor `phys_port_name` into `(pf index, vf index)`.
fn parse_port_name(name: &str) -> Option<(Option<u32>, u32)> {
    if let Ok(vf) = name.parse::<u32>() {
        return Some((None, vf));
    }

    // Drop a controller prefix such as "c1".
    let name = match name.strip_prefix('c') {
        Some(rest) => rest.trim_start_matches(|c: char| c.is_ascii_digit()),
        None => name,
    };
    let rest = name.strip_prefix("pf")?;
    let (pf, vf) = rest.split_once("vf")?;
    Some((Some(pf.parse().ok()?), vf.parse().ok()?))
}

fn first_entry(dir: &Path) -> std::io::Result<String> {
    let mut names = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    names
        .into_iter()
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "empty directory"))
}
