use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::sriov::SysfsSriov;
use crate::types::MacAddr;
use crate::vlan::{split_trunk, TrunkEntry, MAX_VLAN};

/// Bridge used when the configuration names none.
pub const DEFAULT_BRIDGE: &str = "cni0";

/// Runtime settings of the plugin binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding cached configurations between ADD and DEL
    pub state_dir: PathBuf,
    /// Root of the sysfs tree used for SR-IOV discovery
    pub sysfs_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/cni/accelerated-bridge"),
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl Settings {
    /// Defaults, overridden by `ACCEL_BRIDGE_STATE_DIR` and `ACCEL_BRIDGE_SYSFS_ROOT`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(dir) = env::var("ACCEL_BRIDGE_STATE_DIR") {
            settings.state_dir = PathBuf::from(dir);
        }
        if let Ok(root) = env::var("ACCEL_BRIDGE_SYSFS_ROOT") {
            settings.sysfs_root = PathBuf::from(root);
        }
        settings
    }

    /// Cache file for one container interface.
    pub fn cache_path(&self, container_id: &str, ifname: &str) -> PathBuf {
        self.state_dir.join(format!("{}-{}", container_id, ifname))
    }
}

/// Network configuration for the accelerated bridge CNI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// `cniVersion` the runtime expects results in
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Bridge to attach the representor to, or a comma separated list of candidates
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// PCI address of the VF
    #[serde(rename = "deviceID", default)]
    pub device_id: String,
    /// PVID VLAN of the representor port, 0 for none
    #[serde(default)]
    pub vlan: u16,
    /// Tagged VLANs of the representor port
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trunk: Vec<TrunkEntry>,
    /// MAC address to give the VF
    pub mac: Option<String>,
    /// MTU to give the VF and its representor
    pub mtu: Option<u32>,
    /// Also add the port VLANs to the PF uplink (or its bond)
    #[serde(rename = "setUplinkVlan", default)]
    pub set_uplink_vlan: bool,
    /// IPAM configuration
    pub ipam: Option<IPAMConfig>,
}

/// IPAM (IP Address Management) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPAMConfig {
    /// Type of IPAM plugin
    #[serde(rename = "type")]
    pub ipam_type: String,
    /// Plugin specific settings, passed through untouched
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

fn default_bridge() -> String {
    DEFAULT_BRIDGE.to_string()
}

fn split_bridges(bridge: &str) -> Vec<String> {
    bridge
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(String::from)
        .collect()
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .context("Failed to parse network configuration")?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> Result<()> {
        if self.vlan > MAX_VLAN {
            anyhow::bail!("Invalid VLAN ID {} (must be between 0 and {})", self.vlan, MAX_VLAN);
        }

        split_trunk(&self.trunk).context("Invalid trunk configuration")?;

        if let Some(mac) = &self.mac {
            mac.parse::<MacAddr>()
                .with_context(|| format!("Invalid MAC address {}", mac))?;
        }

        if self.mtu == Some(0) {
            anyhow::bail!("Invalid MTU 0");
        }

        if self.device_id.is_empty() {
            anyhow::bail!("VF PCI address (deviceID) is required");
        }

        if self.bridges().is_empty() {
            anyhow::bail!("Bridge name is required");
        }

        Ok(())
    }

    /// Candidate bridges, in configuration order
    pub fn bridges(&self) -> Vec<String> {
        split_bridges(&self.bridge)
    }
}

/// State of the VF captured before the plugin changed it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrigVfState {
    /// VF netdevice name in the host namespace
    #[serde(rename = "HostIFName")]
    pub host_if_name: String,
    /// MAC of the VF netdevice before the override
    #[serde(rename = "EffectiveMAC", default, skip_serializing_if = "Option::is_none")]
    pub effective_mac: Option<MacAddr>,
    /// MAC of the VF in the PF's VF table
    #[serde(rename = "AdminMAC", default, skip_serializing_if = "Option::is_none")]
    pub admin_mac: Option<MacAddr>,
    /// MTU of the VF netdevice before the override
    #[serde(rename = "MTU", default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

/// State of the representor captured before the plugin changed it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrigRepState {
    #[serde(rename = "MTU", default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

/// Resolved plugin configuration, including what is needed to undo an attach
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConf {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    /// Candidate bridges as configured
    pub bridge: String,
    /// Bridge the representor is actually attached to
    #[serde(rename = "actualBridge")]
    pub actual_bridge: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "pfName")]
    pub pf_name: String,
    #[serde(rename = "vfID")]
    pub vf_id: u32,
    pub mac: Option<String>,
    pub mtu: Option<u32>,
    /// PVID VLAN, 0 for none
    pub vlan: u16,
    /// Expanded trunk VLAN set
    pub trunk: Vec<u16>,
    #[serde(rename = "setUplinkVlan")]
    pub set_uplink_vlan: bool,
    pub ipam: Option<IPAMConfig>,
    #[serde(rename = "origVfState")]
    pub orig_vf_state: OrigVfState,
    #[serde(rename = "origRepState")]
    pub orig_rep_state: OrigRepState,
    /// Representor netdevice, set once attached
    pub representor: String,
    /// Interface name inside the container
    #[serde(rename = "contIFNames")]
    pub cont_if_names: String,
}

impl PluginConf {
    /// Parses and validates the network configuration, then discovers the VF
    /// behind its `deviceID`.
    pub fn load(bytes: &[u8], sriov: &SysfsSriov) -> Result<Self> {
        let net = NetConf::parse(bytes)?;
        let pf_name = sriov
            .pf_name(&net.device_id)
            .with_context(|| format!("Failed to get PF name for VF {}", net.device_id))?;
        let vf_id = sriov
            .vf_id(&net.device_id)
            .with_context(|| format!("Failed to get VF index for VF {}", net.device_id))?;
        let host_if_name = sriov
            .vf_netdev_name(&net.device_id)
            .with_context(|| format!("Failed to get netdevice of VF {}", net.device_id))?;
        Self::from_net_conf(net, pf_name, vf_id, host_if_name)
    }

    /// Builds the plugin configuration for an already discovered VF.
    pub fn from_net_conf(net: NetConf, pf_name: String, vf_id: u32, host_if_name: String) -> Result<Self> {
        let trunk = split_trunk(&net.trunk).context("Invalid trunk configuration")?;
        let bridges = net.bridges();
        let actual_bridge = bridges.first().cloned().unwrap_or_else(default_bridge);

        Ok(Self {
            cni_version: net.cni_version,
            name: net.name,
            bridge: net.bridge,
            actual_bridge,
            device_id: net.device_id,
            pf_name,
            vf_id,
            mac: net.mac,
            mtu: net.mtu,
            vlan: net.vlan,
            trunk,
            set_uplink_vlan: net.set_uplink_vlan,
            ipam: net.ipam,
            orig_vf_state: OrigVfState {
                host_if_name,
                ..Default::default()
            },
            orig_rep_state: OrigRepState::default(),
            representor: String::new(),
            cont_if_names: String::new(),
        })
    }

    /// Candidate bridges, in configuration order
    pub fn bridges(&self) -> Vec<String> {
        split_bridges(&self.bridge)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write cached configuration {}", path.display()))?;
        Ok(())
    }

    /// Load a cached configuration, `None` if it was never written
    pub fn load_cached(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read cached configuration {}", path.display()))
            }
        };
        let conf = serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse cached configuration {}", path.display()))?;
        Ok(Some(conf))
    }

    /// Remove a cached configuration, ignoring a missing file
    pub fn remove_cached(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("Failed to remove cached configuration {}", path.display()))
            }
            _ => Ok(()),
        }
    }
}
