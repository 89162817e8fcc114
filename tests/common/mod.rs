#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};

use accelerated_bridge::config::{NetConf, PluginConf};
use accelerated_bridge::manager::Manager;
use accelerated_bridge::netlink::fake::FakeNetlink;
use accelerated_bridge::netlink::{Link, NetNs, VfInfo, VlanFlags};
use accelerated_bridge::sriov::StaticRepresentors;
use accelerated_bridge::types::MacAddr;
use tempfile::TempDir;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const PF: &str = "ens1f0";
pub const VF_ID: u32 = 2;
pub const VF_NETDEV: &str = "ens1f0v2";
pub const REP: &str = "pf0vf2";
pub const BRIDGE: &str = "br0";

pub const VF_MAC: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0x02]);
pub const ADMIN_MAC: MacAddr = MacAddr::new([0x0a, 0, 0, 0, 0, 0x02]);

pub const PVID: VlanFlags = VlanFlags {
    pvid: true,
    untagged: true,
    self_: false,
    master: true,
};

pub const TAGGED: VlanFlags = VlanFlags {
    pvid: false,
    untagged: false,
    self_: false,
    master: true,
};

/// Host and container namespaces backed by plain files in a temp dir.
pub struct Namespaces {
    pub dir: TempDir,
    pub host: PathBuf,
    pub pod: PathBuf,
}

impl Namespaces {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let host = dir.path().join("host");
        let pod = dir.path().join("pod");
        File::create(&host)?;
        File::create(&pod)?;
        Ok(Self { dir, host, pod })
    }

    pub fn pod_ns(&self) -> Result<NetNs, Box<dyn std::error::Error>> {
        Ok(NetNs::open(&self.pod)?)
    }
}

/// PF `ens1f0` with VF 2 (`ens1f0v2`), representor `pf0vf2` and bridge `br0`.
///
/// With `bonded` the PF is a slave of `bond0`, which sits in the bridge;
/// otherwise the PF is a bridge port itself. Either way the uplink port is
/// shared, so several representors can add the same VLAN to it.
pub fn switchdev_host(host_ns: &Path, bonded: bool) -> FakeNetlink {
    let nlink = FakeNetlink::new(host_ns);

    let mut pf = Link::new(0, PF);
    pf.mac = Some(MacAddr::new([0x0c, 0x42, 0xa1, 0, 0, 0x01]));
    pf.vfs = vec![
        VfInfo {
            id: 0,
            mac: MacAddr::default(),
        },
        VfInfo {
            id: VF_ID,
            mac: ADMIN_MAC,
        },
    ];
    nlink.add_link(pf);

    let mut vf = Link::new(0, VF_NETDEV);
    vf.mac = Some(VF_MAC);
    nlink.add_link(vf);

    nlink.add_device(REP);
    nlink.add_bridge(BRIDGE);

    if bonded {
        nlink.add_bond("bond0");
        nlink.enslave(PF, "bond0");
        nlink.enslave("bond0", BRIDGE);
        nlink.share_port("bond0");
    } else {
        nlink.enslave(PF, BRIDGE);
        nlink.share_port(PF);
    }

    nlink
}

pub fn manager(nlink: FakeNetlink) -> Manager<FakeNetlink, StaticRepresentors> {
    let reps = StaticRepresentors::new()
        .with(PF, VF_ID, REP)
        .with(PF, 1, "pf0vf1");
    Manager::with_providers(nlink, reps)
}

/// Network configuration for VF 2 of `ens1f0`, extended with `extra` JSON fields.
pub fn net_conf_json(extra: &str) -> String {
    let sep = if extra.is_empty() { "" } else { "," };
    format!(
        r#"{{"cniVersion":"1.0.0","name":"accel","type":"accelerated-bridge","bridge":"br0","deviceID":"0000:03:00.2"{sep}{extra}}}"#
    )
}

pub fn plugin_conf(extra: &str) -> Result<PluginConf, Box<dyn std::error::Error>> {
    let net = NetConf::parse(net_conf_json(extra).as_bytes())?;
    Ok(PluginConf::from_net_conf(net, PF.to_string(), VF_ID, VF_NETDEV.to_string())?)
}
