mod common;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;

use accelerated_bridge::config::{PluginConf, Settings};
use accelerated_bridge::ipam::Ipam;
use accelerated_bridge::netlink::fake::{Call, FakeNetlink};
use accelerated_bridge::netlink::{with_netns, Netlink};
use accelerated_bridge::sriov::StaticRepresentors;
use accelerated_bridge::types::{CmdArgs, IPConfig, Result as CniResult};
use accelerated_bridge::AcceleratedBridgePlugin;
use common::*;

/// IPAM double handing out 10.0.0.5/24 and recording every call.
#[derive(Default)]
struct RecordingIpam {
    calls: RefCell<Vec<String>>,
}

impl Ipam for RecordingIpam {
    fn exec_add(&self, plugin: &str, _netconf: &[u8]) -> anyhow::Result<CniResult> {
        self.calls.borrow_mut().push(format!("ADD {}", plugin));
        let mut result = CniResult::new("1.0.0");
        result.add_ip(IPConfig {
            interface: None,
            address: "10.0.0.5/24".to_string(),
            gateway: Some("10.0.0.1".to_string()),
        });
        Ok(result)
    }

    fn exec_del(&self, plugin: &str, _netconf: &[u8]) -> anyhow::Result<()> {
        self.calls.borrow_mut().push(format!("DEL {}", plugin));
        Ok(())
    }

    fn configure_iface(&self, ifname: &str, result: &CniResult) -> anyhow::Result<()> {
        let count = result.ips.as_ref().map_or(0, Vec::len);
        self.calls.borrow_mut().push(format!("CONFIGURE {} {}", ifname, count));
        Ok(())
    }
}

type TestPlugin = AcceleratedBridgePlugin<FakeNetlink, StaticRepresentors, RecordingIpam>;

const IPAM: &str = r#""vlan":100,"ipam":{"type":"host-local","subnet":"10.0.0.0/24"}"#;

fn plugin(ns: &Namespaces, nlink: FakeNetlink) -> TestPlugin {
    let settings = Settings {
        state_dir: ns.dir.path().join("state"),
        ..Default::default()
    };
    let args = CmdArgs {
        container_id: "c1".to_string(),
        netns: ns.pod.display().to_string(),
        ifname: "net1".to_string(),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: net_conf_json(IPAM).into_bytes(),
    };
    AcceleratedBridgePlugin::with_parts(manager(nlink), RecordingIpam::default(), settings, args)
}

fn ipam_calls(plugin: &TestPlugin) -> Vec<String> {
    plugin.ipam().calls.borrow().clone()
}

#[test]
fn test_add_then_del_round_trip() -> TestResult {
    let ns = Namespaces::new()?;
    let plugin = plugin(&ns, switchdev_host(&ns.host, false));
    let cache = ns.dir.path().join("state").join("c1-net1");

    let result = plugin.add_network(plugin_conf(IPAM)?)?;

    let interfaces = result.interfaces.as_ref().ok_or("no interfaces in result")?;
    assert_eq!(interfaces[0].name, "net1");
    assert_eq!(interfaces[0].mac.as_deref(), Some("02:00:00:00:00:02"));
    assert_eq!(interfaces[0].sandbox.as_deref(), Some(ns.pod.to_str().ok_or("path")?));
    let ips = result.ips.as_ref().ok_or("no ips in result")?;
    assert_eq!(ips[0].address, "10.0.0.5/24");
    assert_eq!(ips[0].interface, Some(0));
    assert_eq!(ipam_calls(&plugin), vec!["ADD host-local", "CONFIGURE net1 1"]);

    let nlink = plugin.manager().nlink();
    assert_eq!(nlink.ns_of("net1"), Some(ns.pod.clone()));
    assert_eq!(nlink.port_vids(REP), vec![100]);
    assert_eq!(nlink.active_ns(), ns.host);

    let cached = PluginConf::load_cached(&cache)?.ok_or("cache not written")?;
    assert_eq!(cached.representor, REP);
    assert_eq!(cached.cont_if_names, "net1");
    assert_eq!(cached.actual_bridge, BRIDGE);

    plugin.check_network()?;

    plugin.del_network()?;

    assert_eq!(nlink.ns_of(VF_NETDEV), Some(ns.host.clone()));
    assert_eq!(nlink.link(REP).and_then(|l| l.master_index), None);
    assert_eq!(ipam_calls(&plugin).last().map(String::as_str), Some("DEL host-local"));
    assert!(!cache.exists());

    Ok(())
}

#[test]
fn test_del_without_cache_is_noop() -> TestResult {
    let ns = Namespaces::new()?;
    let plugin = plugin(&ns, switchdev_host(&ns.host, false));

    plugin.del_network()?;
    plugin.del_network()?;

    assert!(plugin.manager().nlink().calls().is_empty());
    assert!(ipam_calls(&plugin).is_empty());

    Ok(())
}

#[test]
fn test_del_with_namespace_gone_cleans_host_side() -> TestResult {
    let ns = Namespaces::new()?;
    let plugin = plugin(&ns, switchdev_host(&ns.host, false));
    plugin.add_network(plugin_conf(IPAM)?)?;
    fs::remove_file(&ns.pod)?;

    plugin.del_network()?;

    let nlink = plugin.manager().nlink();
    assert_eq!(nlink.link(REP).and_then(|l| l.master_index), None);
    assert!(!nlink
        .calls()
        .iter()
        .any(|c| matches!(c, Call::SetName { from, .. } if from == "net1")));
    assert!(!ns.dir.path().join("state").join("c1-net1").exists());

    Ok(())
}

#[test]
fn test_failed_attach_releases_vf() -> TestResult {
    let ns = Namespaces::new()?;
    let nlink = switchdev_host(&ns.host, false);
    nlink.fail_when(|c| matches!(c, Call::VlanAdd { vid: 100, .. }));
    let plugin = plugin(&ns, nlink);

    let err = plugin.add_network(plugin_conf(IPAM)?).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to attach representor"));

    let nlink = plugin.manager().nlink();
    assert_eq!(nlink.ns_of(VF_NETDEV), Some(ns.host.clone()));
    assert_eq!(nlink.link(REP).and_then(|l| l.master_index), None);
    assert_eq!(nlink.active_ns(), ns.host);
    assert!(ipam_calls(&plugin).is_empty());
    assert!(!ns.dir.path().join("state").join("c1-net1").exists());

    Ok(())
}

#[test]
fn test_bridge_selected_from_candidates() -> TestResult {
    let ns = Namespaces::new()?;
    let nlink = switchdev_host(&ns.host, false);
    nlink.add_bridge("br1");
    let plugin = plugin(&ns, nlink);

    let mut conf = plugin_conf(IPAM)?;
    conf.bridge = "br1, br0".to_string();
    plugin.add_network(conf)?;

    let nlink = plugin.manager().nlink();
    let bridge = nlink.link(BRIDGE).ok_or("bridge missing")?;
    assert_eq!(nlink.link(REP).and_then(|l| l.master_index), Some(bridge.index));

    Ok(())
}

#[test]
fn test_uplink_outside_candidates_is_rejected() -> TestResult {
    let ns = Namespaces::new()?;
    let nlink = switchdev_host(&ns.host, false);
    nlink.add_bridge("br1");
    nlink.add_bridge("br2");
    let plugin = plugin(&ns, nlink);

    let mut conf = plugin_conf(IPAM)?;
    conf.bridge = "br1,br2".to_string();
    let err = plugin.add_network(conf).unwrap_err();

    assert!(err.to_string().contains("not one of br1,br2"));
    assert!(plugin.manager().nlink().calls().is_empty());

    Ok(())
}

#[test]
fn test_check_fails_when_interface_down() -> TestResult {
    let ns = Namespaces::new()?;
    let plugin = plugin(&ns, switchdev_host(&ns.host, false));
    plugin.add_network(plugin_conf(IPAM)?)?;

    let nlink = plugin.manager().nlink();
    let pod = ns.pod_ns()?;
    with_netns(nlink, &pod, || {
        let link = nlink.link_by_name("net1")?;
        nlink.link_set_down(&link)
    })?;

    let err = plugin.check_network().unwrap_err();
    assert!(err.to_string().contains("is not UP"));

    Ok(())
}
