mod common;

use accelerated_bridge::netlink::fake::Call;
use accelerated_bridge::netlink::Link;
use accelerated_bridge::types::MacAddr;
use accelerated_bridge::ErrorKind;
use common::*;

const POD_MAC: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

#[test]
fn test_setup_then_release_restores_vf() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let pod = ns.pod_ns()?;
    let mut conf = plugin_conf(r#""mac":"aa:bb:cc:dd:ee:ff","mtu":9000"#)?;

    let mac = mgr.setup_vf(&mut conf, "net1", "c1", &pod)?;
    assert_eq!(mac, Some(POD_MAC));

    let nlink = mgr.nlink();
    assert_eq!(
        nlink.calls(),
        vec![
            Call::SetDown(VF_NETDEV.to_string()),
            Call::SetName {
                from: VF_NETDEV.to_string(),
                to: "temp_2".to_string()
            },
            Call::SetHardwareAddr("temp_2".to_string(), POD_MAC),
            Call::SetMtu("temp_2".to_string(), 9000),
            Call::SetNs("temp_2".to_string(), ns.pod.clone()),
            Call::SetName {
                from: "temp_2".to_string(),
                to: "net1".to_string()
            },
            Call::SetUp("net1".to_string()),
        ]
    );
    assert_eq!(nlink.ns_of("net1"), Some(ns.pod.clone()));
    assert!(nlink.is_up("net1"));
    assert_eq!(nlink.active_ns(), ns.host);
    assert_eq!(conf.cont_if_names, "net1");
    assert_eq!(conf.orig_vf_state.effective_mac, Some(VF_MAC));
    assert_eq!(conf.orig_vf_state.mtu, Some(1500));

    mgr.release_vf(&conf, "net1", "c1", &pod)?;

    let vf = nlink.link(VF_NETDEV).ok_or("VF missing after release")?;
    assert_eq!(nlink.ns_of(VF_NETDEV), Some(ns.host.clone()));
    assert_eq!(vf.mac, Some(VF_MAC));
    assert_eq!(vf.mtu, 1500);
    assert!(!vf.up);
    assert!(nlink.link("net1").is_none());
    assert_eq!(nlink.active_ns(), ns.host);

    Ok(())
}

#[test]
fn test_setup_without_overrides_keeps_identity() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let pod = ns.pod_ns()?;
    let mut conf = plugin_conf("")?;

    let mac = mgr.setup_vf(&mut conf, "net1", "c1", &pod)?;

    assert_eq!(mac, Some(VF_MAC));
    assert_eq!(conf.orig_vf_state.effective_mac, None);
    assert_eq!(conf.orig_vf_state.mtu, None);
    assert!(!mgr
        .nlink()
        .calls()
        .iter()
        .any(|c| matches!(c, Call::SetHardwareAddr(..) | Call::SetMtu(..))));

    Ok(())
}

#[test]
fn test_setup_missing_vf_fails_without_changes() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let pod = ns.pod_ns()?;
    let mut conf = plugin_conf("")?;
    conf.orig_vf_state.host_if_name = "ens9f0v7".to_string();

    let err = mgr.setup_vf(&mut conf, "net1", "c1", &pod).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("error getting VF netdevice with name ens9f0v7"));
    assert!(mgr.nlink().calls().is_empty());
    assert!(conf.cont_if_names.is_empty());

    Ok(())
}

#[test]
fn test_setup_malformed_mac_stops_before_move() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let pod = ns.pod_ns()?;
    let mut conf = plugin_conf("")?;
    conf.mac = Some("aa:bb:cc:dd:ee".to_string());

    let err = mgr.setup_vf(&mut conf, "net1", "c1", &pod).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MalformedInput);
    let nlink = mgr.nlink();
    assert_eq!(nlink.calls().len(), 2);
    assert!(!nlink.calls().iter().any(|c| matches!(c, Call::SetNs(..))));
    assert_eq!(nlink.ns_of("temp_2"), Some(ns.host.clone()));
    assert_eq!(conf.orig_vf_state.effective_mac, None);

    Ok(())
}

#[test]
fn test_failure_inside_container_restores_namespace() -> TestResult {
    let ns = Namespaces::new()?;
    let nlink = switchdev_host(&ns.host, false);
    // Name already taken inside the container
    nlink.add_link_in(&ns.pod, Link::new(0, "net1"));
    let mgr = manager(nlink);
    let pod = ns.pod_ns()?;
    let mut conf = plugin_conf("")?;

    let err = mgr.setup_vf(&mut conf, "net1", "c1", &pod).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::KernelOperation);
    assert!(err.to_string().contains("error setting up interface in container namespace"));
    assert_eq!(mgr.nlink().active_ns(), ns.host);
    assert_eq!(mgr.nlink().ns_of("temp_2"), Some(ns.pod.clone()));
    assert!(conf.cont_if_names.is_empty());

    Ok(())
}

#[test]
fn test_namespace_switch_failure_is_reported() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let pod = ns.pod_ns()?;
    let mut conf = plugin_conf("")?;
    mgr.nlink().fail_ns_switch(true);

    let err = mgr.setup_vf(&mut conf, "net1", "c1", &pod).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NamespaceSwitch);
    assert_eq!(mgr.nlink().active_ns(), ns.host);

    Ok(())
}

#[test]
fn test_release_requires_container_name() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let pod = ns.pod_ns()?;
    let conf = plugin_conf("")?;

    let err = mgr.release_vf(&conf, "net1", "c1", &pod).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("mismatch"));
    assert!(mgr.nlink().calls().is_empty());

    Ok(())
}

#[test]
fn test_release_failure_restores_namespace() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let pod = ns.pod_ns()?;
    let mut conf = plugin_conf("")?;
    mgr.setup_vf(&mut conf, "net1", "c1", &pod)?;
    mgr.nlink().fail_when(|c| matches!(c, Call::SetNs(..)));

    assert!(mgr.release_vf(&conf, "net1", "c1", &pod).is_err());
    assert_eq!(mgr.nlink().active_ns(), ns.host);
    assert_eq!(mgr.nlink().ns_of(VF_NETDEV), Some(ns.pod.clone()));

    Ok(())
}

#[test]
fn test_apply_and_reset_vf_config() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let mut conf = plugin_conf(r#""mac":"aa:bb:cc:dd:ee:ff""#)?;

    mgr.apply_vf_config(&mut conf)?;

    let nlink = mgr.nlink();
    assert_eq!(conf.orig_vf_state.admin_mac, Some(ADMIN_MAC));
    let pf = nlink.link(PF).ok_or("PF missing")?;
    assert_eq!(pf.vf(VF_ID).map(|vf| vf.mac), Some(POD_MAC));

    // A repeated apply must not overwrite the recorded original
    mgr.apply_vf_config(&mut conf)?;
    assert_eq!(conf.orig_vf_state.admin_mac, Some(ADMIN_MAC));

    mgr.reset_vf_config(&conf)?;
    let pf = nlink.link(PF).ok_or("PF missing")?;
    assert_eq!(pf.vf(VF_ID).map(|vf| vf.mac), Some(ADMIN_MAC));
    assert_eq!(
        nlink.calls().last(),
        Some(&Call::SetVfHardwareAddr {
            pf: PF.to_string(),
            vf: VF_ID,
            mac: ADMIN_MAC
        })
    );

    Ok(())
}

#[test]
fn test_apply_without_mac_only_records() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let mut conf = plugin_conf("")?;

    mgr.apply_vf_config(&mut conf)?;
    mgr.reset_vf_config(&conf)?;

    assert_eq!(conf.orig_vf_state.admin_mac, Some(ADMIN_MAC));
    assert!(mgr.nlink().calls().is_empty());

    Ok(())
}

#[test]
fn test_apply_unknown_vf_is_not_found() -> TestResult {
    let ns = Namespaces::new()?;
    let mgr = manager(switchdev_host(&ns.host, false));
    let mut conf = plugin_conf("")?;
    conf.vf_id = 7;

    let err = mgr.apply_vf_config(&mut conf).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(conf.orig_vf_state.admin_mac, None);

    Ok(())
}
