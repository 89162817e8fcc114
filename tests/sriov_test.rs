use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use accelerated_bridge::sriov::{SriovProvider, SysfsSriov};
use accelerated_bridge::ErrorKind;

const PF_PCI: &str = "0000:03:00.0";
const VF_PCI: &str = "0000:03:00.2";

fn write_attr(root: &Path, dev: &str, attr: &str, value: &str) -> std::io::Result<()> {
    let dir = root.join("class/net").join(dev);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(attr), format!("{}\n", value))
}

/// A switchdev NIC: PF `ens1f0` with VFs 0 and 2, their representors, and an
/// unrelated NIC whose port names collide.
fn sysfs_tree(root: &Path) -> std::io::Result<()> {
    let devices = root.join("bus/pci/devices");
    fs::create_dir_all(devices.join(PF_PCI).join("net/ens1f0"))?;
    fs::create_dir_all(devices.join(VF_PCI).join("net/ens1f0v2"))?;
    fs::create_dir_all(devices.join("0000:03:00.1"))?;
    symlink(format!("../{}", PF_PCI), devices.join(VF_PCI).join("physfn"))?;
    symlink("../0000:03:00.1", devices.join(PF_PCI).join("virtfn0"))?;
    symlink(format!("../{}", VF_PCI), devices.join(PF_PCI).join("virtfn2"))?;

    write_attr(root, "ens1f0", "phys_switch_id", "b8599f0a")?;
    write_attr(root, "ens1f0", "phys_port_name", "p0")?;
    write_attr(root, "pf0vf0", "phys_switch_id", "b8599f0a")?;
    write_attr(root, "pf0vf0", "phys_port_name", "pf0vf0")?;
    write_attr(root, "pf0vf2", "phys_switch_id", "b8599f0a")?;
    write_attr(root, "pf0vf2", "phys_port_name", "pf0vf2")?;
    write_attr(root, "eth5", "phys_switch_id", "ffff0000")?;
    write_attr(root, "eth5", "phys_port_name", "pf0vf3")?;
    Ok(())
}

#[test]
fn test_vf_discovery_from_pci_address() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    sysfs_tree(dir.path())?;
    let sriov = SysfsSriov::new(dir.path());

    assert_eq!(sriov.pf_name(VF_PCI)?, "ens1f0");
    assert_eq!(sriov.vf_id(VF_PCI)?, 2);
    assert_eq!(sriov.vf_netdev_name(VF_PCI)?, "ens1f0v2");

    let err = sriov.pf_name("0000:09:00.0").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    Ok(())
}

#[test]
fn test_representor_matches_switch_and_port() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    sysfs_tree(dir.path())?;
    let sriov = SysfsSriov::new(dir.path());

    assert_eq!(sriov.vf_representor("ens1f0", 2)?, "pf0vf2");
    assert_eq!(sriov.vf_representor("ens1f0", 0)?, "pf0vf0");

    // pf0vf3 exists, but on another switch
    let err = sriov.vf_representor("ens1f0", 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    Ok(())
}

#[test]
fn test_legacy_port_names() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    write_attr(dir.path(), "ens2f0", "phys_switch_id", "0a0b")?;
    write_attr(dir.path(), "ens2f0_1", "phys_switch_id", "0a0b")?;
    write_attr(dir.path(), "ens2f0_1", "phys_port_name", "1")?;
    let sriov = SysfsSriov::new(dir.path());

    assert_eq!(sriov.vf_representor("ens2f0", 1)?, "ens2f0_1");

    Ok(())
}
