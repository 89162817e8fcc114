//! Representor attach/detach and uplink VLAN bookkeeping.

use std::collections::HashMap;

use tracing::{info, warn};

use super::Manager;
use crate::config::PluginConf;
use crate::error::{Error, Result, ResultExt};
use crate::netlink::{BridgeVlanInfo, Link, NetNsOps, Netlink};
use crate::sriov::SriovProvider;
use crate::uplink::get_pf_uplink_or_bond;
use crate::vlan::{
    bridge_pvid_vlan_add, bridge_pvid_vlan_del, bridge_trunk_vlan_add, bridge_trunk_vlan_del, display_vlans,
    needs_default_vlan_removal, uplink_vlans, DEFAULT_VLAN,
};

impl<L, S> Manager<L, S>
where
    L: Netlink + NetNsOps,
    S: SriovProvider,
{
    /// Enslaves the VF's representor to `conf.actual_bridge` and applies the
    /// port VLAN policy, optionally mirroring it on the PF uplink.
    ///
    /// If the VLAN policy fails the representor is taken off the bridge again.
    pub fn attach_representor(&self, conf: &mut PluginConf) -> Result<()> {
        let bridge = self
            .nlink
            .link_by_name(&conf.actual_bridge)
            .wrap_err(|| format!("failed to get bridge link {}", conf.actual_bridge))?;

        conf.representor = self
            .sriov
            .vf_representor(&conf.pf_name, conf.vf_id)
            .wrap_err(|| format!("failed to get VF's {} representor on NIC {}", conf.vf_id, conf.pf_name))?;

        let rep = self
            .nlink
            .link_by_name(&conf.representor)
            .wrap_err(|| format!("failed to get representor link {}", conf.representor))?;

        if let Some(mtu) = conf.mtu {
            conf.orig_rep_state.mtu.get_or_insert(rep.mtu);
            self.nlink
                .link_set_mtu(&rep, mtu)
                .wrap_err(|| format!("failed to set MTU on representor {}", rep.name))?;
            info!("Representor {} MTU set to {}", rep.name, mtu);
        }

        self.nlink
            .link_set_up(&rep)
            .wrap_err(|| format!("failed to set representor {} up", rep.name))?;

        info!("Attaching rep {} to the bridge {}", rep.name, bridge.name);
        self.nlink
            .link_set_master(&rep, &bridge)
            .wrap_err(|| format!("failed to add representor {} to bridge {}", rep.name, bridge.name))?;

        if let Err(err) = self.configure_port_vlans(conf, &rep) {
            if let Err(detach_err) = self.nlink.link_set_no_master(&rep) {
                warn!(
                    "failed to remove representor {} from bridge {} after error: {}",
                    rep.name, bridge.name, detach_err
                );
            }
            return Err(err);
        }

        Ok(())
    }

    /// Takes the representor off its bridge, restoring its MTU and reclaiming
    /// uplink VLANs no other port still needs.
    ///
    /// A failure to reclaim uplink VLANs is logged and does not stop the detach.
    pub fn detach_representor(&self, conf: &PluginConf) -> Result<()> {
        let rep = self
            .nlink
            .link_by_name(&conf.representor)
            .wrap_err(|| format!("failed to get representor link {}", conf.representor))?;

        self.nlink
            .link_set_down(&rep)
            .wrap_err(|| format!("failed to set representor {} down", rep.name))?;

        if conf.mtu.is_some() {
            let orig = conf
                .orig_rep_state
                .mtu
                .ok_or_else(|| Error::not_found("original MTU of representor", rep.name.clone()))?;
            self.nlink
                .link_set_mtu(&rep, orig)
                .wrap_err(|| format!("failed to restore MTU on representor {}", rep.name))?;
            info!("Representor {} MTU set to {}", rep.name, orig);
        }

        if conf.set_uplink_vlan {
            if let Err(err) = self.delete_uplink_vlans(conf, &rep) {
                warn!("Failed to delete trunk VLANs from parent uplink: {}", err);
            }
        }

        info!("Detaching rep {} from the bridge", rep.name);
        self.nlink
            .link_set_no_master(&rep)
            .wrap_err(|| format!("failed to remove representor {} from bridge", rep.name))
    }

    fn configure_port_vlans(&self, conf: &PluginConf, rep: &Link) -> Result<()> {
        if needs_default_vlan_removal(conf.vlan, &conf.trunk) {
            bridge_pvid_vlan_del(&self.nlink, rep, DEFAULT_VLAN)
                .wrap_err(|| format!("failed to remove default VLAN({DEFAULT_VLAN}) for representor {}", rep.name))?;
        }

        if !conf.trunk.is_empty() {
            bridge_trunk_vlan_add(&self.nlink, rep, &conf.trunk)
                .wrap_err(|| format!("failed to set trunk VLANs on representor {}", rep.name))?;
            info!("Setting multiple VLANs for rep {}: {}", rep.name, display_vlans(&conf.trunk));
        }

        if conf.vlan > 0 {
            bridge_pvid_vlan_add(&self.nlink, rep, conf.vlan)
                .wrap_err(|| format!("failed to set VLAN {} on representor {}", conf.vlan, rep.name))?;
            info!("Setting PVID VLAN {} for rep {}", conf.vlan, rep.name);
        }

        if conf.set_uplink_vlan {
            self.add_uplink_vlans(conf).wrap_err(|| "failed to add VLANs to parent uplink")?;
        }

        Ok(())
    }

    fn add_uplink_vlans(&self, conf: &PluginConf) -> Result<()> {
        let uplink = get_pf_uplink_or_bond(&self.nlink, &conf.pf_name).wrap_err(|| {
            format!(
                "failed to lookup PF for VF-Representor - PFName:{} VF:{}",
                conf.pf_name, conf.vf_id
            )
        })?;

        let vlans = uplink_vlans(conf.vlan, &conf.trunk);
        bridge_trunk_vlan_add(&self.nlink, &uplink, &vlans)
            .wrap_err(|| format!("failed to add VLANs to uplink {}", uplink.name))?;
        info!("Adding VLANs for uplink {}: {}", uplink.name, display_vlans(&vlans));
        Ok(())
    }

    /// Removes from the uplink every VLAN of this port's policy that no other
    /// bridge member carries. Returns the VLANs removed.
    fn delete_uplink_vlans(&self, conf: &PluginConf, rep: &Link) -> Result<Vec<u16>> {
        let uplink = get_pf_uplink_or_bond(&self.nlink, &conf.pf_name).wrap_err(|| {
            format!(
                "failed to lookup PF for VF-Representor - PFName:{} VF:{}",
                conf.pf_name, conf.vf_id
            )
        })?;

        let bridge_index = uplink
            .master_index
            .ok_or_else(|| Error::not_found("bridge master of uplink", uplink.name.clone()))?;
        let bridge = self
            .nlink
            .link_by_index(bridge_index)
            .wrap_err(|| format!("failed to get bridge of uplink {}", uplink.name))?;

        let names = self
            .nlink
            .bridge_members(&bridge.name)
            .wrap_err(|| format!("failed to list members of bridge {}", bridge.name))?;

        let mut members = Vec::with_capacity(names.len());
        for name in names {
            match self.nlink.link_by_name(&name) {
                Ok(link) if link.index != rep.index && link.index != uplink.index => members.push(link.index),
                Ok(_) => {}
                // Ports can leave the bridge while we look.
                Err(err) => warn!("failed to get bridge member {}: {}", name, err),
            }
        }

        let table = self
            .nlink
            .bridge_vlan_list()
            .wrap_err(|| "failed to list bridge VLANs")?;

        let candidates = uplink_vlans(conf.vlan, &conf.trunk);
        let orphaned = orphaned_vlans(&candidates, &members, &table);
        if orphaned.is_empty() {
            return Ok(orphaned);
        }

        bridge_trunk_vlan_del(&self.nlink, &uplink, &orphaned)
            .wrap_err(|| format!("failed to delete VLANs from uplink {}", uplink.name))?;
        info!("Deleting VLANs for uplink {}: {}", uplink.name, display_vlans(&orphaned));
        Ok(orphaned)
    }
}

/// VLANs of `candidates` carried by none of the ports in `members`.
///
/// `members` holds ifindexes of the bridge ports still depending on the uplink,
/// `table` the bridge VLAN tables keyed by ifindex. Order of `candidates` is kept.
pub fn orphaned_vlans(candidates: &[u16], members: &[u32], table: &HashMap<u32, Vec<BridgeVlanInfo>>) -> Vec<u16> {
    candidates
        .iter()
        .copied()
        .filter(|&vid| {
            !members
                .iter()
                .filter_map(|index| table.get(index))
                .any(|vlans| vlans.iter().any(|v| v.vid == vid))
        })
        .collect()
}
