//! VF and representor lifecycle.
//!
//! [`Manager`] moves a VF netdevice between the host and a container namespace
//! and wires its representor into a bridge. Every operation runs to completion
//! or stops at the first failing step; apart from the representor's bridge
//! master nothing is rolled back, the caller runs the inverse operation.
//!
//! Nothing here locks. Callers must serialize operations on the same PF or
//! bridge, concurrent detaches can otherwise compute a wrong set of VLANs to
//! reclaim from a shared uplink.

use tracing::info;

use crate::config::PluginConf;
use crate::error::{Error, Result, ResultExt};
use crate::netlink::iproute2::IpRoute2;
use crate::netlink::{with_netns, NetNs, NetNsOps, Netlink};
use crate::sriov::{SriovProvider, SysfsSriov};
use crate::types::MacAddr;

mod representor;

pub use representor::orphaned_vlans;

/// Prefix of the intermediate name a VF carries while it changes namespace.
const TEMP_NAME_PREFIX: &str = "temp_";

/// Orchestrates VF and representor operations over a link capability.
pub struct Manager<L = IpRoute2, S = SysfsSriov> {
    nlink: L,
    sriov: S,
}

impl Manager {
    /// Manager acting on the running kernel.
    pub fn new() -> Self {
        Self::with_providers(IpRoute2::default(), SysfsSriov::default())
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl<L, S> Manager<L, S>
where
    L: Netlink + NetNsOps,
    S: SriovProvider,
{
    pub fn with_providers(nlink: L, sriov: S) -> Self {
        Self { nlink, sriov }
    }

    /// Link capability in use.
    pub fn nlink(&self) -> &L {
        &self.nlink
    }

    /// Moves the VF named `conf.orig_vf_state.host_if_name` into `netns` as
    /// `pod_if_name` and brings it up.
    ///
    /// Returns the MAC the interface ends up with, the override if one is
    /// configured.
    pub fn setup_vf(
        &self,
        conf: &mut PluginConf,
        pod_if_name: &str,
        _container_id: &str,
        netns: &NetNs,
    ) -> Result<Option<MacAddr>> {
        let link_name = conf.orig_vf_state.host_if_name.clone();
        let mut link = self
            .nlink
            .link_by_name(&link_name)
            .wrap_err(|| format!("error getting VF netdevice with name {link_name}"))?;

        // Named after the ifindex so that a device already called
        // `pod_if_name` on the host cannot collide with it.
        let temp_name = format!("{TEMP_NAME_PREFIX}{}", link.index);

        self.nlink
            .link_set_down(&link)
            .wrap_err(|| format!("failed to down vf device {link_name}"))?;

        self.nlink
            .link_set_name(&mut link, &temp_name)
            .wrap_err(|| format!("error setting temp IF name {temp_name} for {link_name}"))?;

        let mut mac = link.mac;
        if let Some(requested) = conf.mac.as_deref() {
            let hwaddr: MacAddr = requested
                .parse()
                .wrap_err(|| format!("failed to parse MAC address {requested}"))?;

            if let Some(current) = link.mac {
                conf.orig_vf_state.effective_mac.get_or_insert(current);
            }

            self.nlink
                .link_set_hardware_addr(&link, &hwaddr)
                .wrap_err(|| format!("failed to set netlink MAC address to {hwaddr}"))?;
            mac = Some(hwaddr);
        }

        if let Some(mtu) = conf.mtu {
            conf.orig_vf_state.mtu.get_or_insert(link.mtu);
            self.nlink
                .link_set_mtu(&link, mtu)
                .wrap_err(|| format!("failed to set MTU on VF {}", link.name))?;
            info!("VF link {} MTU set to {}", link.name, mtu);
        }

        self.nlink
            .link_set_ns(&link, netns)
            .wrap_err(|| format!("failed to move IF {temp_name} to netns"))?;

        with_netns(&self.nlink, netns, || {
            self.nlink
                .link_set_name(&mut link, pod_if_name)
                .wrap_err(|| format!("error setting container interface name {pod_if_name} for {temp_name}"))?;

            self.nlink
                .link_set_up(&link)
                .wrap_err(|| format!("error bringing interface {pod_if_name} up in container ns"))
        })
        .wrap_err(|| "error setting up interface in container namespace")?;

        conf.cont_if_names = pod_if_name.to_string();

        Ok(mac)
    }

    /// Returns the VF from `netns` to the caller's namespace under its original
    /// name, restoring the MAC and MTU changed by [`Manager::setup_vf`].
    pub fn release_vf(
        &self,
        conf: &PluginConf,
        pod_if_name: &str,
        _container_id: &str,
        netns: &NetNs,
    ) -> Result<()> {
        let init_ns = self.nlink.current_ns().wrap_err(|| "failed to get init netns")?;
        let host_if_name = conf.orig_vf_state.host_if_name.as_str();

        // One VF per call: a recorded host name needs a recorded container name.
        if conf.cont_if_names.is_empty() && !host_if_name.is_empty() {
            return Err(Error::not_found("container interface name of VF", host_if_name))
                .wrap_err(|| "interface names mismatch between container and host");
        }

        with_netns(&self.nlink, netns, || {
            let mut link = self
                .nlink
                .link_by_name(pod_if_name)
                .wrap_err(|| format!("failed to get netlink device with name {pod_if_name}"))?;

            self.nlink
                .link_set_down(&link)
                .wrap_err(|| format!("failed to set link {pod_if_name} down"))?;

            self.nlink
                .link_set_name(&mut link, host_if_name)
                .wrap_err(|| format!("failed to rename link {pod_if_name} to host name {host_if_name}"))?;

            if conf.mac.is_some() {
                let orig = conf
                    .orig_vf_state
                    .effective_mac
                    .ok_or_else(|| Error::not_found("original effective MAC of", host_if_name))?;
                self.nlink
                    .link_set_hardware_addr(&link, &orig)
                    .wrap_err(|| format!("failed to restore original effective netlink MAC address {orig}"))?;
            }

            if conf.mtu.is_some() {
                let orig = conf
                    .orig_vf_state
                    .mtu
                    .ok_or_else(|| Error::not_found("original MTU of", host_if_name))?;
                self.nlink
                    .link_set_mtu(&link, orig)
                    .wrap_err(|| format!("failed to set MTU on VF {}", link.name))?;
                info!("VF link {} MTU set to {}", link.name, orig);
            }

            self.nlink
                .link_set_ns(&link, &init_ns)
                .wrap_err(|| format!("failed to move interface {host_if_name} to init netns"))
        })
    }

    /// Records the VF's administrative MAC from the PF's VF table and applies
    /// the configured MAC there.
    pub fn apply_vf_config(&self, conf: &mut PluginConf) -> Result<()> {
        let pf = self
            .nlink
            .link_by_name(&conf.pf_name)
            .wrap_err(|| format!("failed to lookup master {}", conf.pf_name))?;

        let vf = pf
            .vf(conf.vf_id)
            .ok_or_else(|| Error::not_found("VF", format!("{} for PF {}", conf.vf_id, conf.pf_name)))?;
        conf.orig_vf_state.admin_mac.get_or_insert(vf.mac);

        if let Some(requested) = conf.mac.as_deref() {
            let hwaddr: MacAddr = requested
                .parse()
                .wrap_err(|| format!("failed to parse MAC address {requested}"))?;
            self.nlink
                .link_set_vf_hardware_addr(&pf, conf.vf_id, &hwaddr)
                .wrap_err(|| format!("failed to set MAC address to {hwaddr}"))?;
        }

        Ok(())
    }

    /// Restores the administrative MAC recorded by [`Manager::apply_vf_config`].
    pub fn reset_vf_config(&self, conf: &PluginConf) -> Result<()> {
        let pf = self
            .nlink
            .link_by_name(&conf.pf_name)
            .wrap_err(|| format!("failed to lookup master {}", conf.pf_name))?;

        if conf.mac.is_some() {
            let orig = conf
                .orig_vf_state
                .admin_mac
                .ok_or_else(|| Error::not_found("original administrative MAC of VF", conf.vf_id.to_string()))?;
            self.nlink
                .link_set_vf_hardware_addr(&pf, conf.vf_id, &orig)
                .wrap_err(|| format!("failed to restore original administrative MAC address {orig}"))?;
        }

        Ok(())
    }
}
