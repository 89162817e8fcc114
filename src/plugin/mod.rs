use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{PluginConf, Settings};
use crate::error::ErrorKind;
use crate::ipam::{ExecIpam, Ipam};
use crate::manager::Manager;
use crate::netlink::iproute2::IpRoute2;
use crate::netlink::{NetNs, NetNsGuard, NetNsOps, Netlink};
use crate::sriov::{SriovProvider, SysfsSriov};
use crate::types::{CmdArgs, Interface, Result as CniResult};
use crate::uplink::{get_pf_uplink_or_bond, parent_bridge_for_link};

/// Accelerated bridge plugin implementation
pub struct AcceleratedBridgePlugin<L = IpRoute2, S = SysfsSriov, I = ExecIpam> {
    manager: Manager<L, S>,
    ipam: I,
    settings: Settings,
    args: CmdArgs,
}

/// What an ADD has done so far, for unwinding on failure.
#[derive(Debug, Default)]
struct AddProgress {
    representor_attached: bool,
    ipam_allocated: bool,
}

impl AcceleratedBridgePlugin {
    /// Create a plugin acting on the running kernel
    pub fn new(settings: Settings, args: CmdArgs) -> Self {
        let manager = Manager::with_providers(IpRoute2::default(), SysfsSriov::new(&settings.sysfs_root));
        let ipam = ExecIpam::new(&args);
        Self::with_parts(manager, ipam, settings, args)
    }
}

impl<L, S, I> AcceleratedBridgePlugin<L, S, I>
where
    L: Netlink + NetNsOps,
    S: SriovProvider,
    I: Ipam,
{
    pub fn with_parts(manager: Manager<L, S>, ipam: I, settings: Settings, args: CmdArgs) -> Self {
        Self {
            manager,
            ipam,
            settings,
            args,
        }
    }

    pub fn manager(&self) -> &Manager<L, S> {
        &self.manager
    }

    pub fn ipam(&self) -> &I {
        &self.ipam
    }

    /// Moves the VF into the container, wires its representor and configures
    /// addressing. Anything done before a failure is undone on a best-effort basis.
    pub fn add_network(&self, mut conf: PluginConf) -> Result<CniResult> {
        self.select_bridge(&mut conf)?;

        let netns = NetNs::open(&self.args.netns)
            .with_context(|| format!("Failed to open netns {}", self.args.netns))?;

        self.manager
            .apply_vf_config(&mut conf)
            .context("Failed to apply VF config")?;

        let mac = match self
            .manager
            .setup_vf(&mut conf, &self.args.ifname, &self.args.container_id, &netns)
        {
            Ok(mac) => mac,
            Err(err) => {
                if let Err(reset_err) = self.manager.reset_vf_config(&conf) {
                    warn!("Failed to reset VF config after error: {}", reset_err);
                }
                return Err(err).context("Failed to set up VF");
            }
        };

        let mut progress = AddProgress::default();
        match self.complete_add(&mut conf, &netns, mac.map(|m| m.to_string()), &mut progress) {
            Ok(result) => {
                info!(
                    "Attached VF {} of {} as {} in {}",
                    conf.vf_id, conf.pf_name, self.args.ifname, self.args.netns
                );
                Ok(result)
            }
            Err(err) => {
                self.unwind_add(&conf, &netns, &progress);
                Err(err)
            }
        }
    }

    fn complete_add(
        &self,
        conf: &mut PluginConf,
        netns: &NetNs,
        mac: Option<String>,
        progress: &mut AddProgress,
    ) -> Result<CniResult> {
        self.manager
            .attach_representor(conf)
            .context("Failed to attach representor")?;
        progress.representor_attached = true;

        let mut result = CniResult::new(&conf.cni_version);
        let index = result.add_interface(Interface {
            name: self.args.ifname.clone(),
            mac,
            sandbox: Some(self.args.netns.clone()),
        });

        if let Some(ipam) = &conf.ipam {
            let allocated = self
                .ipam
                .exec_add(&ipam.ipam_type, &self.args.stdin_data)
                .context("Failed to allocate addresses")?;
            progress.ipam_allocated = true;

            if allocated.ips.as_ref().map_or(true, Vec::is_empty) {
                anyhow::bail!("IPAM plugin {} returned missing IP config", ipam.ipam_type);
            }

            {
                let _guard = NetNsGuard::enter(self.manager.nlink(), netns)
                    .context("Failed to enter container netns")?;
                self.ipam
                    .configure_iface(&self.args.ifname, &allocated)
                    .context("Failed to configure container interface")?;
            }

            for mut ip in allocated.ips.into_iter().flatten() {
                ip.interface = Some(index);
                result.add_ip(ip);
            }
            for route in allocated.routes.into_iter().flatten() {
                result.add_route(route);
            }
            if let Some(dns) = allocated.dns {
                result.set_dns(dns);
            }
        }

        conf.save(&self.cache_path())?;

        Ok(result)
    }

    fn unwind_add(&self, conf: &PluginConf, netns: &NetNs, progress: &AddProgress) {
        if progress.ipam_allocated {
            if let Some(ipam) = &conf.ipam {
                if let Err(err) = self.ipam.exec_del(&ipam.ipam_type, &self.args.stdin_data) {
                    warn!("Failed to release addresses after error: {}", err);
                }
            }
        }
        if progress.representor_attached {
            if let Err(err) = self.manager.detach_representor(conf) {
                warn!("Failed to detach representor after error: {}", err);
            }
        }
        if let Err(err) = self
            .manager
            .release_vf(conf, &self.args.ifname, &self.args.container_id, netns)
        {
            warn!("Failed to release VF after error: {}", err);
        }
        if let Err(err) = self.manager.reset_vf_config(conf) {
            warn!("Failed to reset VF config after error: {}", err);
        }
    }

    /// Releases what ADD set up, using the configuration cached by ADD.
    ///
    /// Without a cache entry there is nothing to undo. When the container
    /// namespace is already gone only the host side is cleaned up.
    pub fn del_network(&self) -> Result<()> {
        let path = self.cache_path();
        let Some(conf) = PluginConf::load_cached(&path)? else {
            info!("No cached configuration at {}, nothing to release", path.display());
            return Ok(());
        };

        let netns = self.open_netns_if_present()?;

        if !conf.representor.is_empty() {
            self.manager
                .detach_representor(&conf)
                .context("Failed to detach representor")?;
        }

        match &netns {
            Some(netns) => self
                .manager
                .release_vf(&conf, &self.args.ifname, &self.args.container_id, netns)
                .context("Failed to release VF")?,
            None => warn!("Netns {} is gone, skipping VF release", self.args.netns),
        }

        self.manager
            .reset_vf_config(&conf)
            .context("Failed to reset VF config")?;

        if let Some(ipam) = &conf.ipam {
            self.ipam
                .exec_del(&ipam.ipam_type, &self.args.stdin_data)
                .context("Failed to release addresses")?;
        }

        PluginConf::remove_cached(&path)
    }

    /// Verifies the container interface exists and is up, and that the
    /// representor still sits on the bridge chosen at ADD.
    pub fn check_network(&self) -> Result<()> {
        let netns = NetNs::open(&self.args.netns)
            .with_context(|| format!("Failed to open netns {}", self.args.netns))?;

        {
            let nlink = self.manager.nlink();
            let _guard = NetNsGuard::enter(nlink, &netns).context("Failed to enter container netns")?;
            let link = nlink
                .link_by_name(&self.args.ifname)
                .with_context(|| format!("Interface {} does not exist in container", self.args.ifname))?;
            if !link.up {
                anyhow::bail!("Interface {} is not UP", self.args.ifname);
            }
        }

        let path = self.cache_path();
        let conf = PluginConf::load_cached(&path)?
            .with_context(|| format!("No cached configuration at {}", path.display()))?;

        let nlink = self.manager.nlink();
        let rep = nlink
            .link_by_name(&conf.representor)
            .with_context(|| format!("Representor {} does not exist", conf.representor))?;
        let bridge = nlink
            .link_by_name(&conf.actual_bridge)
            .with_context(|| format!("Bridge {} does not exist", conf.actual_bridge))?;
        if rep.master_index != Some(bridge.index) {
            anyhow::bail!("Representor {} is not attached to bridge {}", rep.name, bridge.name);
        }

        Ok(())
    }

    /// Picks the bridge to attach to. With several candidates it is the one
    /// the PF uplink (or its bond) is a member of.
    fn select_bridge(&self, conf: &mut PluginConf) -> Result<()> {
        let bridges = conf.bridges();
        if let [only] = bridges.as_slice() {
            conf.actual_bridge = only.clone();
            return Ok(());
        }

        let nlink = self.manager.nlink();
        let uplink = get_pf_uplink_or_bond(nlink, &conf.pf_name)
            .with_context(|| format!("Failed to resolve uplink of PF {}", conf.pf_name))?;
        let parent = parent_bridge_for_link(nlink, &uplink)
            .with_context(|| format!("Failed to find bridge of uplink {}", uplink.name))?;

        if !bridges.contains(&parent.name) {
            anyhow::bail!(
                "Uplink {} is attached to bridge {}, which is not one of {}",
                uplink.name,
                parent.name,
                conf.bridge
            );
        }

        info!("Selected bridge {} for uplink {}", parent.name, uplink.name);
        conf.actual_bridge = parent.name;
        Ok(())
    }

    fn open_netns_if_present(&self) -> Result<Option<NetNs>> {
        if self.args.netns.is_empty() {
            return Ok(None);
        }
        match NetNs::open(&self.args.netns) {
            Ok(netns) => Ok(Some(netns)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to open netns {}", self.args.netns)),
        }
    }

    fn cache_path(&self) -> std::path::PathBuf {
        self.settings
            .cache_path(&self.args.container_id, &self.args.ifname)
    }
}
