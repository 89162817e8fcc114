//! IPAM delegation.
//!
//! The plugin does not allocate addresses itself. It runs the IPAM plugin named
//! in the network configuration, the way a CNI runtime runs any plugin, and
//! applies the addresses and routes it hands back to the container interface.

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, info};

use crate::types::{CmdArgs, ErrorResult, Result as CniResult};

/// Address management collaborator of the plugin.
pub trait Ipam {
    /// Allocates addresses for the interface.
    fn exec_add(&self, plugin: &str, netconf: &[u8]) -> Result<CniResult>;
    /// Releases whatever `exec_add` allocated.
    fn exec_del(&self, plugin: &str, netconf: &[u8]) -> Result<()>;
    /// Applies the result's addresses and routes to `ifname`. Runs inside the
    /// container namespace.
    fn configure_iface(&self, ifname: &str, result: &CniResult) -> Result<()>;
}

/// Runs IPAM plugins found on `CNI_PATH` and configures interfaces with `ip`.
#[derive(Debug, Clone)]
pub struct ExecIpam {
    search_path: Vec<PathBuf>,
    env: Vec<(String, String)>,
}

impl ExecIpam {
    /// Delegate for the invocation described by `args`.
    pub fn new(args: &CmdArgs) -> Self {
        let search_path = std::env::split_paths(&args.path).collect();
        let cni_args = args
            .args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");

        Self {
            search_path,
            env: vec![
                ("CNI_CONTAINERID".to_string(), args.container_id.clone()),
                ("CNI_NETNS".to_string(), args.netns.clone()),
                ("CNI_IFNAME".to_string(), args.ifname.clone()),
                ("CNI_ARGS".to_string(), cni_args),
                ("CNI_PATH".to_string(), args.path.clone()),
            ],
        }
    }

    /// Locates `plugin` in the search path.
    pub fn find_plugin(&self, plugin: &str) -> Result<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| candidate.is_file())
            .with_context(|| format!("Failed to find plugin {:?} in path {:?}", plugin, self.search_path))
    }

    fn exec(&self, command: &str, plugin: &str, netconf: &[u8]) -> Result<Vec<u8>> {
        let binary = self.find_plugin(plugin)?;
        debug!("Executing IPAM plugin {} {}", binary.display(), command);

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute IPAM plugin {}", binary.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(netconf)
                .context("Failed to write network configuration to IPAM plugin")?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for IPAM plugin {}", binary.display()))?;

        if !output.status.success() {
            let msg = serde_json::from_slice::<ErrorResult>(&output.stdout)
                .map(|reply| reply.msg)
                .unwrap_or_else(|_| String::from_utf8_lossy(&output.stderr).trim().to_string());
            anyhow::bail!("IPAM plugin {} {} failed: {}", plugin, command, msg);
        }

        Ok(output.stdout)
    }
}

impl Ipam for ExecIpam {
    fn exec_add(&self, plugin: &str, netconf: &[u8]) -> Result<CniResult> {
        let stdout = self.exec("ADD", plugin, netconf)?;
        serde_json::from_slice(&stdout).with_context(|| format!("Failed to parse result of IPAM plugin {}", plugin))
    }

    fn exec_del(&self, plugin: &str, netconf: &[u8]) -> Result<()> {
        self.exec("DEL", plugin, netconf).map(|_| ())
    }

    fn configure_iface(&self, ifname: &str, result: &CniResult) -> Result<()> {
        for ip in result.ips.iter().flatten() {
            let address: IpNetwork = ip
                .address
                .parse()
                .with_context(|| format!("Invalid IPAM address {}", ip.address))?;
            run_ip(&["addr", "add", &address.to_string(), "dev", ifname])?;
            info!("Added address {} to {}", address, ifname);
        }

        for route in result.routes.iter().flatten() {
            let dst: IpNetwork = route
                .dst
                .parse()
                .with_context(|| format!("Invalid IPAM route destination {}", route.dst))?;
            let gw = route
                .gw
                .as_deref()
                .or_else(|| default_gateway(result, &dst));
            let dst = dst.to_string();

            match gw {
                Some(gw) => run_ip(&["route", "add", &dst, "via", gw, "dev", ifname])?,
                None => run_ip(&["route", "add", &dst, "dev", ifname])?,
            }
            debug!("Added route {} via {:?} on {}", dst, gw, ifname);
        }

        Ok(())
    }
}

/// Gateway of the first address in the same family as `dst`.
fn default_gateway<'a>(result: &'a CniResult, dst: &IpNetwork) -> Option<&'a str> {
    result
        .ips
        .iter()
        .flatten()
        .filter(|ip| {
            ip.address
                .parse::<IpNetwork>()
                .is_ok_and(|addr| addr.is_ipv6() == dst.is_ipv6())
        })
        .find_map(|ip| ip.gateway.as_deref())
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute ip {}", args.join(" ")))?;

    if !output.status.success() {
        anyhow::bail!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
