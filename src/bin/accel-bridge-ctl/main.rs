use accelerated_bridge::netlink::iproute2::IpRoute2;
use accelerated_bridge::netlink::{BridgeVlanInfo, Netlink};
use accelerated_bridge::sriov::{SriovProvider, SysfsSriov};
use accelerated_bridge::uplink::{get_pf_uplink_or_bond, parent_bridge_for_link};
use accelerated_bridge::vlan::display_vlans;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Inspect the SR-IOV and bridge state the accelerated bridge plugin relies on
#[derive(Parser)]
#[command(name = "accel-bridge-ctl", author, version, about)]
struct Cli {
    /// Root of the sysfs tree
    #[arg(long, default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the representor netdevice of a VF
    Representor {
        /// Physical function netdevice
        #[arg(long)]
        pf: String,

        /// VF index on the physical function
        #[arg(long)]
        vf: u32,
    },

    /// Show the bridge member standing for a PF (the PF or its bond)
    Uplink {
        /// Physical function netdevice
        #[arg(long)]
        pf: String,
    },

    /// Show bridge VLAN tables
    BridgeVlans {
        /// Only ports of this bridge
        #[arg(long)]
        bridge: Option<String>,
    },

    /// List the ports of a bridge
    Members {
        /// Bridge name
        #[arg(long)]
        bridge: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let nlink = IpRoute2::default();

    match cli.command {
        Commands::Representor { pf, vf } => {
            let sriov = SysfsSriov::new(&cli.sysfs_root);
            let rep = sriov
                .vf_representor(&pf, vf)
                .with_context(|| format!("Failed to find representor of VF {} on {}", vf, pf))?;
            println!("{}", rep);
        }
        Commands::Uplink { pf } => {
            let uplink = get_pf_uplink_or_bond(&nlink, &pf)?;
            match parent_bridge_for_link(&nlink, &uplink) {
                Ok(bridge) => println!("{} (bridge {})", uplink.name, bridge.name),
                Err(err) => {
                    debug!("No parent bridge for {}: {}", uplink.name, err);
                    println!("{} (no bridge)", uplink.name);
                }
            }
        }
        Commands::BridgeVlans { bridge } => {
            let table = nlink.bridge_vlan_list().context("Failed to list bridge VLANs")?;
            let ports = match &bridge {
                Some(bridge) => nlink
                    .bridge_members(bridge)
                    .with_context(|| format!("Failed to list members of {}", bridge))?
                    .into_iter()
                    .map(|name| nlink.link_by_name(&name))
                    .collect::<Result<Vec<_>, _>>()?,
                None => table
                    .keys()
                    .map(|&index| nlink.link_by_index(index))
                    .collect::<Result<Vec<_>, _>>()?,
            };

            for port in ports.iter().sorted_by_key(|p| p.index) {
                let vlans = table.get(&port.index).map(Vec::as_slice).unwrap_or_default();
                println!("{:<16} {}", port.name, describe_vlans(vlans));
            }
        }
        Commands::Members { bridge } => {
            for member in nlink
                .bridge_members(&bridge)
                .with_context(|| format!("Failed to list members of {}", bridge))?
            {
                println!("{}", member);
            }
        }
    }

    Ok(())
}

/// Renders a port's VLANs as `1 (PVID untagged), 100,200`.
fn describe_vlans(vlans: &[BridgeVlanInfo]) -> String {
    let (untagged, tagged): (Vec<&BridgeVlanInfo>, Vec<&BridgeVlanInfo>) =
        vlans.iter().partition(|v| v.pvid || v.untagged);
    let mut parts: Vec<String> = untagged
        .iter()
        .map(|v| {
            let flags = [(v.pvid, "PVID"), (v.untagged, "untagged")]
                .iter()
                .filter(|(set, _)| *set)
                .map(|(_, name)| *name)
                .join(" ");
            format!("{} ({})", v.vid, flags)
        })
        .collect();
    let tagged: Vec<u16> = tagged.iter().map(|v| v.vid).collect();
    if !tagged.is_empty() {
        parts.push(display_vlans(&tagged));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_untagged_then_tagged_vlans() {
        let vlans = [
            BridgeVlanInfo {
                vid: 100,
                pvid: true,
                untagged: true,
            },
            BridgeVlanInfo {
                vid: 200,
                pvid: false,
                untagged: false,
            },
            BridgeVlanInfo {
                vid: 300,
                pvid: false,
                untagged: false,
            },
        ];
        assert_eq!(describe_vlans(&vlans), "100 (PVID untagged), 200,300");
        assert_eq!(describe_vlans(&[]), "");
    }
}
