use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use tracing::debug;

use crate::config::{PluginConf, Settings};
use crate::plugin::AcceleratedBridgePlugin;
use crate::sriov::SysfsSriov;
use crate::types::{CmdArgs, SUPPORTED_VERSIONS};

/// Reads the runtime parameters from `CNI_*` variables and the network
/// configuration from stdin.
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = env::var("CNI_CONTAINERID")
        .context("CNI_CONTAINERID not found in environment")?;

    // DEL may run after the runtime already removed the namespace.
    let netns = env::var("CNI_NETNS").unwrap_or_default();

    let ifname = env::var("CNI_IFNAME")
        .context("CNI_IFNAME not found in environment")?;

    let path = env::var("CNI_PATH").unwrap_or_default();

    let args_str = env::var("CNI_ARGS").unwrap_or_default();
    let args = parse_cni_args(&args_str);

    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read network configuration from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Splits `K1=V1;K2=V2`, dropping entries without `=`.
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// ADD: attach the VF and print the result.
pub fn cmd_add() -> Result<()> {
    let args = parse_args()?;
    if args.netns.is_empty() {
        anyhow::bail!("CNI_NETNS not found in environment");
    }

    let settings = Settings::from_env();
    let conf = PluginConf::load(&args.stdin_data, &SysfsSriov::new(&settings.sysfs_root))?;
    debug!("Loaded configuration for VF {} of PF {}", conf.vf_id, conf.pf_name);

    let plugin = AcceleratedBridgePlugin::new(settings, args);
    let result = plugin.add_network(conf)?;

    result.print()?;

    Ok(())
}

pub fn cmd_del() -> Result<()> {
    let args = parse_args()?;

    let plugin = AcceleratedBridgePlugin::new(Settings::from_env(), args);
    plugin.del_network()
}

pub fn cmd_check() -> Result<()> {
    let args = parse_args()?;

    let plugin = AcceleratedBridgePlugin::new(Settings::from_env(), args);
    plugin.check_network()
}

/// Versions reply printed for the VERSION command
pub fn version_info() -> serde_json::Value {
    serde_json::json!({
        "cniVersion": "1.0.0",
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

/// Dispatches on `CNI_COMMAND`.
pub fn run_cni() -> Result<()> {
    let cmd = env::var("CNI_COMMAND")
        .context("CNI_COMMAND not found in environment")?;

    match cmd.as_str() {
        "ADD" => cmd_add(),
        "DEL" => cmd_del(),
        "CHECK" => cmd_check(),
        "VERSION" => {
            println!("{}", version_info());
            Ok(())
        }
        _ => anyhow::bail!("Unknown CNI command: {}", cmd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cni_args() {
        let args = parse_cni_args("IgnoreUnknown=1;K8S_POD_NAME=web-0;broken");
        assert_eq!(args.len(), 2);
        assert_eq!(args["K8S_POD_NAME"], "web-0");
        assert!(parse_cni_args("").is_empty());
    }

    #[test]
    fn version_lists_supported_versions() {
        let info = version_info();
        assert_eq!(info["supportedVersions"].as_array().unwrap().len(), SUPPORTED_VERSIONS.len());
    }
}
