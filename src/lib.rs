//! Accelerated bridge CNI plugin
//!
//! Binds an SR-IOV VF to a container network namespace and, with the NIC in
//! switchdev mode, plugs the VF's representor into a Linux bridge:
//! - Moves the VF into the container, saving and restoring its name, MAC and MTU
//! - Attaches the representor to the bridge with the requested PVID and trunk VLANs
//! - Optionally mirrors those VLANs on the PF uplink (or its bond) and reclaims
//!   them on detach once no other port needs them
//! - Delegates addressing to an IPAM plugin

pub mod commands;
pub mod config;
pub mod error;
pub mod ipam;
pub mod manager;
pub mod netlink;
pub mod plugin;
pub mod sriov;
pub mod types;
pub mod uplink;
pub mod vlan;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::{NetConf, PluginConf, Settings};
pub use error::{Error, ErrorKind};
pub use manager::Manager;
pub use plugin::AcceleratedBridgePlugin;
