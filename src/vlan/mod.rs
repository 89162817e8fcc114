//! Bridge VLAN helpers.
//!
//! Translates VLAN intents into primitive [`Netlink`] calls. All of them act on
//! the port through its bridge master (`master` flag), never on the bridge
//! device itself.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ResultExt};
use crate::netlink::{Link, Netlink, VlanFlags};

/// VLAN the kernel bridge gives every new port.
pub const DEFAULT_VLAN: u16 = 1;
/// Highest usable 802.1Q VLAN id.
pub const MAX_VLAN: u16 = 4094;

const PVID_FLAGS: VlanFlags = VlanFlags {
    pvid: true,
    untagged: true,
    self_: false,
    master: true,
};

const TRUNK_FLAGS: VlanFlags = VlanFlags {
    pvid: false,
    untagged: false,
    self_: false,
    master: true,
};

/// Makes `vlan` the port's PVID, egress untagged.
pub fn bridge_pvid_vlan_add<N: Netlink + ?Sized>(nlink: &N, link: &Link, vlan: u16) -> Result<()> {
    nlink.bridge_vlan_add(link, vlan, PVID_FLAGS)
}

/// Removes the PVID `vlan` from the port.
pub fn bridge_pvid_vlan_del<N: Netlink + ?Sized>(nlink: &N, link: &Link, vlan: u16) -> Result<()> {
    nlink.bridge_vlan_del(link, vlan, PVID_FLAGS)
}

/// Adds every VLAN in `vlans` to the port, egress tagged. Stops at the first failure.
pub fn bridge_trunk_vlan_add<N: Netlink + ?Sized>(nlink: &N, link: &Link, vlans: &[u16]) -> Result<()> {
    for &vlan in vlans {
        nlink
            .bridge_vlan_add(link, vlan, TRUNK_FLAGS)
            .wrap_err(|| format!("add tagged VLAN {vlan}"))?;
    }
    Ok(())
}

/// Removes every VLAN in `vlans` from the port's tagged set. Stops at the first failure.
pub fn bridge_trunk_vlan_del<N: Netlink + ?Sized>(nlink: &N, link: &Link, vlans: &[u16]) -> Result<()> {
    for &vlan in vlans {
        nlink
            .bridge_vlan_del(link, vlan, TRUNK_FLAGS)
            .wrap_err(|| format!("delete tagged VLAN {vlan}"))?;
    }
    Ok(())
}

/// Whether the port needs its default VLAN removed before applying the policy.
///
/// VLAN 1 stays when it is itself the requested PVID and no trunk is set.
pub fn needs_default_vlan_removal(pvid: u16, trunk: &[u16]) -> bool {
    pvid > DEFAULT_VLAN || !trunk.is_empty()
}

/// Trunk VLANs followed by the PVID, if any: what the shared uplink must carry tagged.
pub fn uplink_vlans(pvid: u16, trunk: &[u16]) -> Vec<u16> {
    let mut vlans = trunk.to_vec();
    if pvid > 0 {
        vlans.push(pvid);
    }
    vlans
}

/// Renders a VLAN list as `100,200,300` for logs.
pub fn display_vlans(vlans: &[u16]) -> String {
    vlans.iter().join(",")
}

/// One entry of a trunk definition: a single id or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrunkEntry {
    #[serde(rename = "minID", skip_serializing_if = "Option::is_none")]
    pub min_id: Option<u16>,
    #[serde(rename = "maxID", skip_serializing_if = "Option::is_none")]
    pub max_id: Option<u16>,
    #[serde(rename = "id", skip_serializing_if = "Option::is_none")]
    pub id: Option<u16>,
}

/// Expands trunk entries into a sorted, de-duplicated VLAN list.
///
/// An entry carries either `id` or both `minID` and `maxID`, all within 1..=4094.
pub fn split_trunk(entries: &[TrunkEntry]) -> Result<Vec<u16>> {
    let mut vlans = Vec::new();
    for entry in entries {
        match (entry.id, entry.min_id, entry.max_id) {
            (Some(id), None, None) => {
                check_vlan_id(id)?;
                vlans.push(id);
            }
            (None, Some(min), Some(max)) => {
                check_vlan_id(min)?;
                check_vlan_id(max)?;
                if min > max {
                    return Err(Error::malformed(
                        "trunk range",
                        format!("{min}-{max}"),
                        "minID is greater than maxID",
                    ));
                }
                vlans.extend(min..=max);
            }
            _ => {
                return Err(Error::malformed(
                    "trunk entry",
                    format!("{entry:?}"),
                    "expected either id or both minID and maxID",
                ));
            }
        }
    }
    Ok(vlans.into_iter().sorted_unstable().dedup().collect())
}

fn check_vlan_id(id: u16) -> Result<()> {
    if !(DEFAULT_VLAN..=MAX_VLAN).contains(&id) {
        return Err(Error::malformed("VLAN id", id.to_string(), "must be within 1-4094"));
    }
    Ok(())
}
