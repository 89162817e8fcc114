//! Resolution of the device that actually sits in the bridge for a PF.

use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::netlink::{Link, Netlink};

/// Returns the uplink bridge member for the physical function `pf_name`.
///
/// A PF enslaved to a bond is represented on the bridge by the bond, so the
/// bond master is returned instead. Resolved on every call, bond membership can
/// change between attach and detach.
pub fn get_pf_uplink_or_bond<N: Netlink + ?Sized>(nlink: &N, pf_name: &str) -> Result<Link> {
    let uplink = nlink
        .link_by_name(pf_name)
        .wrap_err(|| format!("failed to lookup PF {pf_name}"))?;

    if !uplink.is_bond_slave() {
        return Ok(uplink);
    }

    let master_index = uplink
        .master_index
        .ok_or_else(|| Error::not_found("bond master of", uplink.name.clone()))?;
    let bond = nlink.link_by_index(master_index).wrap_err(|| {
        format!(
            "failed to lookup bond interface from slave link master index - Name:{} MasterIndex:{}",
            uplink.name, master_index
        )
    })?;

    if !bond.is_bond() {
        return Err(Error::kernel(
            "resolve uplink",
            uplink.name.clone(),
            format!("master link {} is not a bond", bond.name),
        ));
    }

    debug!("Using bond master as uplink: {}", bond.name);
    Ok(bond)
}

/// Returns the Linux bridge `link` belongs to, following intermediate masters
/// such as a bond.
pub fn parent_bridge_for_link<N: Netlink + ?Sized>(nlink: &N, link: &Link) -> Result<Link> {
    let mut current = link.clone();
    while !current.is_bridge() {
        let index = current
            .master_index
            .ok_or_else(|| Error::not_found("master of link", current.name.clone()))?;
        current = nlink.link_by_index(index)?;
    }
    Ok(current)
}
