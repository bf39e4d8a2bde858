//! NIC enumeration and bridge detection.
//!
//! A bridge is a host with active IPv4 NICs on two or more distinct subnets.
//! Loopback and link-local (169.254/16) addresses are never used.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::config::InterfaceEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NicInfo {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl NicInfo {
    pub fn new(name: impl Into<String>, ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            ip,
            netmask,
        }
    }

    /// `(ip & mask) | !mask`.
    pub fn broadcast_address(&self) -> Ipv4Addr {
        let mask = u32::from(self.netmask);
        Ipv4Addr::from((u32::from(self.ip) & mask) | !mask)
    }

    /// Network address, `ip & mask`.
    pub fn subnet(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) & u32::from(self.netmask))
    }
}

impl From<&InterfaceEntry> for NicInfo {
    fn from(entry: &InterfaceEntry) -> Self {
        let name = if entry.name.is_empty() {
            entry.ip.to_string()
        } else {
            entry.name.clone()
        };
        Self::new(name, entry.ip, entry.netmask)
    }
}

/// Whether an address may carry discovery traffic.
pub fn is_usable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
}

/// Active, usable IPv4 NICs as reported by the OS.
pub fn active_nics() -> std::io::Result<Vec<NicInfo>> {
    let mut nics = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = &iface.addr {
            if is_usable(v4.ip) {
                nics.push(NicInfo::new(iface.name.clone(), v4.ip, v4.netmask));
            }
        }
    }
    Ok(nics)
}

/// Two or more NICs on distinct subnets.
pub fn is_bridge(nics: &[NicInfo]) -> bool {
    let subnets: HashSet<Ipv4Addr> = nics.iter().map(NicInfo::subnet).collect();
    subnets.len() >= 2
}

/// Pick the NICs to run on: the explicit list if configured, otherwise the
/// OS view. `only` restricts either to one interface name.
pub fn select_nics(
    explicit: &[InterfaceEntry],
    only: Option<&str>,
) -> std::io::Result<Vec<NicInfo>> {
    let nics = if explicit.is_empty() {
        active_nics()?
    } else {
        explicit.iter().map(NicInfo::from).collect()
    };
    Ok(match only {
        Some(name) => nics.into_iter().filter(|n| n.name == name).collect(),
        None => nics,
    })
}
