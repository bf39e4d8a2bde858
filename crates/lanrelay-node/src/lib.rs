//! LanRelay Node -- library crate for LAN discovery, messaging and transfer.
//!
//! Re-exports all internal modules so integration tests and the binary can
//! reach transport, discovery, tables, relay and transfer types.

pub mod config;
pub mod discovery_task;
pub mod file_transfer;
pub mod nic;
pub mod node;
pub mod relay;
pub mod sweep_task;
pub mod tables;
pub mod transport;
pub mod udp;

use std::net::SocketAddr;
use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Parse `ip:port`, or a bare IP with `default_port`.
pub fn parse_peer_addr(s: &str, default_port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: std::net::IpAddr = s
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid peer address: {s}"))?;
    Ok(SocketAddr::new(ip, default_port))
}
