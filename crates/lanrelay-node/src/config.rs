//! Configuration types for lanrelay-node.
//! Parsed from ~/.lanrelay/config.toml.

use lanrelay_protocol::{DEFAULT_PARAMS, PUBLIC_GROUP};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub transfer: TransferSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Stable device id. A fresh one is generated per run when absent.
    pub device_id: Option<uuid::Uuid>,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    /// Accept every incoming file offer that fits on disk.
    #[serde(default)]
    pub auto_accept: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            device_id: None,
            group: default_group(),
            download_dir: default_download_dir(),
            auto_accept: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Only use the NIC with this name.
    pub interface: Option<String>,
    /// Explicit NIC list. Empty = enumerate active IPv4 NICs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceEntry>,
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Drop a connection on a malformed frame header instead of skipping it.
    #[serde(default)]
    pub strict_framing: bool,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            discovery_port: default_discovery_port(),
            interface: None,
            interfaces: Vec::new(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
            device_timeout_ms: default_device_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            strict_framing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceEntry {
    #[serde(default)]
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            relay_buffer_size: default_relay_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: String,
    pub password: Option<String>,
}

// Default value functions
fn default_device_name() -> String {
    use rand::Rng;
    format!("User-{:04X}", rand::thread_rng().gen::<u16>())
}
fn default_group() -> String {
    PUBLIC_GROUP.into()
}
fn default_download_dir() -> String {
    "~/Downloads/LanRelay".into()
}
fn default_tcp_port() -> u16 {
    DEFAULT_PARAMS.tcp_port
}
fn default_discovery_port() -> u16 {
    DEFAULT_PARAMS.discovery_port
}
fn default_broadcast_interval_ms() -> u64 {
    DEFAULT_PARAMS.broadcast_interval_ms
}
fn default_device_timeout_ms() -> u64 {
    DEFAULT_PARAMS.device_timeout_ms
}
fn default_sweep_interval_ms() -> u64 {
    DEFAULT_PARAMS.sweep_interval_ms
}
fn default_chunk_size() -> usize {
    DEFAULT_PARAMS.chunk_bytes
}
fn default_relay_buffer_size() -> usize {
    DEFAULT_PARAMS.relay_buffer_bytes
}

impl NodeConfig {
    /// Load config from file, or defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.group.trim().is_empty() {
            anyhow::bail!("node.group must not be blank");
        }
        if self.network.broadcast_interval_ms == 0 || self.network.sweep_interval_ms == 0 {
            anyhow::bail!("network intervals must be positive");
        }
        if self.transfer.chunk_size == 0 || self.transfer.relay_buffer_size == 0 {
            anyhow::bail!("transfer buffer sizes must be positive");
        }
        if self.transfer.chunk_size > DEFAULT_PARAMS.max_frame_bytes {
            anyhow::bail!(
                "transfer.chunk_size {} exceeds the {} byte frame limit",
                self.transfer.chunk_size,
                DEFAULT_PARAMS.max_frame_bytes
            );
        }
        Ok(())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.network.broadcast_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.network.sweep_interval_ms)
    }

    pub fn device_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.network.device_timeout_ms as i64)
    }
}
