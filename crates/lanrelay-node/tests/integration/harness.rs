//! Test harness for in-process lanrelay-node integration tests.
//!
//! Provides TestNode (one running node with its own download dir) and helpers
//! for loopback discovery links. Loopback has no useful broadcast address, so
//! links are pointed at each other's endpoints with unicast targets.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lanrelay_node::config::NodeConfig;
use lanrelay_node::discovery_task::DiscoveryLink;
use lanrelay_node::nic::NicInfo;
use lanrelay_node::node::RunningNode;
use lanrelay_protocol::{DeviceId, DEFAULT_PARAMS};
use lanrelay_registry::DeviceInfo;
use lanrelay_transfer::{DiskSpace, Fs2DiskSpace, TransferInfo};
use uuid::Uuid;

/// Disk that always reports the same free space.
pub struct FixedSpace(pub u64);

impl DiskSpace for FixedSpace {
    fn available(&self, _dir: &Path) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

/// Fast timings so discovery and expiry settle within a test.
pub fn test_config(name: &str, download_dir: &Path) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.node.device_name = name.to_string();
    cfg.node.device_id = Some(Uuid::new_v4());
    cfg.node.download_dir = download_dir.display().to_string();
    cfg.network.broadcast_interval_ms = 100;
    cfg.network.device_timeout_ms = 1_000;
    cfg.network.sweep_interval_ms = 100;
    cfg.transfer.chunk_size = 4096;
    cfg
}

/// Discovery link on 127.0.0.1 with an ephemeral port and no targets yet.
pub fn loopback_link(name: &str) -> DiscoveryLink {
    let nic = NicInfo::new(name, Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0));
    DiscoveryLink::bind(nic, 0, DEFAULT_PARAMS.max_datagram_bytes)
        .expect("bind loopback link")
        .with_targets(Vec::new())
}

pub fn link_addr(link: &DiscoveryLink) -> SocketAddr {
    link.endpoint.local_addr().expect("link address")
}

/// A running in-process node.
pub struct TestNode {
    pub node: RunningNode,
    pub device_id: DeviceId,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn start(name: &str, links: Vec<DiscoveryLink>) -> anyhow::Result<Self> {
        Self::start_with(name, links, |_| {}, Arc::new(Fs2DiskSpace)).await
    }

    pub async fn start_with(
        name: &str,
        links: Vec<DiscoveryLink>,
        tweak: impl FnOnce(&mut NodeConfig),
        disk: Arc<dyn DiskSpace>,
    ) -> anyhow::Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let mut cfg = test_config(name, &tempdir.path().join("downloads"));
        tweak(&mut cfg);
        let device_id = cfg.node.device_id.unwrap_or_else(Uuid::new_v4);
        cfg.node.device_id = Some(device_id);

        let listen: SocketAddr = "127.0.0.1:0".parse()?;
        let node = RunningNode::start_with_disk(&cfg, listen, links, disk).await?;
        Ok(Self {
            node,
            device_id,
            _tempdir: tempdir,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    pub fn download_dir(&self) -> std::path::PathBuf {
        self.node.ctx.transfers.settings().download_dir.clone()
    }

    pub fn scratch_dir(&self) -> &Path {
        self._tempdir.path()
    }

    /// Poll the device table until `device_id` satisfies `pred`.
    pub async fn wait_device(
        &self,
        device_id: DeviceId,
        pred: impl Fn(&DeviceInfo) -> bool,
        timeout: Duration,
    ) -> anyhow::Result<DeviceInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(d) = self.node.ctx.devices.get(&device_id).await {
                if pred(&d) {
                    return Ok(d);
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "timeout waiting for device {device_id}; table: {:?}",
                    self.node.ctx.devices.snapshot().await
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until `device_id` is gone from the table.
    pub async fn wait_device_gone(&self, device_id: DeviceId, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.node.ctx.devices.get(&device_id).await.is_some() {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for device {device_id} to expire");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    /// Poll until the transfer reaches a terminal status.
    pub async fn wait_transfer_done(
        &self,
        transfer_id: Uuid,
        timeout: Duration,
    ) -> anyhow::Result<TransferInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(t) = self.node.ctx.transfers.transfers().get(&transfer_id).await {
                if t.status.is_terminal() {
                    return Ok(t);
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "timeout waiting for transfer {transfer_id}: {:?}",
                    self.node.ctx.transfers.transfers().get(&transfer_id).await
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the transfer has moved some bytes and is still running.
    pub async fn wait_transfer_started(
        &self,
        transfer_id: Uuid,
        timeout: Duration,
    ) -> anyhow::Result<TransferInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(t) = self.node.ctx.transfers.transfers().get(&transfer_id).await {
                if t.status.is_terminal() {
                    anyhow::bail!("transfer {transfer_id} finished before it was seen running: {t:?}");
                }
                if t.progress > 0.0 {
                    return Ok(t);
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for transfer {transfer_id} to start");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Poll until any transfer shows up, returning the first one.
    pub async fn wait_any_transfer(&self, timeout: Duration) -> anyhow::Result<TransferInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(t) = self.node.ctx.transfers.transfers().snapshot().await.into_iter().next() {
                return Ok(t);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for a transfer to appear");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
    }
}
