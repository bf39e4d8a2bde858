//! Node assembly -- tables, listener, discovery, sweep and transfer service
//! wired together from a `NodeConfig`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use lanrelay_registry::{DeviceRegistry, GroupRegistry};
use lanrelay_transfer::{DiskSpace, Fs2DiskSpace};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::discovery_task::{spawn_discovery, DiscoveryLink, LocalIdentity};
use crate::expand_tilde;
use crate::file_transfer::{FileTransferService, TransferSettings};
use crate::sweep_task::run_sweep_loop;
use crate::tables::{DeviceTable, EventBus, GroupTable, TransferTable};
use crate::transport::{Connection, ConnectionEvent, TcpServer, TransportError, EVENT_CHANNEL_CAPACITY};

/// State shared by every loop of a running node.
#[derive(Clone)]
pub struct NodeContext {
    pub identity: LocalIdentity,
    pub events: EventBus,
    pub devices: DeviceTable,
    pub groups: GroupTable,
    pub transfers: FileTransferService,
}

impl NodeContext {
    /// Build the tables from config: identity, configured groups, current
    /// group and transfer settings.
    pub async fn from_config(cfg: &NodeConfig, disk: Arc<dyn DiskSpace>) -> Self {
        let identity = LocalIdentity {
            device_id: cfg.node.device_id.unwrap_or_else(uuid::Uuid::new_v4),
            device_name: cfg.node.device_name.clone(),
        };
        let events = EventBus::new();
        let devices = DeviceTable::new(
            DeviceRegistry::new(identity.device_id, cfg.device_timeout()),
            events.clone(),
        );

        let groups = GroupTable::new(GroupRegistry::new(), events.clone());
        for entry in &cfg.groups {
            if let Err(e) = groups.create_group(&entry.id, entry.password.as_deref()).await {
                tracing::warn!(group = %entry.id, error = %e, "groups: skipping configured group");
            }
        }
        let password = cfg
            .groups
            .iter()
            .find(|g| g.id == cfg.node.group)
            .and_then(|g| g.password.as_deref());
        if let Err(e) = groups.join(&cfg.node.group, password).await {
            tracing::warn!(group = %cfg.node.group, error = %e, "groups: staying in the public group");
        }

        let settings = TransferSettings {
            download_dir: download_dir(cfg),
            chunk_size: cfg.transfer.chunk_size,
            auto_accept: cfg.node.auto_accept,
        };
        let transfers = FileTransferService::new(
            settings,
            TransferTable::new(events.clone()),
            devices.clone(),
            events.clone(),
            disk,
        );

        Self {
            identity,
            events,
            devices,
            groups,
            transfers,
        }
    }
}

pub fn download_dir(cfg: &NodeConfig) -> PathBuf {
    expand_tilde(&cfg.node.download_dir)
}

/// Feed a connection's events to the transfer service until it closes.
pub fn pump_events(
    transfers: FileTransferService,
    mut events: mpsc::Receiver<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            transfers.handle_event(event).await;
        }
    })
}

pub struct RunningNode {
    pub ctx: NodeContext,
    server: TcpServer,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RunningNode {
    /// Bind the listener on `listen`, start discovery on `links` and the sweep.
    pub async fn start(
        cfg: &NodeConfig,
        listen: SocketAddr,
        links: Vec<DiscoveryLink>,
    ) -> anyhow::Result<Self> {
        Self::start_with_disk(cfg, listen, links, Arc::new(Fs2DiskSpace)).await
    }

    pub async fn start_with_disk(
        cfg: &NodeConfig,
        listen: SocketAddr,
        links: Vec<DiscoveryLink>,
        disk: Arc<dyn DiskSpace>,
    ) -> anyhow::Result<Self> {
        let ctx = NodeContext::from_config(cfg, disk).await;
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let server = TcpServer::bind(listen, cfg.network.strict_framing).await?;
        let server_events = server.start().await?;
        handles.push(pump_events(ctx.transfers.clone(), server_events));

        handles.extend(spawn_discovery(
            links,
            ctx.identity.clone(),
            ctx.devices.clone(),
            ctx.groups.clone(),
            cfg.broadcast_interval(),
            cancel.clone(),
        ));
        handles.push(tokio::spawn(run_sweep_loop(
            ctx.devices.clone(),
            cfg.sweep_interval(),
            cancel.clone(),
        )));

        tracing::info!(
            device = %ctx.identity.device_id,
            name = %ctx.identity.device_name,
            listen = %server.local_addr(),
            group = %ctx.groups.current_group().await,
            "node: started"
        );
        Ok(Self {
            ctx,
            server,
            cancel,
            handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Open an outbound connection whose events go to the transfer service.
    pub async fn connect(&self, addr: SocketAddr, strict_framing: bool) -> Result<Arc<Connection>, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (conn, _) = Connection::spawn(stream, strict_framing, tx, &self.cancel).await?;
        pump_events(self.ctx.transfers.clone(), rx);
        Ok(conn)
    }

    /// Stop every loop and close every connection.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.server.stop().await;
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("node: stopped");
    }
}
