//! LanRelay Node -- LAN discovery, messaging, relaying and file transfer.
//!
//! Usage:
//!   lanrelay-node                              # Run with default config
//!   lanrelay-node --config path.toml run       # Run with custom config
//!   lanrelay-node nics                         # Show NICs and bridge status
//!   lanrelay-node send --to 10.0.0.5 file.bin  # Offer a file to a peer
//!   lanrelay-node say --to 10.0.0.5 "hello"    # Send one text message
//!   lanrelay-node forward --listen 0.0.0.0:9000 --to 10.0.0.5:9000

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lanrelay_node::config::NodeConfig;
use lanrelay_node::discovery_task::DiscoveryLink;
use lanrelay_node::file_transfer::send_text;
use lanrelay_node::nic::{self, NicInfo};
use lanrelay_node::node::{pump_events, NodeContext, RunningNode};
use lanrelay_node::relay::{run_forwarder, Relay};
use lanrelay_node::tables::NodeEvent;
use lanrelay_node::transport::TcpClient;
use lanrelay_node::{expand_tilde, parse_peer_addr};
use lanrelay_protocol::DEFAULT_PARAMS;
use lanrelay_registry::DeviceEvent;
use lanrelay_transfer::{Fs2DiskSpace, TransferEvent, TransferStatus};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "lanrelay-node", about = "LanRelay LAN peer-to-peer node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.lanrelay/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run {
        /// Only use the NIC with this name
        #[arg(long)]
        interface: Option<String>,
    },
    /// List active IPv4 NICs and whether this host is a bridge
    Nics,
    /// Offer a file to a peer and stream it once accepted
    Send {
        /// Peer address, ip or ip:port
        #[arg(long)]
        to: String,
        file: PathBuf,
    },
    /// Send one text message to a peer
    Say {
        /// Peer address, ip or ip:port
        #[arg(long)]
        to: String,
        text: String,
    },
    /// Relay TCP sessions from a local address to a target
    Forward {
        #[arg(long)]
        listen: SocketAddr,
        #[arg(long)]
        to: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lanrelay_node=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command.unwrap_or(Commands::Run { interface: None }) {
        Commands::Run { interface } => run(cfg, interface).await,
        Commands::Nics => show_nics(&cfg),
        Commands::Send { to, file } => send_file(cfg, &to, file).await,
        Commands::Say { to, text } => say(cfg, &to, &text).await,
        Commands::Forward { listen, to } => forward(cfg, listen, to).await,
    }
}

fn show_nics(cfg: &NodeConfig) -> anyhow::Result<()> {
    let nics = nic::select_nics(&cfg.network.interfaces, cfg.network.interface.as_deref())?;
    for n in &nics {
        println!(
            "{:<12} {:<16} mask {:<16} broadcast {}",
            n.name,
            n.ip,
            n.netmask,
            n.broadcast_address()
        );
    }
    println!("bridge: {}", nic::is_bridge(&nics));
    Ok(())
}

async fn run(mut cfg: NodeConfig, interface: Option<String>) -> anyhow::Result<()> {
    if interface.is_some() {
        cfg.network.interface = interface;
    }
    let nics = nic::select_nics(&cfg.network.interfaces, cfg.network.interface.as_deref())?;
    if nics.is_empty() {
        tracing::warn!("no usable IPv4 interface -- discovery disabled");
    } else if nic::is_bridge(&nics) {
        tracing::info!(nics = nics.len(), "node: running as bridge");
    }

    let links: Vec<DiscoveryLink> = nics
        .iter()
        .filter_map(|n: &NicInfo| {
            match DiscoveryLink::bind(n.clone(), cfg.network.discovery_port, DEFAULT_PARAMS.max_datagram_bytes) {
                Ok(link) => Some(link),
                Err(e) => {
                    tracing::warn!(nic = %n.name, error = %e, "discovery: cannot bind");
                    None
                }
            }
        })
        .collect();

    // A single chosen NIC also pins the listener to it
    let listen_ip = match (&cfg.network.interface, nics.as_slice()) {
        (Some(_), [only]) => IpAddr::V4(only.ip),
        _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let node = RunningNode::start(&cfg, SocketAddr::new(listen_ip, cfg.network.tcp_port), links).await?;

    let mut events = node.ctx.events.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "node: event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tracing::info!("all tasks spawned, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    node.shutdown().await;
    logger.abort();
    Ok(())
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::Device(DeviceEvent::Found(d)) => {
            tracing::info!(device = %d.device_id, name = %d.device_name, ip = %d.ip, hops = d.hop_count(), "event: device found")
        }
        NodeEvent::Device(DeviceEvent::Updated(d)) => {
            tracing::info!(device = %d.device_id, hops = d.hop_count(), direct = d.is_direct(), "event: device changed")
        }
        NodeEvent::Device(DeviceEvent::Lost(d)) => {
            tracing::info!(device = %d.device_id, name = %d.device_name, "event: device lost")
        }
        NodeEvent::MessageReceived { remote, text } => {
            tracing::info!(%remote, %text, "event: message")
        }
        NodeEvent::Transfer(TransferEvent::Status {
            transfer_id,
            status,
            error_message,
        }) => tracing::info!(
            transfer = %transfer_id,
            status = status.name(),
            error = error_message.as_deref().unwrap_or(""),
            "event: transfer status"
        ),
        NodeEvent::Transfer(_) | NodeEvent::Group(_) => tracing::debug!(?event, "event"),
    }
}

async fn send_file(cfg: NodeConfig, to: &str, file: PathBuf) -> anyhow::Result<()> {
    let addr = parse_peer_addr(to, cfg.network.tcp_port)?;
    let ctx = NodeContext::from_config(&cfg, Arc::new(Fs2DiskSpace)).await;
    let mut events = ctx.events.subscribe();

    let client = TcpClient::new(cfg.network.strict_framing);
    let (conn, conn_events) = client.connect(addr).await?;
    let pump = pump_events(ctx.transfers.clone(), conn_events);

    let id = ctx.transfers.offer(&conn, &file, None).await?;
    println!("offered {} as {id}, waiting for {addr}", file.display());

    let outcome = loop {
        match events.recv().await {
            Ok(NodeEvent::Transfer(TransferEvent::Status {
                transfer_id,
                status,
                error_message,
            })) if transfer_id == id && status.is_terminal() => break (status, error_message),
            Ok(NodeEvent::Transfer(TransferEvent::Progress { transfer_id, progress })) if transfer_id == id => {
                tracing::debug!(progress, "transfer: progress");
            }
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                anyhow::bail!("event channel closed before transfer finished")
            }
        }
    };

    client.disconnect().await;
    let _ = pump.await;

    match outcome {
        (TransferStatus::Completed, _) => {
            println!("sent {}", file.display());
            Ok(())
        }
        (status, reason) => anyhow::bail!(
            "transfer {}: {}",
            status.name(),
            reason.unwrap_or_default()
        ),
    }
}

async fn say(cfg: NodeConfig, to: &str, text: &str) -> anyhow::Result<()> {
    let addr = parse_peer_addr(to, cfg.network.tcp_port)?;
    let client = TcpClient::new(cfg.network.strict_framing);
    let (conn, _events) = client.connect(addr).await?;
    send_text(&conn, text).await?;
    client.disconnect().await;
    Ok(())
}

async fn forward(cfg: NodeConfig, listen: SocketAddr, to: SocketAddr) -> anyhow::Result<()> {
    let relay = Relay::new(cfg.transfer.relay_buffer_size)?;
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, target = %to, buffer = relay.buffer_size(), "relay: forwarding");

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(run_forwarder(listener, to, relay, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    let _ = handle.await;
    Ok(())
}
