//! Discovery background tasks -- per-NIC broadcast and receive loops.
//!
//! Every link (one NIC, one UDP endpoint) runs two tasks:
//!   1. broadcast: every interval, send our packet plus the gossip list to
//!      the link's targets (the NIC's subnet broadcast address by default)
//!   2. receive: decode each datagram and feed it to the device table with
//!      the UDP sender address, never an address claimed in the payload
//!
//! The endpoint is bound to the NIC address so sends leave on the right
//! segment. Some stacks (Linux) do not hand subnet broadcasts to a socket
//! bound to a unicast address, so a link also listens on the NIC's broadcast
//! address when the platform allows it.
//!
//! A bridge runs one link per segment, which is what lets a device on one
//! segment learn about devices on the other.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lanrelay_protocol::{DeviceId, DiscoveryPacket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::nic::NicInfo;
use crate::tables::{DeviceTable, GroupTable};
use crate::transport::TransportError;
use crate::udp::UdpEndpoint;

/// How we announce ourselves.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub device_id: DeviceId,
    pub device_name: String,
}

/// One NIC's discovery endpoint and where its broadcasts go.
pub struct DiscoveryLink {
    pub nic: NicInfo,
    pub endpoint: Arc<UdpEndpoint>,
    /// Receive-only socket on `broadcast_address:port`.
    pub broadcast_listener: Option<Arc<UdpEndpoint>>,
    pub targets: Vec<SocketAddr>,
}

impl DiscoveryLink {
    /// Bind `nic.ip:port`; broadcasts go to the NIC's subnet broadcast address.
    pub fn bind(nic: NicInfo, port: u16, max_datagram: usize) -> Result<Self, TransportError> {
        let endpoint = UdpEndpoint::bind(SocketAddrV4::new(nic.ip, port), max_datagram)?;
        let broadcast = nic.broadcast_address();
        let targets = vec![SocketAddr::V4(SocketAddrV4::new(broadcast, port))];

        // An ephemeral port could not be shared with the listener anyway
        let broadcast_listener = if port != 0 && broadcast != nic.ip {
            match UdpEndpoint::bind(SocketAddrV4::new(broadcast, port), max_datagram) {
                Ok(listener) => Some(Arc::new(listener)),
                Err(e) => {
                    tracing::debug!(
                        nic = %nic.name,
                        %broadcast,
                        error = %e,
                        "discovery: no broadcast listener, relying on the unicast socket"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            nic,
            endpoint: Arc::new(endpoint),
            broadcast_listener,
            targets,
        })
    }

    /// Replace the broadcast target list, e.g. with unicast peers.
    pub fn with_targets(mut self, targets: Vec<SocketAddr>) -> Self {
        self.targets = targets;
        self
    }
}

/// Spawn broadcast and receive loops for every link.
pub fn spawn_discovery(
    links: Vec<DiscoveryLink>,
    identity: LocalIdentity,
    devices: DeviceTable,
    groups: GroupTable,
    interval: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(links.len() * 3);
    for link in links {
        tracing::info!(
            nic = %link.nic.name,
            ip = %link.nic.ip,
            targets = ?link.targets,
            broadcast_listener = link.broadcast_listener.is_some(),
            "discovery: starting link"
        );
        if let Some(listener) = link.broadcast_listener {
            handles.push(tokio::spawn(run_receive_loop(
                listener,
                link.nic.name.clone(),
                devices.clone(),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(run_broadcast_loop(
            link.endpoint.clone(),
            link.targets,
            identity.clone(),
            devices.clone(),
            groups.clone(),
            interval,
            cancel.clone(),
        )));
        handles.push(tokio::spawn(run_receive_loop(
            link.endpoint,
            link.nic.name,
            devices.clone(),
            cancel.clone(),
        )));
    }
    handles
}

/// Our current announcement: identity, current group and gossip.
pub async fn build_packet(
    identity: &LocalIdentity,
    devices: &DeviceTable,
    groups: &GroupTable,
) -> DiscoveryPacket {
    let group = groups.current_group().await;
    let known = devices.gossip_entries().await;
    DiscoveryPacket::new(identity.device_id, identity.device_name.clone(), group).with_known(known)
}

async fn run_broadcast_loop(
    endpoint: Arc<UdpEndpoint>,
    targets: Vec<SocketAddr>,
    identity: LocalIdentity,
    devices: DeviceTable,
    groups: GroupTable,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        let packet = build_packet(&identity, &devices, &groups).await;
        match packet.to_bytes() {
            Ok(bytes) => {
                for target in &targets {
                    if let Err(e) = endpoint.send_to(&bytes, *target).await {
                        tracing::debug!(%target, error = %e, "discovery: broadcast failed");
                    }
                }
                tracing::trace!(
                    known = packet.known_devices.len(),
                    bytes = bytes.len(),
                    "discovery: broadcast sent"
                );
            }
            Err(e) => tracing::warn!(error = %e, "discovery: packet encode failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("discovery: broadcast loop stopped");
}

async fn run_receive_loop(
    endpoint: Arc<UdpEndpoint>,
    nic_name: String,
    devices: DeviceTable,
    cancel: CancellationToken,
) {
    loop {
        match endpoint.recv(&cancel).await {
            Ok(Some((bytes, from))) => {
                let Some(packet) = DiscoveryPacket::from_bytes(&bytes) else {
                    tracing::debug!(%from, len = bytes.len(), "discovery: ignoring undecodable datagram");
                    continue;
                };
                let changes = devices.process_packet(&packet, from.ip(), Utc::now()).await;
                tracing::trace!(
                    nic = %nic_name,
                    %from,
                    device = %packet.device_id,
                    known = packet.known_devices.len(),
                    changes,
                    "discovery: packet received"
                );
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(nic = %nic_name, error = %e, "discovery: receive failed");
                // Avoid a hot loop on a persistent socket error
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
    tracing::debug!(nic = %nic_name, "discovery: receive loop stopped");
}
