//! Shared tables -- one lock per state machine, events fanned out after unlock.
//!
//! The device, group and transfer tables are mutated from the discovery loop,
//! the sweep loop, connection handlers and direct API calls. Each wraps its
//! pure state machine in a single `tokio::sync::Mutex`; the events a mutation
//! raises are published on the node's broadcast channel once the lock is
//! dropped. Queries return owned copies.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lanrelay_protocol::{DeviceId, DiscoveryPacket, GroupId, KnownDeviceInfo};
use lanrelay_registry::{
    DeviceEvent, DeviceInfo, DeviceRegistry, GroupEvent, GroupInfo, GroupRegistry, RegistryError,
};
use lanrelay_transfer::{TransferBook, TransferEvent, TransferInfo, TransferStatus};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// Broadcast capacity. Slow subscribers see `Lagged` rather than blocking writers.
pub const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    Device(DeviceEvent),
    Group(GroupEvent),
    Transfer(TransferEvent),
    MessageReceived { remote: SocketAddr, text: String },
}

/// Cloneable publish handle shared by all tables.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    fn publish_all<E>(&self, events: impl IntoIterator<Item = E>, wrap: impl Fn(E) -> NodeEvent) {
        for event in events {
            self.publish(wrap(event));
        }
    }
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Clone)]
pub struct DeviceTable {
    inner: Arc<Mutex<DeviceRegistry>>,
    events: EventBus,
}

impl DeviceTable {
    pub fn new(registry: DeviceRegistry, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
            events,
        }
    }

    pub async fn local_id(&self) -> DeviceId {
        self.inner.lock().await.local_id()
    }

    pub async fn process_packet(
        &self,
        packet: &DiscoveryPacket,
        sender_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> usize {
        let events = self.inner.lock().await.process_packet(packet, sender_ip, now);
        let count = events.len();
        self.events.publish_all(events, NodeEvent::Device);
        count
    }

    pub async fn observe(&self, candidate: DeviceInfo) {
        let event = self.inner.lock().await.observe(candidate);
        self.events.publish_all(event, NodeEvent::Device);
    }

    /// Sweep stale entries. Returns how many were removed.
    pub async fn expire(&self, now: DateTime<Utc>) -> usize {
        let events = self.inner.lock().await.expire(now);
        let count = events.len();
        self.events.publish_all(events, NodeEvent::Device);
        count
    }

    pub async fn remove(&self, device_id: &DeviceId) -> bool {
        let event = self.inner.lock().await.remove(device_id);
        let removed = event.is_some();
        self.events.publish_all(event, NodeEvent::Device);
        removed
    }

    pub async fn clear(&self) {
        let events = self.inner.lock().await.clear();
        self.events.publish_all(events, NodeEvent::Device);
    }

    pub async fn get(&self, device_id: &DeviceId) -> Option<DeviceInfo> {
        self.inner.lock().await.get(device_id).cloned()
    }

    pub async fn devices_in_group(&self, group_id: &str) -> Vec<DeviceInfo> {
        self.inner.lock().await.devices_in_group(group_id)
    }

    pub async fn snapshot(&self) -> Vec<DeviceInfo> {
        self.inner.lock().await.snapshot()
    }

    pub async fn gossip_entries(&self) -> Vec<KnownDeviceInfo> {
        self.inner.lock().await.gossip_entries()
    }

    /// Device whose route goes through `ip`, preferring a direct entry.
    pub async fn find_by_ip(&self, ip: IpAddr) -> Option<DeviceInfo> {
        let devices = self.inner.lock().await.snapshot();
        let mut matching = devices.into_iter().filter(|d| d.ip == ip);
        let first = matching.next()?;
        if first.is_direct() {
            return Some(first);
        }
        Some(matching.find(|d| d.is_direct()).unwrap_or(first))
    }
}

// ============================================================================
// Groups
// ============================================================================

#[derive(Clone)]
pub struct GroupTable {
    inner: Arc<Mutex<GroupRegistry>>,
    events: EventBus,
}

impl GroupTable {
    pub fn new(registry: GroupRegistry, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
            events,
        }
    }

    pub async fn create_group(
        &self,
        group_id: &str,
        password: Option<&str>,
    ) -> Result<GroupInfo, RegistryError> {
        let (group, event) = self.inner.lock().await.create_group(group_id, password)?;
        self.events.publish(NodeEvent::Group(event));
        Ok(group)
    }

    pub async fn validate(&self, group_id: &str, password: Option<&str>) -> bool {
        self.inner.lock().await.validate(group_id, password)
    }

    /// Returns whether the current group changed.
    pub async fn join(&self, group_id: &str, password: Option<&str>) -> Result<bool, RegistryError> {
        let event = self.inner.lock().await.join(group_id, password)?;
        let changed = event.is_some();
        self.events.publish_all(event, NodeEvent::Group);
        Ok(changed)
    }

    pub async fn current_group(&self) -> GroupId {
        self.inner.lock().await.current_group().to_string()
    }

    pub async fn get_group(&self, group_id: &str) -> Option<GroupInfo> {
        self.inner.lock().await.get_group(group_id).cloned()
    }

    pub async fn group_exists(&self, group_id: &str) -> bool {
        self.inner.lock().await.group_exists(group_id)
    }

    pub async fn groups(&self) -> Vec<GroupInfo> {
        self.inner.lock().await.groups()
    }
}

/// Devices that share our current group.
pub async fn devices_in_current_group(devices: &DeviceTable, groups: &GroupTable) -> Vec<DeviceInfo> {
    let current = groups.current_group().await;
    devices.devices_in_group(&current).await
}

// ============================================================================
// Transfers
// ============================================================================

#[derive(Clone)]
pub struct TransferTable {
    inner: Arc<Mutex<TransferBook>>,
    events: EventBus,
}

impl TransferTable {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransferBook::new())),
            events,
        }
    }

    pub async fn add(&self, info: TransferInfo) {
        let event = self.inner.lock().await.add(info);
        self.events.publish(NodeEvent::Transfer(event));
    }

    /// Add unless the id is already known. Returns whether it was added.
    pub async fn add_new(&self, info: TransferInfo) -> bool {
        let event = self.inner.lock().await.insert_new(info);
        let added = event.is_some();
        self.events.publish_all(event, NodeEvent::Transfer);
        added
    }

    pub async fn update_progress(&self, transfer_id: &Uuid, progress: f64) {
        let event = self.inner.lock().await.update_progress(transfer_id, progress);
        self.events.publish_all(event, NodeEvent::Transfer);
    }

    /// Returns whether the status changed. Finished transfers never change.
    pub async fn update_status(
        &self,
        transfer_id: &Uuid,
        status: TransferStatus,
        error_message: Option<String>,
    ) -> bool {
        let event = self
            .inner
            .lock()
            .await
            .update_status(transfer_id, status, error_message);
        let changed = event.is_some();
        self.events.publish_all(event, NodeEvent::Transfer);
        changed
    }

    pub async fn set_local_path(&self, transfer_id: &Uuid, path: PathBuf) -> bool {
        self.inner.lock().await.set_local_path(transfer_id, path)
    }

    pub async fn remove(&self, transfer_id: &Uuid) -> bool {
        let event = self.inner.lock().await.remove(transfer_id);
        let removed = event.is_some();
        self.events.publish_all(event, NodeEvent::Transfer);
        removed
    }

    pub async fn get(&self, transfer_id: &Uuid) -> Option<TransferInfo> {
        self.inner.lock().await.get(transfer_id).cloned()
    }

    pub async fn for_device(&self, device_id: &DeviceId) -> Vec<TransferInfo> {
        self.inner.lock().await.for_device(device_id)
    }

    pub async fn snapshot(&self) -> Vec<TransferInfo> {
        self.inner.lock().await.snapshot()
    }
}
