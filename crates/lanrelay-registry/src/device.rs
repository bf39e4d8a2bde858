//! Device registry -- one best route per device, reconciled from discovery.
//!
//! Direct sightings always win. Among relayed routes the lower hop count
//! wins and ties keep the existing entry. Entries not refreshed within the
//! timeout are swept out.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use lanrelay_protocol::{DeviceId, DiscoveryPacket, GroupId, KnownDeviceInfo, PROTOCOL_VERSION};
use serde::Serialize;

/// How a device is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    /// Heard its broadcast ourselves.
    Direct,
    /// Learned from `via`'s gossip. `hops` is at least 1.
    Relayed { via: DeviceId, hops: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub device_name: String,
    /// Where to send traffic: the device itself when direct, the relay otherwise.
    pub ip: IpAddr,
    pub group_id: Option<GroupId>,
    pub last_seen: DateTime<Utc>,
    pub route: Route,
}

impl DeviceInfo {
    pub fn direct(
        device_id: DeviceId,
        device_name: impl Into<String>,
        ip: IpAddr,
        group_id: Option<GroupId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            ip,
            group_id,
            last_seen: now,
            route: Route::Direct,
        }
    }

    pub fn relayed(
        device_id: DeviceId,
        device_name: impl Into<String>,
        relay_ip: IpAddr,
        group_id: Option<GroupId>,
        via: DeviceId,
        hops: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            ip: relay_ip,
            group_id,
            last_seen: now,
            route: Route::Relayed {
                via,
                hops: hops.max(1),
            },
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.route, Route::Direct)
    }

    pub fn relay_device_id(&self) -> Option<DeviceId> {
        match self.route {
            Route::Direct => None,
            Route::Relayed { via, .. } => Some(via),
        }
    }

    pub fn hop_count(&self) -> u32 {
        match self.route {
            Route::Direct => 0,
            Route::Relayed { hops, .. } => hops,
        }
    }

    pub fn in_group(&self, group_id: &str) -> bool {
        self.group_id.as_deref() == Some(group_id)
    }

    /// Whether anything a user would see differs, ignoring `last_seen`.
    fn same_details(&self, other: &DeviceInfo) -> bool {
        self.device_name == other.device_name
            && self.ip == other.ip
            && self.group_id == other.group_id
            && self.route == other.route
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// First sighting of a device id.
    Found(DeviceInfo),
    /// Route or details of a known device changed.
    Updated(DeviceInfo),
    /// Device expired or was removed.
    Lost(DeviceInfo),
}

impl DeviceEvent {
    pub fn device(&self) -> &DeviceInfo {
        match self {
            DeviceEvent::Found(d) | DeviceEvent::Updated(d) | DeviceEvent::Lost(d) => d,
        }
    }
}

pub struct DeviceRegistry {
    local_id: DeviceId,
    timeout: Duration,
    devices: HashMap<DeviceId, DeviceInfo>,
}

impl DeviceRegistry {
    pub fn new(local_id: DeviceId, timeout: Duration) -> Self {
        Self {
            local_id,
            timeout,
            devices: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> DeviceId {
        self.local_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Reconcile one candidate route against the table.
    pub fn observe(&mut self, candidate: DeviceInfo) -> Option<DeviceEvent> {
        if candidate.device_id == self.local_id {
            return None;
        }

        let Some(existing) = self.devices.get(&candidate.device_id) else {
            tracing::info!(
                device = %candidate.device_id,
                name = %candidate.device_name,
                hops = candidate.hop_count(),
                "registry: device found"
            );
            self.devices.insert(candidate.device_id, candidate.clone());
            return Some(DeviceEvent::Found(candidate));
        };

        let replace = match (existing.route, candidate.route) {
            (_, Route::Direct) => true,
            (Route::Direct, Route::Relayed { .. }) => false,
            (
                Route::Relayed {
                    via: old_via,
                    hops: old_hops,
                },
                Route::Relayed { via, hops },
            ) => hops < old_hops || (hops == old_hops && via == old_via),
        };
        if !replace {
            return None;
        }

        let changed = !existing.same_details(&candidate);
        if changed {
            tracing::debug!(
                device = %candidate.device_id,
                from_hops = existing.hop_count(),
                to_hops = candidate.hop_count(),
                direct = candidate.is_direct(),
                "registry: route updated"
            );
        }
        self.devices.insert(candidate.device_id, candidate.clone());
        changed.then_some(DeviceEvent::Updated(candidate))
    }

    /// Apply a discovery packet received from `sender_ip`.
    ///
    /// The sender becomes a direct entry at the transport address; each gossiped
    /// entry becomes a relayed candidate one hop further away, reached via the sender.
    pub fn process_packet(
        &mut self,
        packet: &DiscoveryPacket,
        sender_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Vec<DeviceEvent> {
        let mut events = Vec::new();

        if packet.protocol_version != PROTOCOL_VERSION {
            tracing::trace!(
                version = packet.protocol_version,
                sender = %sender_ip,
                "registry: ignoring packet with unsupported version"
            );
            return events;
        }
        if packet.device_id == self.local_id {
            return events;
        }

        let sender = DeviceInfo::direct(
            packet.device_id,
            packet.device_name.clone(),
            sender_ip,
            Some(packet.group_id.clone()),
            now,
        );
        events.extend(self.observe(sender));

        for known in &packet.known_devices {
            if known.device_id == self.local_id || known.device_id == packet.device_id {
                continue;
            }
            let candidate = DeviceInfo::relayed(
                known.device_id,
                known.device_name.clone(),
                sender_ip,
                known.group_id.clone(),
                packet.device_id,
                known.hop_count.saturating_add(1),
                now,
            );
            events.extend(self.observe(candidate));
        }

        events
    }

    /// Drop every entry last seen more than the timeout before `now`.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<DeviceEvent> {
        let expired: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| now - d.last_seen > self.timeout)
            .map(|d| d.device_id)
            .collect();

        expired.into_iter().filter_map(|id| self.remove(&id)).collect()
    }

    pub fn remove(&mut self, device_id: &DeviceId) -> Option<DeviceEvent> {
        let removed = self.devices.remove(device_id)?;
        tracing::info!(device = %removed.device_id, name = %removed.device_name, "registry: device lost");
        Some(DeviceEvent::Lost(removed))
    }

    pub fn clear(&mut self) -> Vec<DeviceEvent> {
        let ids: Vec<DeviceId> = self.devices.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.remove(&id)).collect()
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceInfo> {
        self.devices.get(device_id)
    }

    /// Owned copies of the devices in `group_id`, sorted by name.
    pub fn devices_in_group(&self, group_id: &str) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .devices
            .values()
            .filter(|d| d.in_group(group_id))
            .cloned()
            .collect();
        sort_for_display(&mut devices);
        devices
    }

    /// Owned copy of the whole table, sorted by name.
    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self.devices.values().cloned().collect();
        sort_for_display(&mut devices);
        devices
    }

    /// Entries to gossip in our own discovery packet.
    ///
    /// Each entry is advertised one hop further than we hold it, so a
    /// receiver that adds its own hop ends up with our hop count plus two.
    pub fn gossip_entries(&self) -> Vec<KnownDeviceInfo> {
        self.snapshot()
            .into_iter()
            .map(|d| KnownDeviceInfo {
                device_id: d.device_id,
                device_name: d.device_name.clone(),
                origin_ip: d.ip.to_string(),
                hop_count: d.hop_count().saturating_add(1),
                group_id: d.group_id.clone(),
            })
            .collect()
    }
}

fn sort_for_display(devices: &mut [DeviceInfo]) {
    devices.sort_by(|a, b| {
        a.device_name
            .cmp(&b.device_name)
            .then(a.device_id.cmp(&b.device_id))
    });
}
