//! JSON records carried on the wire.
//!
//! Discovery packets travel as UDP datagrams; transfer requests and responses
//! travel as the bodies of FileRequest / FileAck frames.

use serde::{Deserialize, Serialize};

use crate::{DeviceId, GroupId, PROTOCOL_VERSION};

// ============================================================================
// Discovery
// ============================================================================

/// Self-description a device broadcasts on every NIC it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    #[serde(rename = "v")]
    pub protocol_version: u32,
    #[serde(rename = "id")]
    pub device_id: DeviceId,
    #[serde(rename = "name")]
    pub device_name: String,
    #[serde(rename = "group")]
    pub group_id: GroupId,
    /// Devices the sender can reach, direct or through relays.
    #[serde(rename = "known", default)]
    pub known_devices: Vec<KnownDeviceInfo>,
}

impl DiscoveryPacket {
    pub fn new(device_id: DeviceId, device_name: impl Into<String>, group_id: impl Into<GroupId>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            device_id,
            device_name: device_name.into(),
            group_id: group_id.into(),
            known_devices: Vec::new(),
        }
    }

    pub fn with_known(mut self, known: Vec<KnownDeviceInfo>) -> Self {
        self.known_devices = known;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a datagram. Anything that is not a valid packet yields `None`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// One gossiped entry. `hop_count` is the sender's distance to the device,
/// not counting the hop from the sender to the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDeviceInfo {
    #[serde(rename = "id")]
    pub device_id: DeviceId,
    #[serde(rename = "name")]
    pub device_name: String,
    #[serde(rename = "ip")]
    pub origin_ip: String,
    #[serde(rename = "hops")]
    pub hop_count: u32,
    #[serde(rename = "group")]
    pub group_id: Option<GroupId>,
}

// ============================================================================
// File transfer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferRequest {
    #[serde(rename = "id")]
    pub transfer_id: uuid::Uuid,
    #[serde(rename = "name")]
    pub file_name: String,
    #[serde(rename = "size")]
    pub file_size: u64,
    /// Lowercase hex MD5 of the whole file.
    #[serde(rename = "md5")]
    pub md5_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferResponse {
    #[serde(rename = "id")]
    pub transfer_id: uuid::Uuid,
    pub accepted: bool,
    #[serde(rename = "savePath")]
    pub save_path: Option<String>,
    #[serde(rename = "reason")]
    pub reject_reason: Option<String>,
}

impl FileTransferResponse {
    pub fn accept(transfer_id: uuid::Uuid, save_path: impl Into<String>) -> Self {
        Self {
            transfer_id,
            accepted: true,
            save_path: Some(save_path.into()),
            reject_reason: None,
        }
    }

    pub fn reject(transfer_id: uuid::Uuid, reason: impl Into<String>) -> Self {
        Self {
            transfer_id,
            accepted: false,
            save_path: None,
            reject_reason: Some(reason.into()),
        }
    }
}
