//! Transfer book -- the table of transfers this device knows about.

use std::collections::HashMap;
use std::path::PathBuf;

use lanrelay_protocol::DeviceId;
use uuid::Uuid;

use crate::{TransferInfo, TransferStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Added(TransferInfo),
    Progress {
        transfer_id: Uuid,
        progress: f64,
    },
    Status {
        transfer_id: Uuid,
        status: TransferStatus,
        error_message: Option<String>,
    },
    Removed(Uuid),
}

#[derive(Default)]
pub struct TransferBook {
    transfers: HashMap<Uuid, TransferInfo>,
}

impl TransferBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a transfer.
    pub fn add(&mut self, info: TransferInfo) -> TransferEvent {
        tracing::debug!(
            transfer = %info.transfer_id,
            file = %info.file_name,
            size = info.file_size,
            outgoing = info.is_outgoing,
            "transfer: added"
        );
        self.transfers.insert(info.transfer_id, info.clone());
        TransferEvent::Added(info)
    }

    /// Insert a transfer whose id is not known yet. An id already in the book,
    /// finished or not, is left untouched and `None` is returned.
    pub fn insert_new(&mut self, info: TransferInfo) -> Option<TransferEvent> {
        if let Some(existing) = self.transfers.get(&info.transfer_id) {
            tracing::debug!(
                transfer = %info.transfer_id,
                status = existing.status.name(),
                "transfer: duplicate id ignored"
            );
            return None;
        }
        Some(self.add(info))
    }

    /// Record progress, clamped to [0, 1]. Ignored for unknown or finished transfers.
    pub fn update_progress(&mut self, transfer_id: &Uuid, progress: f64) -> Option<TransferEvent> {
        let info = self.transfers.get_mut(transfer_id)?;
        if info.status.is_terminal() {
            return None;
        }
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        info.progress = progress;
        Some(TransferEvent::Progress {
            transfer_id: *transfer_id,
            progress,
        })
    }

    /// Move a transfer to `status`. Terminal transfers stay where they are.
    pub fn update_status(
        &mut self,
        transfer_id: &Uuid,
        status: TransferStatus,
        error_message: Option<String>,
    ) -> Option<TransferEvent> {
        let info = self.transfers.get_mut(transfer_id)?;
        if info.status.is_terminal() {
            tracing::debug!(
                transfer = %transfer_id,
                current = info.status.name(),
                requested = status.name(),
                "transfer: ignoring status change on finished transfer"
            );
            return None;
        }
        info.status = status;
        if error_message.is_some() {
            info.error_message = error_message.clone();
        }
        tracing::info!(
            transfer = %transfer_id,
            status = status.name(),
            error = error_message.as_deref().unwrap_or(""),
            "transfer: status changed"
        );
        Some(TransferEvent::Status {
            transfer_id: *transfer_id,
            status,
            error_message,
        })
    }

    pub fn set_local_path(&mut self, transfer_id: &Uuid, path: PathBuf) -> bool {
        match self.transfers.get_mut(transfer_id) {
            Some(info) => {
                info.local_file_path = Some(path);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, transfer_id: &Uuid) -> Option<TransferEvent> {
        self.transfers.remove(transfer_id)?;
        Some(TransferEvent::Removed(*transfer_id))
    }

    pub fn get(&self, transfer_id: &Uuid) -> Option<&TransferInfo> {
        self.transfers.get(transfer_id)
    }

    /// Transfers exchanged with `device_id`, newest first.
    pub fn for_device(&self, device_id: &DeviceId) -> Vec<TransferInfo> {
        let mut transfers: Vec<TransferInfo> = self
            .transfers
            .values()
            .filter(|t| t.remote_device_id.as_ref() == Some(device_id))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        transfers
    }

    /// Owned copy of every transfer, newest first.
    pub fn snapshot(&self) -> Vec<TransferInfo> {
        let mut transfers: Vec<TransferInfo> = self.transfers.values().cloned().collect();
        transfers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        transfers
    }
}
