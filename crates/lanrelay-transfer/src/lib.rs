//! LanRelay Transfer -- file transfer state, request creation, verification.
//!
//! Per transfer: Pending -> InProgress -> {Completed | Failed | Cancelled | Rejected}.
//! Status only moves through explicit updates; progress never implies status.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use lanrelay_protocol::DeviceId;
use serde::Serialize;

pub mod book;
pub mod files;

pub use book::{TransferBook, TransferEvent};
pub use files::{
    check_disk_space, save_path_for, verify_file, DiskSpace, Fs2DiskSpace, IncomingFile,
    OutgoingFile,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
    Rejected,
}

impl TransferStatus {
    /// No further transitions out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Cancelled
                | TransferStatus::Failed
                | TransferStatus::Rejected
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::InProgress => "in-progress",
            TransferStatus::Completed => "completed",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Failed => "failed",
            TransferStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferInfo {
    pub transfer_id: uuid::Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub is_outgoing: bool,
    pub status: TransferStatus,
    /// Fraction in [0, 1].
    pub progress: f64,
    pub remote_device_id: Option<DeviceId>,
    pub local_file_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferInfo {
    pub fn outgoing(
        request: &lanrelay_protocol::FileTransferRequest,
        local_file_path: PathBuf,
        remote_device_id: Option<DeviceId>,
    ) -> Self {
        Self::pending(request, true, Some(local_file_path), remote_device_id)
    }

    pub fn incoming(
        request: &lanrelay_protocol::FileTransferRequest,
        remote_device_id: Option<DeviceId>,
    ) -> Self {
        Self::pending(request, false, None, remote_device_id)
    }

    fn pending(
        request: &lanrelay_protocol::FileTransferRequest,
        is_outgoing: bool,
        local_file_path: Option<PathBuf>,
        remote_device_id: Option<DeviceId>,
    ) -> Self {
        Self {
            transfer_id: request.transfer_id,
            file_name: request.file_name.clone(),
            file_size: request.file_size,
            is_outgoing,
            status: TransferStatus::Pending,
            progress: 0.0,
            remote_device_id,
            local_file_path,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// Fraction of `total` covered by `done`, clamped to [0, 1]. An empty file is
/// complete as soon as it starts.
pub fn progress_fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0)
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("received {received} bytes, more than the announced {expected}")]
    Overrun { expected: u64, received: u64 },
    #[error("crypto error: {0}")]
    Crypto(#[from] lanrelay_crypto::CryptoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
