//! Sweep background task -- expires devices that stopped broadcasting.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::tables::DeviceTable;

/// Run the expiry sweep until cancelled.
pub async fn run_sweep_loop(devices: DeviceTable, interval: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let expired = devices.expire(Utc::now()).await;
                if expired > 0 {
                    tracing::debug!(expired, "sweep: removed stale devices");
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("sweep: stopped");
                return;
            }
        }
    }
}
