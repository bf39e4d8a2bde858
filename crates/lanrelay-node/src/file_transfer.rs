//! File transfer service -- drives transfers over TCP connections.
//!
//! Sender: `offer` hashes the file, records a Pending transfer and sends a
//! FileRequest. On an accepting FileAck the file is streamed as FileData
//! frames from a spawned task; a rejecting FileAck marks it Rejected.
//!
//! Receiver: a FileRequest records a Pending transfer. `accept` checks free
//! space, opens the save path and answers with FileAck; data frames arriving
//! on that connection are written to the file, and once the announced size is
//! reached the file is re-hashed and the transfer ends Completed or Failed.
//! One incoming transfer per connection at a time.
//!
//! Cancelling: FileData frames carry no transfer id, so either side stops a
//! running transfer with a refusing FileAck for its id. The sender always
//! answers a refusal for its own transfer with a refusal of its own, sent
//! after its last data frame; a receiver that cancelled discards data on
//! that connection until that answer arrives.
//!
//! Text frames become `NodeEvent::MessageReceived`; heartbeats are ignored.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use lanrelay_protocol::{
    DeviceId, FileTransferRequest, FileTransferResponse, Frame, FrameKind, ProtocolError,
};
use lanrelay_transfer::{
    check_disk_space, progress_fraction, save_path_for, DiskSpace, IncomingFile, OutgoingFile,
    TransferError, TransferInfo, TransferStatus,
};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::tables::{DeviceTable, EventBus, NodeEvent, TransferTable};
use crate::transport::{Connection, ConnectionEvent, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum FileTransferError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(Uuid),
    #[error("transfer {0} is not awaiting a decision")]
    NotPending(Uuid),
    #[error("connection {0} already has a transfer in progress")]
    ReceiverBusy(SocketAddr),
    #[error("source ended after {sent} of {expected} bytes")]
    Truncated { expected: u64, sent: u64 },
    #[error("transfer cancelled")]
    Cancelled,
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub download_dir: PathBuf,
    pub chunk_size: usize,
    pub auto_accept: bool,
}

const CANCELLED: &str = "cancelled";

struct PendingIncoming {
    request: FileTransferRequest,
    conn: Arc<Connection>,
}

struct ActiveIncoming {
    file: IncomingFile,
    conn: Arc<Connection>,
}

struct OutgoingTransfer {
    conn: Arc<Connection>,
    /// Taken when streaming starts.
    file: Option<OutgoingFile>,
    cancel: CancellationToken,
    /// Fired by the streaming task after its last frame.
    stopped: CancellationToken,
}

impl OutgoingTransfer {
    fn is_streaming(&self) -> bool {
        self.file.is_none()
    }
}

struct ServiceInner {
    settings: TransferSettings,
    transfers: TransferTable,
    devices: DeviceTable,
    events: EventBus,
    disk: Arc<dyn DiskSpace>,
    pending: Mutex<HashMap<Uuid, PendingIncoming>>,
    receiving: Mutex<HashMap<SocketAddr, ActiveIncoming>>,
    /// Connections whose data is discarded until the sender confirms the
    /// cancelled transfer has stopped.
    draining: Mutex<HashMap<SocketAddr, Uuid>>,
    outgoing: Mutex<HashMap<Uuid, OutgoingTransfer>>,
}

#[derive(Clone)]
pub struct FileTransferService {
    inner: Arc<ServiceInner>,
}

impl FileTransferService {
    pub fn new(
        settings: TransferSettings,
        transfers: TransferTable,
        devices: DeviceTable,
        events: EventBus,
        disk: Arc<dyn DiskSpace>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                settings,
                transfers,
                devices,
                events,
                disk,
                pending: Mutex::new(HashMap::new()),
                receiving: Mutex::new(HashMap::new()),
                draining: Mutex::new(HashMap::new()),
                outgoing: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn transfers(&self) -> &TransferTable {
        &self.inner.transfers
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Announce `path` to the peer on `conn`. Returns the new transfer id.
    pub async fn offer(
        &self,
        conn: &Arc<Connection>,
        path: &Path,
        remote: Option<DeviceId>,
    ) -> Result<Uuid, FileTransferError> {
        let source = path.to_path_buf();
        let outgoing = tokio::task::spawn_blocking(move || OutgoingFile::open(&source))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;

        let request = outgoing.request.clone();
        let id = request.transfer_id;
        let frame = Frame::file_request(&request)?;

        self.inner
            .transfers
            .add(TransferInfo::outgoing(&request, outgoing.path.clone(), remote))
            .await;
        self.inner.outgoing.lock().await.insert(
            id,
            OutgoingTransfer {
                conn: conn.clone(),
                file: Some(outgoing),
                cancel: CancellationToken::new(),
                stopped: CancellationToken::new(),
            },
        );

        if let Err(e) = conn.send(frame).await {
            self.inner.outgoing.lock().await.remove(&id);
            self.inner
                .transfers
                .update_status(&id, TransferStatus::Failed, Some(e.to_string()))
                .await;
            return Err(e.into());
        }

        tracing::info!(
            transfer = %id,
            file = %request.file_name,
            size = request.file_size,
            remote = %conn.remote_addr(),
            "transfer: offered"
        );
        Ok(id)
    }

    async fn on_response(
        &self,
        conn: &Arc<Connection>,
        response: FileTransferResponse,
    ) -> Result<(), FileTransferError> {
        let id = response.transfer_id;
        let mut outgoing = self.inner.outgoing.lock().await;

        if !response.accepted {
            let entry = outgoing.remove(&id);
            drop(outgoing);
            let reason = response
                .reject_reason
                .unwrap_or_else(|| "rejected by receiver".to_string());
            match entry {
                None => self.on_refusal(conn, id).await,
                Some(entry) if !entry.is_streaming() => {
                    self.inner
                        .transfers
                        .update_status(&id, TransferStatus::Rejected, Some(reason))
                        .await;
                }
                Some(entry) => {
                    tracing::info!(transfer = %id, %reason, "transfer: receiver stopped the transfer");
                    self.stop_stream(&entry).await;
                    self.inner
                        .transfers
                        .update_status(
                            &id,
                            TransferStatus::Cancelled,
                            Some("cancelled by receiver".to_string()),
                        )
                        .await;
                    send_cancel_notice(&entry.conn, &id).await;
                }
            }
            return Ok(());
        }

        let Some(entry) = outgoing.get_mut(&id) else {
            tracing::debug!(transfer = %id, "transfer: response for unknown transfer");
            return Ok(());
        };
        // A repeated accept finds the file already taken
        let Some(file) = entry.file.take() else {
            return Ok(());
        };
        let conn = entry.conn.clone();
        let cancel = entry.cancel.clone();
        let stopped = entry.stopped.clone();
        drop(outgoing);

        tracing::debug!(
            transfer = %id,
            save_path = response.save_path.as_deref().unwrap_or(""),
            "transfer: accepted by receiver"
        );
        self.inner
            .transfers
            .update_status(&id, TransferStatus::InProgress, None)
            .await;

        let service = self.clone();
        tokio::spawn(async move {
            service.stream_file(id, conn, file, cancel).await;
            stopped.cancel();
        });
        Ok(())
    }

    /// A refusal for a transfer we are not streaming. It either stops an
    /// incoming transfer, ends a drain we started, or concerns one of our
    /// own offers that already finished here.
    async fn on_refusal(&self, conn: &Arc<Connection>, id: Uuid) {
        let remote = conn.remote_addr();
        {
            let mut draining = self.inner.draining.lock().await;
            if draining.get(&remote) == Some(&id) {
                draining.remove(&remote);
                tracing::debug!(transfer = %id, %remote, "transfer: sender stopped, drain finished");
                return;
            }
        }

        let active = {
            let mut receiving = self.inner.receiving.lock().await;
            if receiving
                .get(&remote)
                .is_some_and(|a| a.file.transfer_id() == id)
            {
                receiving.remove(&remote)
            } else {
                None
            }
        };
        if let Some(active) = active {
            active.file.abort().await;
            self.mark_cancelled(&id, "cancelled by sender").await;
            return;
        }

        let pending = {
            let mut pending = self.inner.pending.lock().await;
            if pending
                .get(&id)
                .is_some_and(|p| p.conn.remote_addr() == remote)
            {
                pending.remove(&id)
            } else {
                None
            }
        };
        if pending.is_some() {
            self.mark_cancelled(&id, "cancelled by sender").await;
            return;
        }

        // Our stream is already over; confirm so the receiver stops discarding
        let ours = self
            .inner
            .transfers
            .get(&id)
            .await
            .is_some_and(|t| t.is_outgoing);
        if ours {
            send_cancel_notice(conn, &id).await;
        } else {
            tracing::debug!(transfer = %id, "transfer: refusal for unknown transfer");
        }
    }

    /// Stop the streaming task of `entry`, if any, and wait until it has
    /// sent its last frame.
    async fn stop_stream(&self, entry: &OutgoingTransfer) {
        entry.cancel.cancel();
        if entry.is_streaming() {
            entry.stopped.cancelled().await;
        }
    }

    async fn mark_cancelled(&self, transfer_id: &Uuid, reason: &str) {
        self.inner
            .transfers
            .update_status(transfer_id, TransferStatus::Cancelled, Some(reason.to_string()))
            .await;
    }

    async fn stream_file(
        &self,
        id: Uuid,
        conn: Arc<Connection>,
        file: OutgoingFile,
        cancel: CancellationToken,
    ) {
        let result = self.send_chunks(&id, &conn, file, &cancel).await;
        self.inner.outgoing.lock().await.remove(&id);

        match result {
            Ok(sent) => {
                self.inner.transfers.update_progress(&id, 1.0).await;
                self.inner
                    .transfers
                    .update_status(&id, TransferStatus::Completed, None)
                    .await;
                tracing::info!(transfer = %id, bytes = sent, "transfer: sent");
            }
            // Whoever cancelled records the status
            Err(FileTransferError::Cancelled) => {}
            Err(e) => {
                self.inner
                    .transfers
                    .update_status(&id, TransferStatus::Failed, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn send_chunks(
        &self,
        id: &Uuid,
        conn: &Connection,
        file: OutgoingFile,
        cancel: &CancellationToken,
    ) -> Result<u64, FileTransferError> {
        let size = file.request.file_size;
        let mut reader = tokio::fs::File::from_std(file.file).take(size);
        let mut buf = vec![0u8; self.inner.settings.chunk_size.max(1)];
        let mut sent = 0u64;

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FileTransferError::Cancelled),
                read = reader.read(&mut buf) => read.map_err(TransferError::from)?,
            };
            if n == 0 {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FileTransferError::Cancelled),
                result = conn.send(Frame::file_data(Bytes::copy_from_slice(&buf[..n]))) => result?,
            }
            sent += n as u64;
            self.inner
                .transfers
                .update_progress(id, progress_fraction(sent, size))
                .await;
        }

        if sent < size {
            return Err(FileTransferError::Truncated {
                expected: size,
                sent,
            });
        }
        Ok(sent)
    }

    // ========================================================================
    // Receiving
    // ========================================================================

    async fn on_request(
        &self,
        conn: &Arc<Connection>,
        request: FileTransferRequest,
    ) -> Result<(), FileTransferError> {
        let id = request.transfer_id;
        let remote = self
            .inner
            .devices
            .find_by_ip(conn.remote_addr().ip())
            .await
            .map(|d| d.device_id);

        tracing::info!(
            transfer = %id,
            file = %request.file_name,
            size = request.file_size,
            remote = %conn.remote_addr(),
            "transfer: incoming request"
        );
        if !self
            .inner
            .transfers
            .add_new(TransferInfo::incoming(&request, remote))
            .await
        {
            tracing::debug!(transfer = %id, "transfer: repeated request ignored");
            return Ok(());
        }
        self.inner.pending.lock().await.insert(
            id,
            PendingIncoming {
                request,
                conn: conn.clone(),
            },
        );

        if self.inner.settings.auto_accept {
            if let Err(e) = self.accept(&id).await {
                tracing::info!(transfer = %id, error = %e, "transfer: auto-accept refused");
            }
        }
        Ok(())
    }

    /// Accept a pending incoming transfer. Refuses it instead, and tells the
    /// sender why, when there is no room or the name is unusable.
    pub async fn accept(&self, transfer_id: &Uuid) -> Result<PathBuf, FileTransferError> {
        let PendingIncoming { request, conn } = self
            .inner
            .pending
            .lock()
            .await
            .remove(transfer_id)
            .ok_or(FileTransferError::NotPending(*transfer_id))?;
        let dir = &self.inner.settings.download_dir;

        if let Err(e) = check_disk_space(self.inner.disk.as_ref(), dir, request.file_size) {
            self.refuse(&conn, transfer_id, e.to_string()).await;
            return Err(e.into());
        }
        let path = match save_path_for(dir, &request.file_name) {
            Ok(path) => path,
            Err(e) => {
                self.refuse(&conn, transfer_id, e.to_string()).await;
                return Err(e.into());
            }
        };

        let remote = conn.remote_addr();
        let mut receiving = self.inner.receiving.lock().await;
        if receiving.contains_key(&remote) {
            drop(receiving);
            self.refuse(&conn, transfer_id, "receiver busy".to_string()).await;
            return Err(FileTransferError::ReceiverBusy(remote));
        }
        let file = match IncomingFile::create(&request, path.clone()).await {
            Ok(file) => file,
            Err(e) => {
                drop(receiving);
                self.refuse(&conn, transfer_id, e.to_string()).await;
                return Err(e.into());
            }
        };
        // An empty file is complete before any data arrives
        let already_complete = if file.is_complete() {
            Some(file)
        } else {
            receiving.insert(
                remote,
                ActiveIncoming {
                    file,
                    conn: conn.clone(),
                },
            );
            None
        };
        drop(receiving);

        self.inner
            .transfers
            .set_local_path(transfer_id, path.clone())
            .await;
        self.inner
            .transfers
            .update_status(transfer_id, TransferStatus::InProgress, None)
            .await;

        let response = FileTransferResponse::accept(*transfer_id, path.display().to_string());
        if let Err(e) = conn.send(Frame::file_response(&response)?).await {
            if let Some(active) = self.inner.receiving.lock().await.remove(&remote) {
                active.file.abort().await;
            }
            self.inner
                .transfers
                .update_status(transfer_id, TransferStatus::Failed, Some(e.to_string()))
                .await;
            return Err(e.into());
        }
        tracing::info!(transfer = %transfer_id, path = %path.display(), "transfer: accepted");

        if let Some(file) = already_complete {
            self.finish_incoming(file).await;
        }
        Ok(path)
    }

    /// Decline a pending incoming transfer.
    pub async fn reject(&self, transfer_id: &Uuid, reason: &str) -> Result<(), FileTransferError> {
        let pending = self
            .inner
            .pending
            .lock()
            .await
            .remove(transfer_id)
            .ok_or(FileTransferError::NotPending(*transfer_id))?;
        self.refuse(&pending.conn, transfer_id, reason.to_string()).await;
        Ok(())
    }

    async fn refuse(&self, conn: &Connection, transfer_id: &Uuid, reason: String) {
        let response = FileTransferResponse::reject(*transfer_id, reason.clone());
        match Frame::file_response(&response) {
            Ok(frame) => {
                if let Err(e) = conn.send(frame).await {
                    tracing::debug!(transfer = %transfer_id, error = %e, "transfer: reject not delivered");
                }
            }
            Err(e) => tracing::warn!(transfer = %transfer_id, error = %e, "transfer: reject encode failed"),
        }
        self.inner
            .transfers
            .update_status(transfer_id, TransferStatus::Rejected, Some(reason))
            .await;
    }

    async fn on_data(&self, conn: &Connection, chunk: &[u8]) -> Result<(), FileTransferError> {
        let remote = conn.remote_addr();
        if self.inner.draining.lock().await.contains_key(&remote) {
            tracing::trace!(%remote, len = chunk.len(), "transfer: discarding data of a cancelled transfer");
            return Ok(());
        }
        let mut receiving = self.inner.receiving.lock().await;
        let Some(active) = receiving.get_mut(&remote) else {
            tracing::debug!(%remote, len = chunk.len(), "transfer: data with no active transfer");
            return Ok(());
        };
        let file = &mut active.file;
        let id = file.transfer_id();

        match file.write_chunk(chunk).await {
            Ok(progress) => {
                let finished = if file.is_complete() {
                    receiving.remove(&remote).map(|a| a.file)
                } else {
                    None
                };
                drop(receiving);
                self.inner.transfers.update_progress(&id, progress).await;
                if let Some(file) = finished {
                    self.finish_incoming(file).await;
                }
                Ok(())
            }
            Err(e) => {
                let active = receiving.remove(&remote);
                drop(receiving);
                if let Some(active) = active {
                    active.file.abort().await;
                }
                self.inner
                    .transfers
                    .update_status(&id, TransferStatus::Failed, Some(e.to_string()))
                    .await;
                Err(e.into())
            }
        }
    }

    async fn finish_incoming(&self, file: IncomingFile) {
        let id = file.transfer_id();
        let path = file.path().to_path_buf();
        match file.finish().await {
            Ok(path) => {
                self.inner.transfers.update_progress(&id, 1.0).await;
                self.inner
                    .transfers
                    .update_status(&id, TransferStatus::Completed, None)
                    .await;
                tracing::info!(transfer = %id, path = %path.display(), "transfer: received and verified");
            }
            Err(e) => {
                tracing::warn!(transfer = %id, error = %e, "transfer: verification failed");
                if matches!(e, TransferError::HashMismatch { .. }) {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                self.inner
                    .transfers
                    .update_status(&id, TransferStatus::Failed, Some(e.to_string()))
                    .await;
            }
        }
    }

    // ========================================================================
    // Either side
    // ========================================================================

    /// Stop a transfer and tell the peer. Finished transfers are left alone.
    pub async fn cancel(&self, transfer_id: &Uuid) -> Result<(), FileTransferError> {
        let info = self
            .inner
            .transfers
            .get(transfer_id)
            .await
            .ok_or(FileTransferError::UnknownTransfer(*transfer_id))?;
        if info.status.is_terminal() {
            return Ok(());
        }

        let outgoing = self.inner.outgoing.lock().await.remove(transfer_id);
        if let Some(entry) = outgoing {
            self.stop_stream(&entry).await;
            send_cancel_notice(&entry.conn, transfer_id).await;
        }

        let pending = self.inner.pending.lock().await.remove(transfer_id);
        if let Some(pending) = pending {
            send_cancel_notice(&pending.conn, transfer_id).await;
        }

        let active = {
            let mut receiving = self.inner.receiving.lock().await;
            let key = receiving
                .iter()
                .find(|(_, a)| a.file.transfer_id() == *transfer_id)
                .map(|(k, _)| *k);
            key.and_then(|k| receiving.remove(&k))
        };
        if let Some(active) = active {
            // Data already in flight belongs to this transfer
            self.inner
                .draining
                .lock()
                .await
                .insert(active.conn.remote_addr(), *transfer_id);
            active.file.abort().await;
            send_cancel_notice(&active.conn, transfer_id).await;
        }

        self.inner
            .transfers
            .update_status(transfer_id, TransferStatus::Cancelled, None)
            .await;
        tracing::info!(transfer = %transfer_id, "transfer: cancelled");
        Ok(())
    }

    /// Route one connection event. Feed every event of a connection through
    /// here, in order.
    pub async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened(conn) => {
                tracing::debug!(remote = %conn.remote_addr(), "transfer: connection opened");
            }
            ConnectionEvent::Message { connection, frame } => {
                let kind = frame.kind();
                if let Err(e) = self.handle_frame(&connection, frame).await {
                    tracing::debug!(
                        remote = %connection.remote_addr(),
                        kind = kind.name(),
                        error = %e,
                        "transfer: frame handling failed"
                    );
                }
            }
            ConnectionEvent::Closed { remote } => self.connection_closed(remote).await,
        }
    }

    pub async fn handle_frame(
        &self,
        conn: &Arc<Connection>,
        frame: Frame,
    ) -> Result<(), FileTransferError> {
        match frame.kind() {
            FrameKind::Heartbeat => Ok(()),
            FrameKind::Text => {
                let text = frame.as_text()?.to_string();
                tracing::info!(remote = %conn.remote_addr(), %text, "message: received");
                self.inner.events.publish(NodeEvent::MessageReceived {
                    remote: conn.remote_addr(),
                    text,
                });
                Ok(())
            }
            FrameKind::FileRequest => {
                let request = frame.to_file_request()?;
                self.on_request(conn, request).await
            }
            FrameKind::FileAck => {
                let response = frame.to_file_response()?;
                self.on_response(conn, response).await
            }
            FrameKind::FileData => self.on_data(conn, frame.body()).await,
        }
    }

    /// Fail everything that depended on the connection to `remote`.
    pub async fn connection_closed(&self, remote: SocketAddr) {
        let mut failed = Vec::new();

        self.inner.draining.lock().await.remove(&remote);
        let active = self.inner.receiving.lock().await.remove(&remote);
        if let Some(active) = active {
            failed.push(active.file.transfer_id());
            active.file.abort().await;
        }
        {
            let mut pending = self.inner.pending.lock().await;
            let stale: Vec<Uuid> = pending
                .iter()
                .filter(|(_, p)| p.conn.remote_addr() == remote)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                pending.remove(&id);
                failed.push(id);
            }
        }
        {
            let mut outgoing = self.inner.outgoing.lock().await;
            let stale: Vec<Uuid> = outgoing
                .iter()
                .filter(|(_, o)| o.conn.remote_addr() == remote)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                if let Some(entry) = outgoing.remove(&id) {
                    entry.cancel.cancel();
                }
                failed.push(id);
            }
        }

        for id in failed {
            self.inner
                .transfers
                .update_status(&id, TransferStatus::Failed, Some("connection closed".to_string()))
                .await;
        }
        tracing::debug!(%remote, "transfer: connection closed");
    }
}

/// Refuse `transfer_id` on `conn`; used both to stop a running transfer and
/// to confirm that one has stopped.
async fn send_cancel_notice(conn: &Connection, transfer_id: &Uuid) {
    let response = FileTransferResponse::reject(*transfer_id, CANCELLED);
    match Frame::file_response(&response) {
        Ok(frame) => {
            if let Err(e) = conn.send(frame).await {
                tracing::debug!(transfer = %transfer_id, error = %e, "transfer: cancel notice not delivered");
            }
        }
        Err(e) => tracing::warn!(transfer = %transfer_id, error = %e, "transfer: cancel notice encode failed"),
    }
}

/// Send one Text frame.
pub async fn send_text(conn: &Connection, text: &str) -> Result<(), TransportError> {
    conn.send(Frame::text(text)).await
}
