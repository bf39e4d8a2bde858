//! TCP transport -- listener, client and per-connection receive loops.
//!
//! Every connection owns one socket split in two: the write half sits behind
//! a mutex so whole frames never interleave, the read half is driven by a
//! spawned receive loop that turns bytes into [`Frame`]s.
//!
//! Events per connection, in order: one `Opened`, any number of `Message`,
//! exactly one `Closed` (peer EOF, read error, codec error or local close).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use lanrelay_protocol::{Frame, FrameCodec, ProtocolError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Capacity of each event channel handed to a consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("listener already started")]
    AlreadyStarted,
    #[error("invalid transport config: {0}")]
    InvalidConfig(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Opened(Arc<Connection>),
    Message {
        connection: Arc<Connection>,
        frame: Frame,
    },
    Closed {
        remote: SocketAddr,
    },
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug)]
pub struct Connection {
    remote: SocketAddr,
    local: SocketAddr,
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Wrap a connected stream, announce it with `Opened` and spawn its
    /// receive loop. `parent` cancels the connection when it is cancelled.
    pub async fn spawn(
        stream: TcpStream,
        strict_framing: bool,
        events: mpsc::Sender<ConnectionEvent>,
        parent: &CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>), TransportError> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let conn = Arc::new(Self {
            remote,
            local,
            writer: Mutex::new(FramedWrite::new(
                write_half,
                FrameCodec::with_strict(strict_framing),
            )),
            cancel: parent.child_token(),
        });
        let reader = FramedRead::new(read_half, FrameCodec::with_strict(strict_framing));

        if events
            .send(ConnectionEvent::Opened(conn.clone()))
            .await
            .is_err()
        {
            conn.cancel.cancel();
            return Err(TransportError::Closed);
        }

        let handle = tokio::spawn(receive_loop(conn.clone(), reader, events));
        Ok((conn, handle))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Write one frame and flush. Frames from concurrent callers are queued
    /// on the writer lock, never interleaved.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            result = writer.send(frame) => result.map_err(|e| {
                self.cancel.cancel();
                TransportError::from(e)
            }),
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
        }
    }

    /// Stop the receive loop. The `Closed` event follows from the loop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

async fn receive_loop(
    conn: Arc<Connection>,
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    let remote = conn.remote;
    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => {
                tracing::debug!(%remote, "transport: connection closed locally");
                break;
            }
            next = reader.next() => match next {
                Some(Ok(frame)) => {
                    tracing::trace!(%remote, kind = frame.kind().name(), len = frame.body().len(), "transport: frame received");
                    let event = ConnectionEvent::Message { connection: conn.clone(), frame };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::info!(%remote, error = %e, "transport: receive failed");
                    break;
                }
                None => {
                    tracing::debug!(%remote, "transport: peer closed connection");
                    break;
                }
            }
        }
    }

    conn.cancel.cancel();
    {
        let mut writer = conn.writer.lock().await;
        let _ = writer.get_mut().shutdown().await;
    }
    let _ = events.send(ConnectionEvent::Closed { remote }).await;
}

// ============================================================================
// Listener
// ============================================================================

type ConnectionMap = Arc<Mutex<HashMap<SocketAddr, Arc<Connection>>>>;

/// Accepts connections on one local address.
pub struct TcpServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    strict_framing: bool,
    connections: ConnectionMap,
    cancel: CancellationToken,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Bind `addr`. A specific NIC address keeps the listener on that segment.
    pub async fn bind(addr: SocketAddr, strict_framing: bool) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "transport: listener bound");
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            strict_framing,
            connections: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            accept_handle: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop. Events for every accepted connection arrive on
    /// the returned channel.
    pub async fn start(&self) -> Result<mpsc::Receiver<ConnectionEvent>, TransportError> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(TransportError::AlreadyStarted)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(accept_loop(
            listener,
            self.strict_framing,
            self.connections.clone(),
            events_tx,
            self.cancel.clone(),
        ));
        *self.accept_handle.lock().await = Some(handle);
        Ok(events_rx)
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().await.values().cloned().collect()
    }

    pub async fn connection(&self, remote: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections.lock().await.get(remote).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Stop accepting and close every live connection.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.accept_handle.lock().await.take() {
            let _ = handle.await;
        }
        let closed: Vec<Arc<Connection>> = self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for conn in &closed {
            conn.close();
        }
        tracing::info!(local = %self.local_addr, closed = closed.len(), "transport: listener stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    strict_framing: bool,
    connections: ConnectionMap,
    events: mpsc::Sender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    match Connection::spawn(stream, strict_framing, events.clone(), &cancel).await {
                        Ok((conn, _handle)) => {
                            let count = {
                                let mut map = connections.lock().await;
                                map.insert(remote, conn.clone());
                                map.len()
                            };
                            tracing::info!(%remote, connections = count, "transport: accepted connection");

                            let connections = connections.clone();
                            tokio::spawn(async move {
                                conn.closed().await;
                                let mut map = connections.lock().await;
                                if map.get(&remote).is_some_and(|c| Arc::ptr_eq(c, &conn)) {
                                    map.remove(&remote);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::debug!(%remote, error = %e, "transport: dropping accepted socket");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transport: accept failed");
                }
            }
        }
    }
}

// ============================================================================
// Client
// ============================================================================

struct ClientState {
    conn: Arc<Connection>,
    handle: JoinHandle<()>,
}

/// One outbound connection at a time.
pub struct TcpClient {
    strict_framing: bool,
    state: Mutex<Option<ClientState>>,
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new(false)
    }
}

impl TcpClient {
    pub fn new(strict_framing: bool) -> Self {
        Self {
            strict_framing,
            state: Mutex::new(None),
        }
    }

    /// Connect to `addr`. Fails with `AlreadyConnected` while a previous
    /// connection is still live.
    pub async fn connect(
        &self,
        addr: SocketAddr,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<ConnectionEvent>), TransportError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.as_ref() {
            if !existing.conn.is_closed() {
                return Err(TransportError::AlreadyConnected(existing.conn.remote_addr()));
            }
        }

        let stream = TcpStream::connect(addr).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (conn, handle) =
            Connection::spawn(stream, self.strict_framing, events_tx, &CancellationToken::new())
                .await?;
        tracing::info!(remote = %addr, "transport: connected");

        *state = Some(ClientState {
            conn: conn.clone(),
            handle,
        });
        Ok((conn, events_rx))
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let conn = self.connection().await.ok_or(TransportError::NotConnected)?;
        conn.send(frame).await
    }

    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.state.lock().await.as_ref().map(|s| s.conn.clone())
    }

    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.conn.is_closed())
    }

    /// Close the connection and wait for its receive loop. Safe to call
    /// repeatedly or when never connected.
    pub async fn disconnect(&self) {
        let state = self.state.lock().await.take();
        if let Some(state) = state {
            state.conn.close();
            let _ = state.handle.await;
            tracing::debug!(remote = %state.conn.remote_addr(), "transport: disconnected");
        }
    }
}
