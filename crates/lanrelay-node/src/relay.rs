//! Relay engine -- fixed-buffer stream copy with backpressure.
//!
//! One buffer per direction. A read is only issued once the previous chunk
//! has been fully written, so a slow target stalls the source and memory
//! stays bounded by the buffer size regardless of how much data flows.
//!
//! Bidirectional relays share one cancellation scope: whichever direction
//! ends first (EOF or error) cancels the other.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay buffer size must be positive")]
    InvalidBufferSize,
    #[error("relay cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes moved in each direction of a bidirectional relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayTotals {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Relay {
    buffer_size: usize,
}

impl Relay {
    pub fn new(buffer_size: usize) -> Result<Self, RelayError> {
        if buffer_size == 0 {
            return Err(RelayError::InvalidBufferSize);
        }
        Ok(Self { buffer_size })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Copy `source` to `target` until EOF, then flush `target`.
    ///
    /// `progress` receives the cumulative byte count after every write.
    pub async fn relay<R, W, F>(
        &self,
        source: &mut R,
        target: &mut W,
        mut progress: F,
        cancel: &CancellationToken,
    ) -> Result<u64, RelayError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
        F: FnMut(u64),
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                read = source.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                written = target.write_all(&buf[..n]) => written?,
            }
            total += n as u64;
            progress(total);
        }
        target.flush().await?;
        Ok(total)
    }

    /// Full-duplex relay between two streams. Returns once both directions
    /// have stopped.
    pub async fn relay_bidirectional<A, B>(
        &self,
        a: A,
        b: B,
        cancel: &CancellationToken,
    ) -> RelayTotals
    where
        A: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);
        let scope = cancel.child_token();

        let a_to_b = async {
            let mut moved = 0u64;
            let result = self
                .relay(&mut a_read, &mut b_write, |n| moved = n, &scope)
                .await;
            scope.cancel();
            let _ = b_write.shutdown().await;
            log_direction("a->b", &result);
            moved
        };
        let b_to_a = async {
            let mut moved = 0u64;
            let result = self
                .relay(&mut b_read, &mut a_write, |n| moved = n, &scope)
                .await;
            scope.cancel();
            let _ = a_write.shutdown().await;
            log_direction("b->a", &result);
            moved
        };

        let (a_to_b, b_to_a) = tokio::join!(a_to_b, b_to_a);
        RelayTotals { a_to_b, b_to_a }
    }
}

fn log_direction(direction: &str, result: &Result<u64, RelayError>) {
    match result {
        Ok(bytes) => tracing::debug!(direction, bytes, "relay: direction finished"),
        Err(RelayError::Cancelled) => {}
        Err(e) => tracing::debug!(direction, error = %e, "relay: direction failed"),
    }
}

// ============================================================================
// TCP forwarder
// ============================================================================

/// Accept connections on `listener` and relay each one to `target`. Lets a
/// bridge carry a TCP session between its two segments.
pub async fn run_forwarder(
    listener: TcpListener,
    target: SocketAddr,
    relay: Relay,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((inbound, remote)) => {
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        match TcpStream::connect(target).await {
                            Ok(outbound) => {
                                let _ = inbound.set_nodelay(true);
                                let _ = outbound.set_nodelay(true);
                                let totals = relay.relay_bidirectional(inbound, outbound, &cancel).await;
                                tracing::info!(
                                    %remote,
                                    %target,
                                    sent = totals.a_to_b,
                                    received = totals.b_to_a,
                                    "relay: session closed"
                                );
                            }
                            Err(e) => {
                                tracing::warn!(%remote, %target, error = %e, "relay: target unreachable");
                            }
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "relay: accept failed"),
            }
        }
    }
    tracing::debug!(%target, "relay: forwarder stopped");
}
