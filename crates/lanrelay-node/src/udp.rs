//! UDP endpoint for discovery broadcasts.
//!
//! Always bound to one explicit local IPv4 address, never the wildcard, so a
//! bridge host runs one endpoint per segment.

use std::net::{SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;

pub struct UdpEndpoint {
    socket: UdpSocket,
    max_datagram: usize,
}

impl UdpEndpoint {
    /// Bind with address reuse and broadcast enabled.
    pub fn bind(addr: SocketAddrV4, max_datagram: usize) -> Result<Self, TransportError> {
        if addr.ip().is_unspecified() {
            return Err(TransportError::InvalidConfig(
                "udp endpoint needs an explicit local address".into(),
            ));
        }
        if max_datagram == 0 {
            return Err(TransportError::InvalidConfig(
                "udp receive buffer must be positive".into(),
            ));
        }

        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.set_broadcast(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&SocketAddr::V4(addr).into())?;
        let std_sock: std::net::UdpSocket = sock.into();
        let socket = UdpSocket::from_std(std_sock)?;

        tracing::debug!(local = %addr, "discovery: udp endpoint bound");
        Ok(Self {
            socket,
            max_datagram,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<usize, TransportError> {
        Ok(self.socket.send_to(bytes, dest).await?)
    }

    /// Wait for one datagram. `None` when `cancel` fires first.
    pub async fn recv(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<(Vec<u8>, SocketAddr)>, TransportError> {
        let mut buf = vec![0u8; self.max_datagram];
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            received = self.socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                buf.truncate(len);
                Ok(Some((buf, from)))
            }
        }
    }
}
