//! Protocol parameters -- the timing and sizing constants devices agree on.
//!
//! Everything here is wire- or interop-relevant. Node-local choices (download
//! directory, auto-accept) live in the node config instead. Ports and
//! intervals here are defaults that the node config may override.

/// A named set of protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Discovery packet version (`"v"`). Packets with another version are ignored.
    pub protocol_version: u32,

    // -- Ports --
    /// UDP port discovery packets are broadcast to.
    pub discovery_port: u16,
    /// TCP port the message listener binds.
    pub tcp_port: u16,

    // -- Discovery timing --
    /// Milliseconds between discovery broadcasts on each NIC.
    pub broadcast_interval_ms: u64,
    /// Milliseconds without a sighting before a device is dropped.
    pub device_timeout_ms: u64,
    /// Milliseconds between registry expiry sweeps.
    pub sweep_interval_ms: u64,
    /// Largest discovery datagram accepted or sent.
    pub max_datagram_bytes: usize,

    // -- Data path --
    /// Relay engine buffer size in bytes.
    pub relay_buffer_bytes: usize,
    /// FileData chunk size in bytes.
    pub chunk_bytes: usize,
    /// Largest frame body a connection will buffer. Bigger frames end the connection.
    pub max_frame_bytes: usize,
}

/// Version 1 parameters.
pub const DEFAULT_PARAMS: ProtocolParams = ProtocolParams {
    protocol_version: 1,

    discovery_port: 45679,
    tcp_port: 45680,

    broadcast_interval_ms: 3_000,
    device_timeout_ms: 10_000,
    sweep_interval_ms: 2_000,
    max_datagram_bytes: 65_507,

    relay_buffer_bytes: 8 * 1024,
    chunk_bytes: 64 * 1024,
    max_frame_bytes: 16 * 1024 * 1024,
};
