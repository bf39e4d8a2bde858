//! LanRelay Protocol -- wire frames, stream codec, discovery and transfer records.
//!
//! TCP between devices: 8-byte header (type, 3 reserved, big-endian u32 length)
//! followed by a raw body. UDP discovery datagrams are compact JSON.

pub mod codec;
pub mod frame;
pub mod messages;
pub mod params;

pub use codec::FrameCodec;
pub use frame::{decode_header, decode_message, encode, Frame, FrameError, FrameHeader, FrameKind};
pub use messages::*;
pub use params::{ProtocolParams, DEFAULT_PARAMS};

/// Discovery protocol version carried in every packet.
pub const PROTOCOL_VERSION: u32 = DEFAULT_PARAMS.protocol_version;

/// Fixed frame header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Group identifier (opaque string, ordinal comparison).
pub type GroupId = String;

/// Device identifier (random v4 UUID chosen by each device).
pub type DeviceId = uuid::Uuid;

/// Group every device starts in. Never password protected.
pub const PUBLIC_GROUP: &str = "Public";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("frame too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("unexpected frame kind: expected {expected:?}, got {got:?}")]
    WrongKind { expected: FrameKind, got: FrameKind },
    #[error("text body is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
