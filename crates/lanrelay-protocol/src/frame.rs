//! Frame model and the stateless encode/decode functions.
//!
//! ```text
//! offset 0   : kind (1 byte)
//! offset 1-3 : reserved, zero on write, ignored on read
//! offset 4-7 : body length (u32, big-endian)
//! offset 8.. : body
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::messages::{FileTransferRequest, FileTransferResponse};
use crate::{ProtocolError, HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Heartbeat = 0,
    Text = 1,
    FileRequest = 2,
    FileData = 3,
    FileAck = 4,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Heartbeat),
            1 => Some(FrameKind::Text),
            2 => Some(FrameKind::FileRequest),
            3 => Some(FrameKind::FileData),
            4 => Some(FrameKind::FileAck),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Heartbeat => "heartbeat",
            FrameKind::Text => "text",
            FrameKind::FileRequest => "file-request",
            FrameKind::FileData => "file-data",
            FrameKind::FileAck => "file-ack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("negative body length: {declared}")]
    NegativeLength { declared: i32 },
    #[error("unknown frame kind {kind} ({body_len} byte body)")]
    UnknownKind { kind: u8, body_len: u32 },
}

/// Decoded 8-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub body_len: u32,
}

impl FrameHeader {
    /// Total wire size of the frame this header announces.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u8(self.kind.as_u8());
        dst.put_bytes(0, 3);
        dst.put_u32(self.body_len);
    }
}

/// One header + body unit. Immutable once built; the header is always
/// derived from the body so the two cannot disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    body: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            kind: self.kind,
            body_len: self.body.len() as u32,
        }
    }

    // ========================================================================
    // Factories
    // ========================================================================

    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, Bytes::new())
    }

    pub fn text(text: &str) -> Self {
        Self::new(FrameKind::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn file_request(request: &FileTransferRequest) -> Result<Self, ProtocolError> {
        Ok(Self::new(FrameKind::FileRequest, serde_json::to_vec(request)?))
    }

    pub fn file_response(response: &FileTransferResponse) -> Result<Self, ProtocolError> {
        Ok(Self::new(FrameKind::FileAck, serde_json::to_vec(response)?))
    }

    pub fn file_data(chunk: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::FileData, chunk)
    }

    // ========================================================================
    // Body accessors
    // ========================================================================

    pub fn as_text(&self) -> Result<&str, ProtocolError> {
        self.expect_kind(FrameKind::Text)?;
        Ok(std::str::from_utf8(&self.body)?)
    }

    pub fn to_file_request(&self) -> Result<FileTransferRequest, ProtocolError> {
        self.expect_kind(FrameKind::FileRequest)?;
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn to_file_response(&self) -> Result<FileTransferResponse, ProtocolError> {
        self.expect_kind(FrameKind::FileAck)?;
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn expect_kind(&self, expected: FrameKind) -> Result<(), ProtocolError> {
        if self.kind != expected {
            return Err(ProtocolError::WrongKind {
                expected,
                got: self.kind,
            });
        }
        Ok(())
    }
}

/// Serialise a frame: 8-byte header then the body.
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.body.len());
    frame.header().write_to(&mut buf);
    buf.extend_from_slice(&frame.body);
    buf.freeze()
}

/// Parse the first 8 bytes of `buf` as a header.
///
/// A declared length with the top bit set is negative as a signed 32-bit
/// integer and is rejected before the kind byte is looked at.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN,
            available: buf.len(),
        });
    }

    let body_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if body_len > i32::MAX as u32 {
        return Err(FrameError::NegativeLength {
            declared: body_len as i32,
        });
    }

    match FrameKind::from_u8(buf[0]) {
        Some(kind) => Ok(FrameHeader { kind, body_len }),
        None => Err(FrameError::UnknownKind {
            kind: buf[0],
            body_len,
        }),
    }
}

/// Parse one complete frame from the start of `buf`. Trailing bytes are ignored.
pub fn decode_message(buf: &[u8]) -> Result<Frame, FrameError> {
    let header = decode_header(buf)?;
    let total = header.frame_len();
    if buf.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: buf.len(),
        });
    }
    Ok(Frame::new(
        header.kind,
        Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
    ))
}
