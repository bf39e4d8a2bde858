//! Stream codec for TCP connections.
//!
//! Wire format: 8-byte header + raw body (see [`crate::frame`]).
//! Lenient mode skips the 8 header bytes of a header with a negative length
//! and keeps reading; strict mode treats it as fatal for the stream.
//! Frames of an unknown kind are always consumed whole and dropped. A known
//! frame whose body exceeds the size limit is fatal in both modes.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{decode_header, Frame, FrameError};
use crate::params::DEFAULT_PARAMS;
use crate::{ProtocolError, HEADER_LEN};

/// Upper bound on a single up-front reservation for a partially received body.
const MAX_RESERVE: usize = 64 * 1024;

/// Codec for framing [`Frame`] values over a byte stream.
#[derive(Debug)]
pub struct FrameCodec {
    strict: bool,
    max_frame: usize,
    /// Body bytes of an unknown-kind frame still to be thrown away.
    discard: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_strict(false)
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat malformed headers as fatal instead of skipping them.
    pub fn strict() -> Self {
        Self::with_strict(true)
    }

    pub fn with_strict(strict: bool) -> Self {
        Self {
            strict,
            max_frame: DEFAULT_PARAMS.max_frame_bytes,
            discard: 0,
        }
    }

    /// Override the largest accepted frame body.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(src.len());
                src.advance(n);
                self.discard -= n;
                if self.discard > 0 {
                    return Ok(None);
                }
            }

            match decode_header(src) {
                Err(FrameError::Truncated { .. }) => return Ok(None),
                Err(FrameError::NegativeLength { declared }) => {
                    if self.strict {
                        return Err(FrameError::NegativeLength { declared }.into());
                    }
                    tracing::debug!(declared, "codec: negative body length, skipping header");
                    src.advance(HEADER_LEN);
                }
                Err(FrameError::UnknownKind { kind, body_len }) => {
                    tracing::debug!(kind, body_len, "codec: unknown frame kind, dropping frame");
                    src.advance(HEADER_LEN);
                    self.discard = body_len as usize;
                }
                Ok(header) => {
                    let size = header.body_len as usize;
                    if size > self.max_frame {
                        return Err(ProtocolError::MessageTooLarge {
                            size,
                            max: self.max_frame,
                        });
                    }
                    let total = header.frame_len();
                    if src.len() < total {
                        src.reserve((total - src.len()).min(MAX_RESERVE));
                        return Ok(None);
                    }
                    src.advance(HEADER_LEN);
                    let body = src.split_to(header.body_len as usize).freeze();
                    return Ok(Some(Frame::new(header.kind, body)));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.body().len() > self.max_frame {
            return Err(ProtocolError::MessageTooLarge {
                size: item.body().len(),
                max: self.max_frame,
            });
        }
        dst.reserve(HEADER_LEN + item.body().len());
        item.header().write_to(dst);
        dst.extend_from_slice(item.body());
        Ok(())
    }
}
