use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::errors::FramingError;
use super::frame::{Frame, ProtocolHeader, FRAME_OVERHEAD};

#[derive(Debug, Error)]
pub enum AmqpCodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
}

/// What the broker reads off the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ProtocolHeader(ProtocolHeader),
    Frame(Frame),
}

/// Socket codec: the protocol header first, then length-prefixed frames.
///
/// A `max_frame_size` of zero means no limit.
#[derive(Debug, Clone)]
pub struct AmqpFrameCodec {
    max_frame_size: usize,
    awaiting_header: bool,
}

impl AmqpFrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            awaiting_header: true,
        }
    }

    /// For a peer that already exchanged headers.
    pub fn frames_only(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            awaiting_header: false,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Applies the frame-max agreed during tuning.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }
}

impl Default for AmqpFrameCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for AmqpFrameCodec {
    type Item = Inbound;
    type Error = AmqpCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.awaiting_header {
            if src.len() < ProtocolHeader::LEN {
                return Ok(None);
            }
            let mut raw = [0u8; ProtocolHeader::LEN];
            raw.copy_from_slice(&src.split_to(ProtocolHeader::LEN));
            self.awaiting_header = false;
            return Ok(Some(Inbound::ProtocolHeader(ProtocolHeader::parse(raw)?)));
        }

        let total = match Frame::peek_len(src) {
            Some(total) => total,
            None => return Ok(None),
        };
        if self.max_frame_size > 0 && total > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            }
            .into());
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total);
        let (frame, consumed) = Frame::decode(&raw)?;
        debug_assert_eq!(consumed, total);
        Ok(Some(Inbound::Frame(frame)))
    }
}

impl Encoder<Frame> for AmqpFrameCodec {
    type Error = AmqpCodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Encoder<ProtocolHeader> for AmqpFrameCodec {
    type Error = AmqpCodecError;

    fn encode(&mut self, item: ProtocolHeader, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&item.to_bytes());
        Ok(())
    }
}

/// Largest body chunk that fits a frame of `frame_max` bytes.
pub fn body_chunk_size(frame_max: usize) -> usize {
    if frame_max == 0 {
        usize::MAX
    } else {
        frame_max.saturating_sub(FRAME_OVERHEAD).max(1)
    }
}
