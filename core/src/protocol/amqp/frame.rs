//! Frame layer: `type:u8 | channel:u16 | size:u32 | payload | 0xCE`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::content::ContentHeader;
use super::errors::FramingError;
use super::methods::Method;

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;
pub const FRAME_END: u8 = 0xCE;

/// Type, channel and size.
pub const FRAME_HEADER_SIZE: usize = 7;
/// Header plus the frame-end octet.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// The smallest frame-max a peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Method(Method),
    Header(ContentHeader),
    Body(Bytes),
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: u16,
    pub body: FrameBody,
}

impl Frame {
    pub fn method(channel: u16, method: Method) -> Self {
        Self {
            channel,
            body: FrameBody::Method(method),
        }
    }

    pub fn header(channel: u16, header: ContentHeader) -> Self {
        Self {
            channel,
            body: FrameBody::Header(header),
        }
    }

    pub fn content(channel: u16, body: Bytes) -> Self {
        Self {
            channel,
            body: FrameBody::Body(body),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Heartbeat,
        }
    }

    pub fn frame_type(&self) -> u8 {
        match self.body {
            FrameBody::Method(_) => FRAME_METHOD,
            FrameBody::Header(_) => FRAME_HEADER,
            FrameBody::Body(_) => FRAME_BODY,
            FrameBody::Heartbeat => FRAME_HEARTBEAT,
        }
    }

    /// Total size of the frame starting at `input`, if its header is present.
    pub fn peek_len(input: &[u8]) -> Option<usize> {
        if input.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let size = (&input[3..7]).get_u32() as usize;
        Some(FRAME_OVERHEAD + size)
    }

    /// Decodes exactly one frame from the front of `input`.
    ///
    /// Returns the frame together with the number of bytes it occupied.
    pub fn decode(input: &[u8]) -> Result<(Frame, usize), FramingError> {
        let total = Self::peek_len(input).ok_or(FramingError::Truncated {
            needed: FRAME_HEADER_SIZE,
            available: input.len(),
        })?;
        if input.len() < total {
            return Err(FramingError::Truncated {
                needed: total,
                available: input.len(),
            });
        }

        let mut head = &input[..FRAME_HEADER_SIZE];
        let frame_type = head.get_u8();
        let channel = head.get_u16();
        let payload = &input[FRAME_HEADER_SIZE..total - 1];
        let end = input[total - 1];
        if end != FRAME_END {
            return Err(FramingError::InvalidFrameEnd(end));
        }

        let body = match frame_type {
            FRAME_METHOD => FrameBody::Method(Method::decode(payload)?),
            FRAME_HEADER => FrameBody::Header(ContentHeader::decode(payload)?),
            FRAME_BODY => FrameBody::Body(Bytes::copy_from_slice(payload)),
            FRAME_HEARTBEAT => {
                if channel != 0 || !payload.is_empty() {
                    return Err(FramingError::malformed(
                        "heartbeat",
                        "heartbeat frames must be empty and on channel 0",
                    ));
                }
                FrameBody::Heartbeat
            }
            other => return Err(FramingError::UnknownFrameType(other)),
        };
        Ok((Frame { channel, body }, total))
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.frame_type());
        dst.put_u16(self.channel);
        let size_at = dst.len();
        dst.put_u32(0);
        match &self.body {
            FrameBody::Method(method) => method.encode(dst),
            FrameBody::Header(header) => header.encode(dst),
            FrameBody::Body(body) => dst.put_slice(body),
            FrameBody::Heartbeat => {}
        }
        let size = (dst.len() - size_at - 4) as u32;
        dst[size_at..size_at + 4].copy_from_slice(&size.to_be_bytes());
        dst.put_u8(FRAME_END);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// The 8-byte `AMQP` header a client sends before its first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub class: u8,
    pub instance: u8,
    pub major: u8,
    pub minor: u8,
}

impl ProtocolHeader {
    pub const LEN: usize = 8;
    pub const AMQP_0_9_1: ProtocolHeader = ProtocolHeader {
        class: 0,
        instance: 0,
        major: 9,
        minor: 1,
    };

    pub fn parse(raw: [u8; 8]) -> Result<Self, FramingError> {
        if &raw[..4] != b"AMQP" {
            return Err(FramingError::ProtocolHeader(raw));
        }
        Ok(Self {
            class: raw[4],
            instance: raw[5],
            major: raw[6],
            minor: raw[7],
        })
    }

    pub fn to_bytes(self) -> [u8; 8] {
        [
            b'A',
            b'M',
            b'Q',
            b'P',
            self.class,
            self.instance,
            self.major,
            self.minor,
        ]
    }
}
