//! Codec for encoding/decoding relay frames

use crate::destination::{InstanceLocator, TunnelDestination};
use crate::frame::{BearerToken, CloseCode, Frame, FrameTag};
use crate::{MAX_DATA_FRAME_SIZE, MAX_FIELD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown frame tag: {0:#06x}")]
    UnknownTag(u16),

    #[error("Field too large: {0} bytes")]
    FieldTooLarge(usize),

    #[error("DATA payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
}

/// Relay frame codec
///
/// Stateless; usable directly on buffers or through `tokio_util::codec::Framed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

/// Returns `Ok(None)` from the enclosing decode function when input is short
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

/// Read-only cursor over a partially received frame
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            u64::from_be_bytes(raw)
        })
    }

    /// Length-prefixed field; the limit is checked before the body arrives
    fn field(&mut self, limit: usize) -> Result<Option<&'a [u8]>, CodecError> {
        let len = need!(self.u32()) as usize;
        if len > limit {
            return Err(CodecError::FieldTooLarge(len));
        }
        Ok(self.take(len))
    }

    fn payload(&mut self) -> Result<Option<&'a [u8]>, CodecError> {
        let len = need!(self.u32()) as usize;
        if len > MAX_DATA_FRAME_SIZE {
            return Err(CodecError::PayloadTooLarge(len));
        }
        Ok(self.take(len))
    }

    fn string(&mut self, what: &'static str) -> Result<Option<String>, CodecError> {
        let raw = need!(self.field(MAX_FIELD_SIZE)?);
        let s = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8(what))?;
        Ok(Some(s.to_string()))
    }
}

impl FrameCodec {
    /// Encode a frame to bytes
    pub fn encode_frame(frame: &Frame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::write_frame(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns Ok(Some(frame)) and consumes its bytes if a complete frame was
    /// available, Ok(None) if more data is needed.
    pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match Self::parse(buf)? {
            Some((frame, consumed)) => {
                buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Try to decode multiple frames from buffer
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<Frame>, CodecError> {
        let mut frames = Vec::new();

        while let Some(frame) = Self::decode_frame(buf)? {
            frames.push(frame);
        }

        Ok(frames)
    }

    fn write_frame(frame: &Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u16(frame.tag() as u16);

        match frame {
            Frame::Connect { destination, token } => {
                buf.put_u16(destination.port());
                put_field(buf, destination.instance().resource_path().as_bytes())?;
                put_field(buf, token.as_str().as_bytes())?;
            }
            Frame::ConnectSuccessSid { sid } => {
                put_field(buf, sid)?;
            }
            Frame::ConnectFail { code, reason } | Frame::Close { code, reason } => {
                buf.put_u16(code.0);
                put_field(buf, reason.as_bytes())?;
            }
            Frame::Resume { sid, received } => {
                put_field(buf, sid)?;
                buf.put_u64(*received);
            }
            Frame::ResumeSuccessAck { ack } | Frame::Ack { ack } => {
                buf.put_u64(*ack);
            }
            Frame::Data { seq, payload } => {
                if payload.len() > MAX_DATA_FRAME_SIZE {
                    return Err(CodecError::PayloadTooLarge(payload.len()));
                }
                buf.put_u64(*seq);
                buf.put_u32(payload.len() as u32);
                buf.extend_from_slice(payload);
            }
        }

        Ok(())
    }

    fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, CodecError> {
        let mut cur = Cursor::new(buf);
        let raw_tag = need!(cur.u16());
        let tag = FrameTag::try_from(raw_tag).map_err(CodecError::UnknownTag)?;

        let frame = match tag {
            FrameTag::Connect => {
                let port = need!(cur.u16());
                let path = need!(cur.string("instance path")?);
                let token = need!(cur.string("bearer token")?);
                let instance: InstanceLocator = path
                    .parse()
                    .map_err(|e: crate::LocatorParseError| {
                        CodecError::InvalidDestination(e.to_string())
                    })?;
                Frame::Connect {
                    destination: TunnelDestination::new(instance, port),
                    token: BearerToken::new(token),
                }
            }
            FrameTag::ConnectSuccessSid => {
                let sid = need!(cur.field(MAX_FIELD_SIZE)?);
                Frame::ConnectSuccessSid {
                    sid: Bytes::copy_from_slice(sid),
                }
            }
            FrameTag::ConnectFail | FrameTag::Close => {
                let code = CloseCode(need!(cur.u16()));
                let reason = need!(cur.string("reason")?);
                if tag == FrameTag::Close {
                    Frame::Close { code, reason }
                } else {
                    Frame::ConnectFail { code, reason }
                }
            }
            FrameTag::Resume => {
                let sid = need!(cur.field(MAX_FIELD_SIZE)?);
                let received = need!(cur.u64());
                Frame::Resume {
                    sid: Bytes::copy_from_slice(sid),
                    received,
                }
            }
            FrameTag::ResumeSuccessAck => Frame::ResumeSuccessAck {
                ack: need!(cur.u64()),
            },
            FrameTag::Ack => Frame::Ack {
                ack: need!(cur.u64()),
            },
            FrameTag::Data => {
                let seq = need!(cur.u64());
                let payload = need!(cur.payload()?);
                Frame::Data {
                    seq,
                    payload: Bytes::copy_from_slice(payload),
                }
            }
        };

        Ok(Some((frame, cur.pos)))
    }
}

fn put_field(buf: &mut BytesMut, field: &[u8]) -> Result<(), CodecError> {
    if field.len() > MAX_FIELD_SIZE {
        return Err(CodecError::FieldTooLarge(field.len()));
    }
    buf.put_u32(field.len() as u32);
    buf.extend_from_slice(field);
    Ok(())
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_frame(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::write_frame(&item, dst)
    }
}
