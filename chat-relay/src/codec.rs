//! Length-prefixed frame codec shared by the relay and its clients.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! [u32 body length] [u16 field count] ( [u32 field length] [utf-8 bytes] )*
//! ```
//!
//! Field 0 is always the message tag, so a frame carries at least one field.
//! The body must be consumed exactly; anything shorter or longer than the
//! announced fields is rejected.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest body (everything after the length prefix) accepted in either direction.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;
const COUNT_PREFIX: usize = 2;

/// One tagged, ordered sequence of string fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    fields: Vec<String>,
}

impl Frame {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// The type tag, or `None` for a frame built with no fields.
    pub fn tag(&self) -> Option<&str> {
        self.fields.first().map(String::as_str)
    }

    /// Size of the encoded body, i.e. everything after the length prefix.
    pub fn encoded_len(&self) -> usize {
        COUNT_PREFIX
            + self
                .fields
                .iter()
                .map(|field| LEN_PREFIX + field.len())
                .sum::<usize>()
    }

    /// Whether the frame is within [`MAX_FRAME_LEN`] and can be encoded.
    pub fn fits(&self) -> bool {
        self.encoded_len() <= MAX_FRAME_LEN
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<String> {
        self.fields
    }
}

impl<S: Into<String>> FromIterator<S> for Frame {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame has no fields")]
    EmptyFrame,
    #[error("frame body ends before its declared fields")]
    Truncated,
    #[error("{0} unexpected bytes after the last field")]
    TrailingBytes(usize),
    #[error("field {index} is not valid utf-8")]
    InvalidUtf8 { index: usize },
    #[error("frame has {0} fields, more than a frame can carry")]
    TooManyFields(usize),
}

/// Encodes one complete frame, length prefix included.
pub fn encode(frame: &Frame) -> Result<BytesMut, CodecError> {
    let mut dst = BytesMut::new();
    encode_into(frame, &mut dst)?;
    Ok(dst)
}

/// Decodes a buffer that must hold exactly one complete frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    let mut src = bytes;
    if src.remaining() < LEN_PREFIX {
        return Err(CodecError::Truncated);
    }
    let body_len = src.get_u32() as usize;
    check_len(body_len)?;
    if src.remaining() < body_len {
        return Err(CodecError::Truncated);
    }
    if src.remaining() > body_len {
        return Err(CodecError::TrailingBytes(src.remaining() - body_len));
    }
    decode_body(src)
}

fn encode_into(frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
    let fields = frame.fields();
    if fields.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    let count = u16::try_from(fields.len()).map_err(|_| CodecError::TooManyFields(fields.len()))?;

    let body_len = frame.encoded_len();
    check_len(body_len)?;

    dst.reserve(LEN_PREFIX + body_len);
    // Both casts are bounded by MAX_FRAME_LEN.
    dst.put_u32(body_len as u32);
    dst.put_u16(count);
    for field in fields {
        dst.put_u32(field.len() as u32);
        dst.put_slice(field.as_bytes());
    }
    Ok(())
}

fn decode_body(mut body: &[u8]) -> Result<Frame, CodecError> {
    if body.remaining() < COUNT_PREFIX {
        return Err(CodecError::Truncated);
    }
    let count = body.get_u16() as usize;
    if count == 0 {
        return Err(CodecError::EmptyFrame);
    }

    let mut fields = Vec::with_capacity(count);
    for index in 0..count {
        if body.remaining() < LEN_PREFIX {
            return Err(CodecError::Truncated);
        }
        let len = body.get_u32() as usize;
        if body.remaining() < len {
            return Err(CodecError::Truncated);
        }
        let field = std::str::from_utf8(&body[..len])
            .map_err(|_| CodecError::InvalidUtf8 { index })?
            .to_owned();
        body.advance(len);
        fields.push(field);
    }

    if body.has_remaining() {
        return Err(CodecError::TrailingBytes(body.remaining()));
    }
    Ok(Frame::new(fields))
}

fn check_len(len: usize) -> Result<(), CodecError> {
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Streaming codec for use with `FramedRead` / `FramedWrite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        // Reject before buffering so a hostile prefix cannot make us allocate.
        check_len(body_len)?;

        let total = LEN_PREFIX + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let body = src.split_to(body_len);
        decode_body(&body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_into(&frame, dst)
    }
}
