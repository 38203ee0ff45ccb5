//! Packet framing and payload primitives
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! [u32 total length][u32 message tag][payload]
//! ```
//!
//! The length includes the 8-byte header. Payload fields are read through
//! `&mut &[u8]` cursors that advance as values are taken.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length and tag fields
pub const HEADER_LEN: usize = 8;

/// Default upper bound on a frame, header included
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Errors raised while framing or reading payload fields
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of data")]
    Short,

    #[error("malformed data: {0}")]
    Malformed(&'static str),

    /// The header was readable, so the frame's tag is known
    #[error("malformed frame (tag {tag}): declared length {len} outside {min}..={max}")]
    MalformedFrame { tag: u32, len: usize, min: usize, max: usize },
}

/// One complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub payload: Bytes,
}

/// Result of decoding from a byte slice
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    Frame {
        tag: u32,
        payload: &'a [u8],
        /// Bytes of `buf` the frame occupied
        consumed: usize,
    },
    NeedMoreData,
}

/// Create a wire-format frame with message tag and payload.
///
/// A payload too large for the length field saturates it, so the peer
/// rejects the frame instead of misreading a truncated length.
pub fn encode(tag: u32, payload: &[u8]) -> BytesMut {
    let len = HEADER_LEN + payload.len();
    debug_assert!(len <= u32::MAX as usize, "frame of {len} bytes overflows the length field");
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32_le(u32::try_from(len).unwrap_or(u32::MAX));
    buf.put_u32_le(tag);
    buf.extend_from_slice(payload);
    buf
}

/// Decode the frame at the front of `buf` without copying the payload.
pub fn decode(buf: &[u8], max_frame_len: usize) -> Result<Decoded<'_>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::NeedMoreData);
    }

    let (len, tag) = check_header(buf, max_frame_len)?;
    if buf.len() < len {
        return Ok(Decoded::NeedMoreData);
    }

    Ok(Decoded::Frame {
        tag,
        payload: &buf[HEADER_LEN..len],
        consumed: len,
    })
}

/// Declared length and tag of the header at the front of `buf`
fn check_header(buf: &[u8], max: usize) -> Result<(usize, u32), CodecError> {
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let tag = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len < HEADER_LEN || len > max {
        return Err(CodecError::MalformedFrame { tag, len, min: HEADER_LEN, max });
    }
    Ok((len, tag))
}

/// Incremental decoder fed from arbitrary read chunks.
///
/// After a malformed header the decoder skips the bad frame and resumes on
/// the next one: an oversize frame is discarded by its declared length, an
/// undersized one by its header.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
    discard: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_len,
            discard: 0,
        }
    }

    /// Buffer to read into directly, with room for at least one more chunk
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.reserve(4096);
        &mut self.buf
    }

    /// Next complete frame, if any. A malformed header yields one error and
    /// the decoder continues past it on subsequent calls.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.discard > 0 {
            let n = self.discard.min(self.buf.len());
            self.buf.advance(n);
            self.discard -= n;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        let len = match decode(&self.buf, self.max_frame_len) {
            Ok(Decoded::Frame { consumed, .. }) => consumed,
            Ok(Decoded::NeedMoreData) => return Ok(None),
            Err(e) => {
                if let CodecError::MalformedFrame { len, .. } = e {
                    self.discard = if len < HEADER_LEN { HEADER_LEN } else { len };
                }
                return Err(e);
            }
        };

        let mut frame = self.buf.split_to(len);
        frame.advance(4);
        let tag = frame.get_u32_le();
        Ok(Some(Frame { tag, payload: frame.freeze() }))
    }
}

pub fn put_bool(dst: &mut BytesMut, v: bool) {
    dst.put_u8(u8::from(v));
}

pub fn get_u8(src: &mut &[u8]) -> Result<u8, CodecError> {
    if src.is_empty() {
        return Err(CodecError::Short);
    }
    Ok(src.get_u8())
}

pub fn get_bool(src: &mut &[u8]) -> Result<bool, CodecError> {
    match get_u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(CodecError::Malformed("bool")),
    }
}

pub fn get_u32(src: &mut &[u8]) -> Result<u32, CodecError> {
    if src.len() < 4 {
        return Err(CodecError::Short);
    }
    Ok(src.get_u32_le())
}

pub fn get_i32(src: &mut &[u8]) -> Result<i32, CodecError> {
    if src.len() < 4 {
        return Err(CodecError::Short);
    }
    Ok(src.get_i32_le())
}

pub fn get_u64(src: &mut &[u8]) -> Result<u64, CodecError> {
    if src.len() < 8 {
        return Err(CodecError::Short);
    }
    Ok(src.get_u64_le())
}

pub fn get_i64(src: &mut &[u8]) -> Result<i64, CodecError> {
    if src.len() < 8 {
        return Err(CodecError::Short);
    }
    Ok(src.get_i64_le())
}

pub fn get_f64(src: &mut &[u8]) -> Result<f64, CodecError> {
    if src.len() < 8 {
        return Err(CodecError::Short);
    }
    Ok(src.get_f64_le())
}
