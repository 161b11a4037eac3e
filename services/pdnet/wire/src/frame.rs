//! Message framing for the wire protocol.
//!
//! A frame is `[u16 length][u8 header][body]`, where `length` counts the
//! header byte plus the body. Encoding reserves the length prefix, writes the
//! header and body, then backfills the length.

use crate::error::WireError;
use crate::registry::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Smallest possible frame: length prefix plus header byte
pub const MIN_FRAME_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// Largest body that fits a `u16` length prefix
pub const MAX_BODY_SIZE: usize = u16::MAX as usize - 1;

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type discriminator
    pub header: u8,
    /// Body bytes (without length prefix or header)
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(header: u8, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        MIN_FRAME_SIZE + self.body.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, WireError> {
        encode_frame(self.header, |buf| buf.put_slice(&self.body))
    }
}

/// Encode a frame whose body is produced by `write_body`
pub fn encode_frame<F>(header: u8, write_body: F) -> Result<Bytes, WireError>
where
    F: FnOnce(&mut BytesMut),
{
    let mut buf = BytesMut::with_capacity(64);

    // Length is backfilled once the body size is known
    buf.put_u16_le(0);
    buf.put_u8(header);
    write_body(&mut buf);

    let payload_len = buf.len() - LENGTH_PREFIX_SIZE;
    if payload_len > u16::MAX as usize {
        return Err(WireError::Size(payload_len));
    }
    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&(payload_len as u16).to_le_bytes());

    Ok(buf.freeze())
}

/// Encode a typed message into a frame
pub fn encode_message(message: &dyn Message) -> Result<Bytes, WireError> {
    encode_frame(message.header(), |buf| message.write_body(buf))
}

/// Iterate over every frame in a buffer of concatenated frames
///
/// Frames are yielded in buffer order. A framing error (truncated frame or
/// zero length) is yielded once and ends the iteration, since the remaining
/// bytes can no longer be delimited.
pub fn decode_frames(buf: Bytes) -> FrameIter {
    FrameIter { buf, done: false }
}

/// Iterator returned by [`decode_frames`]
#[derive(Debug)]
pub struct FrameIter {
    buf: Bytes,
    done: bool,
}

impl Iterator for FrameIter {
    type Item = Result<Frame, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || !self.buf.has_remaining() {
            return None;
        }

        let result = split_frame(&mut self.buf);
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

fn split_frame(buf: &mut Bytes) -> Result<Frame, WireError> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(WireError::Incomplete {
            needed: MIN_FRAME_SIZE,
            available: buf.len(),
        });
    }

    let length = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if length == 0 {
        return Err(WireError::EmptyFrame);
    }

    let available = buf.len() - LENGTH_PREFIX_SIZE;
    if length > available {
        return Err(WireError::Incomplete {
            needed: length,
            available,
        });
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let header = buf.get_u8();
    let body = buf.split_to(length - 1);

    Ok(Frame { header, body })
}

/// Split the longest run of complete frames off the front of a stream buffer
///
/// Returns `Ok(None)` while the first frame is still partial. A zero length
/// prefix cannot be delimited and is reported as [`WireError::EmptyFrame`].
pub fn take_complete_frames(buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
    let mut offset = 0;

    while buf.len() - offset >= LENGTH_PREFIX_SIZE {
        let length = u16::from_le_bytes([buf[offset], buf[offset + 1]]) as usize;
        if length == 0 {
            return Err(WireError::EmptyFrame);
        }
        if buf.len() - offset < LENGTH_PREFIX_SIZE + length {
            break;
        }
        offset += LENGTH_PREFIX_SIZE + length;
    }

    if offset == 0 {
        Ok(None)
    } else {
        Ok(Some(buf.split_to(offset).freeze()))
    }
}
