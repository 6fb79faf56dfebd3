//! Binary frame codec.
//!
//! Frame format (all integers little-endian):
//! ```text
//! +------------+----------------+-----------+---------------------------+
//! | message_id | payload_length | crc32     | payload                   |
//! | (2 bytes)  | (2 bytes)      | (4 bytes) | (payload_length bytes)    |
//! +------------+----------------+-----------+---------------------------+
//! ```
//!
//! The checksum covers the payload only. A checksum of `0` in the header
//! means the sender did not compute one and it is not verified.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::constants::{HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::FrameError;

/// Fixed 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_id: u16,
    pub payload_length: u16,
    pub checksum: u32,
}

impl FrameHeader {
    /// Parse a header from the front of `buf`. Returns `None` when fewer
    /// than [`HEADER_SIZE`] bytes are available.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut cursor = &buf[..HEADER_SIZE];
        Some(Self {
            message_id: cursor.get_u16_le(),
            payload_length: cursor.get_u16_le(),
            checksum: cursor.get_u32_le(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.message_id);
        buf.put_u16_le(self.payload_length);
        buf.put_u32_le(self.checksum);
    }
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (IEEE) of a payload.
pub fn checksum(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

/// A single protocol message as it appears on the wire, minus the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id,
            payload: payload.into(),
        }
    }

    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append header + payload to `buf` with a freshly computed checksum.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        buf.reserve(self.encoded_size());
        FrameHeader {
            message_id: self.message_id,
            payload_length: self.payload.len() as u16,
            checksum: checksum(&self.payload),
        }
        .write(buf);
        buf.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Encode `payload` under `message_id` into a standalone wire buffer.
pub fn encode(message_id: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    Frame::new(message_id, Bytes::copy_from_slice(payload)).encode()
}

/// Validate the frame at the front of `buf` without consuming anything.
///
/// Returns the header and the total frame length when a whole frame is
/// buffered, `None` when more bytes are needed.
fn peek(buf: &[u8]) -> Result<Option<(FrameHeader, usize)>, FrameError> {
    let Some(header) = FrameHeader::parse(buf) else {
        return Ok(None);
    };

    // Checked before waiting for the body: an oversize declaration is
    // rejected even if those bytes never arrive.
    let len = header.payload_length as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let total = HEADER_SIZE + len;
    if buf.len() < total {
        return Ok(None);
    }

    if header.checksum != 0 {
        let actual = checksum(&buf[HEADER_SIZE..total]);
        if actual != header.checksum {
            return Err(FrameError::ChecksumMismatch {
                message_id: header.message_id,
                expected: header.checksum,
                actual,
            });
        }
    }

    Ok(Some((header, total)))
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` for a whole valid frame,
/// `Ok(None)` when the frame is incomplete (zero bytes consumed), and an
/// error when the frame is invalid and the connection must be closed.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    Ok(peek(buf)?.map(|(header, total)| {
        let frame = Frame {
            message_id: header.message_id,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..total]),
        };
        (frame, total)
    }))
}

/// Streaming variant of [`decode`]: on success the frame's bytes are split
/// off the front of `buf` without copying the payload.
pub fn decode_buf(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    let Some((header, total)) = peek(buf)? else {
        return Ok(None);
    };

    let mut frame_bytes = buf.split_to(total);
    frame_bytes.advance(HEADER_SIZE);
    Ok(Some(Frame {
        message_id: header.message_id,
        payload: frame_bytes.freeze(),
    }))
}
