//! Image frame format.
//!
//! Frame layout (15 bytes header + payload, multi-byte fields little-endian):
//!
//! ```text
//! +--------------+--------+----------+-------------+----------+---------+--------+
//! | total_length | opcode | reserved | data_length | reserved | crc32   | footer |
//! |   2 bytes    | 1 byte | 2 bytes  |   2 bytes   | 2 bytes  | 4 bytes | 00 65  |
//! +--------------+--------+----------+-------------+----------+---------+--------+
//! | payload (data_length bytes, an encoded PNG)                                   |
//! +-------------------------------------------------------------------------------+
//! ```
//!
//! `total_length` is always `data_length + 15`.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (2+1+2+2+2+4+2 = 15).
pub const FRAME_HEADER_SIZE: usize = 15;

/// Opcode carried by image frames.
pub const IMAGE_OPCODE: u8 = 0x02;

/// Trailing bytes of the header.
pub const FRAME_FOOTER: [u8; 2] = [0x00, 0x65];

/// Largest payload whose total length still fits the 16-bit length field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize - FRAME_HEADER_SIZE;

/// An image frame. Immutable once built: the checksum always matches the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    crc32: u32,
    payload: Bytes,
}

impl Frame {
    /// Creates a frame wrapping the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            crc32: crc32fast::hash(&payload),
            payload,
        }
    }

    /// Frame payload (encoded image).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// CRC32 (IEEE) of the payload.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn data_length(&self) -> usize {
        self.payload.len()
    }

    pub fn total_length(&self) -> usize {
        self.payload.len() + FRAME_HEADER_SIZE
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let data_len = self.payload.len();
        if data_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: data_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + data_len);
        buf.put_u16_le((data_len + FRAME_HEADER_SIZE) as u16);
        buf.put_u8(IMAGE_OPCODE);
        buf.put_u16(0);
        buf.put_u16_le(data_len as u16);
        buf.put_u16(0);
        buf.put_u32_le(self.crc32);
        buf.put_slice(&FRAME_FOOTER);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on a malformed frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let total_len = u16::from_le_bytes([buf[0], buf[1]]);
        if buf[2] != IMAGE_OPCODE {
            return Err(ProtocolError::UnexpectedOpcode(buf[2]));
        }
        if buf[3] != 0 || buf[4] != 0 {
            return Err(ProtocolError::ReservedBytes(3));
        }
        let data_len = u16::from_le_bytes([buf[5], buf[6]]);
        if buf[7] != 0 || buf[8] != 0 {
            return Err(ProtocolError::ReservedBytes(7));
        }
        if total_len as usize != data_len as usize + FRAME_HEADER_SIZE {
            return Err(ProtocolError::LengthMismatch {
                total: total_len,
                data: data_len,
            });
        }
        let crc_expected = u32::from_le_bytes([buf[9], buf[10], buf[11], buf[12]]);
        let footer = [buf[13], buf[14]];
        if footer != FRAME_FOOTER {
            return Err(ProtocolError::InvalidFooter(footer));
        }

        if buf.len() < total_len as usize {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(data_len as usize).freeze();

        let crc_actual = crc32fast::hash(&payload);
        if crc_actual != crc_expected {
            return Err(ProtocolError::CrcMismatch {
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            crc32: crc_actual,
            payload,
        }))
    }

    /// Decodes a frame that must occupy `data` completely.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = BytesMut::from(data);
        match Self::decode(&mut buf)? {
            Some(frame) if buf.is_empty() => Ok(frame),
            Some(frame) => Err(ProtocolError::LengthMismatch {
                total: data.len() as u16,
                data: frame.data_length() as u16,
            }),
            None => {
                let needed = if data.len() < FRAME_HEADER_SIZE {
                    FRAME_HEADER_SIZE - data.len()
                } else {
                    u16::from_le_bytes([data[0], data[1]]) as usize - data.len()
                };
                Err(ProtocolError::IncompleteFrame { needed })
            }
        }
    }
}
