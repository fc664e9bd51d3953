//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while building or parsing image frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} byte payload (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("incomplete frame: need {needed} more bytes")]
    IncompleteFrame { needed: usize },

    #[error("unexpected opcode: {0:#04x}")]
    UnexpectedOpcode(u8),

    #[error("invalid frame footer: {0:02x?}")]
    InvalidFooter([u8; 2]),

    #[error("non-zero reserved bytes at offset {0}")]
    ReservedBytes(usize),

    #[error("length mismatch: total length {total} does not match data length {data}")]
    LengthMismatch { total: u16, data: u16 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
}
