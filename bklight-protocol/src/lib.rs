//! # bklight-protocol
//!
//! Wire protocol for BK-Light LED matrix panels, tunneled through two GATT
//! characteristics.
//!
//! This crate provides:
//! - Image framing with length fields, CRC32 and footer
//! - The fixed handshake commands
//! - Acknowledgement classification (exact and firmware-tolerant)
//! - GATT characteristic UUIDs

pub mod ack;
pub mod error;
pub mod frame;

pub use ack::{AckMatcher, HandshakeStage};
pub use error::ProtocolError;
pub use frame::{Frame, FRAME_FOOTER, FRAME_HEADER_SIZE, IMAGE_OPCODE, MAX_PAYLOAD_SIZE};

use uuid::Uuid;

/// Characteristic the host writes commands and frames to.
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fa02_0000_1000_8000_00805f9b34fb);

/// Characteristic the panel sends acknowledgements on.
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fa03_0000_1000_8000_00805f9b34fb);

/// Advertised local names of BK-Light panels start with this.
pub const PANEL_NAME_PREFIX: &str = "LED_BLE";

/// First handshake command, written without response.
pub const HANDSHAKE_FIRST: [u8; 8] = [0x08, 0x00, 0x01, 0x80, 0x0E, 0x06, 0x32, 0x00];

/// Second handshake command, written without response.
pub const HANDSHAKE_SECOND: [u8; 4] = [0x04, 0x00, 0x05, 0x80];

/// Formats bytes as dash-separated upper-case hex (`0C-00-01-80`).
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            WRITE_CHARACTERISTIC.to_string(),
            "0000fa02-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            NOTIFY_CHARACTERISTIC.to_string(),
            "0000fa03-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&HANDSHAKE_SECOND), "04-00-05-80");
        assert_eq!(hex_dump(&[]), "");
    }
}
