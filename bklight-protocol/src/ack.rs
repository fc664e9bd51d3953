//! Acknowledgement notifications.
//!
//! The panel answers each step of an exchange with a fixed notification on
//! the notify characteristic. These are literal byte patterns, not sequence
//! numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Acknowledgement for the first handshake command.
pub const ACK_FIRST: [u8; 12] = [
    0x0C, 0x00, 0x01, 0x80, 0x81, 0x06, 0x32, 0x00, 0x00, 0x01, 0x00, 0x01,
];

/// Acknowledgement for the second handshake command.
pub const ACK_SECOND: [u8; 8] = [0x08, 0x00, 0x05, 0x80, 0x0B, 0x03, 0x07, 0x02];

/// Acknowledgement that an image frame was accepted.
pub const ACK_FRAME: [u8; 5] = [0x05, 0x00, 0x02, 0x00, 0x03];

/// Second-stage prefix sent by some firmware revisions instead of [`ACK_SECOND`].
pub const ACK_SECOND_ALT_PREFIX: [u8; 5] = [0x08, 0x00, 0x05, 0x80, 0x0E];

/// Number of leading bytes compared by [`AckMatcher::FirmwareTolerant`].
pub const TOLERANT_PREFIX_LEN: usize = 5;

/// A step of the image exchange that the panel acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStage {
    First,
    Second,
    FrameAck,
}

impl HandshakeStage {
    pub const ALL: [HandshakeStage; 3] = [
        HandshakeStage::First,
        HandshakeStage::Second,
        HandshakeStage::FrameAck,
    ];

    /// The exact notification the panel sends for this stage.
    pub fn expected_ack(&self) -> &'static [u8] {
        match self {
            HandshakeStage::First => &ACK_FIRST,
            HandshakeStage::Second => &ACK_SECOND,
            HandshakeStage::FrameAck => &ACK_FRAME,
        }
    }

    /// Whether a missing acknowledgement for this stage fails the exchange.
    pub fn is_required(&self) -> bool {
        !matches!(self, HandshakeStage::Second)
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStage::First => write!(f, "HANDSHAKE_STAGE_ONE"),
            HandshakeStage::Second => write!(f, "HANDSHAKE_STAGE_TWO"),
            HandshakeStage::FrameAck => write!(f, "FRAME_ACK"),
        }
    }
}

/// Strategy for recognising acknowledgement notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMatcher {
    /// Whole-payload literal comparison.
    #[default]
    Exact,
    /// Compares only the first five bytes of the handshake acknowledgements
    /// and accepts the alternate second-stage prefix. Frame acceptance is
    /// still matched exactly.
    FirmwareTolerant,
}

impl AckMatcher {
    /// Returns the stage acknowledged by `payload`, if any.
    pub fn classify(&self, payload: &[u8]) -> Option<HandshakeStage> {
        match self {
            AckMatcher::Exact => HandshakeStage::ALL
                .into_iter()
                .find(|stage| payload == stage.expected_ack()),
            AckMatcher::FirmwareTolerant => {
                if payload == ACK_FRAME {
                    Some(HandshakeStage::FrameAck)
                } else if payload.starts_with(&ACK_FIRST[..TOLERANT_PREFIX_LEN]) {
                    Some(HandshakeStage::First)
                } else if payload.starts_with(&ACK_SECOND[..TOLERANT_PREFIX_LEN])
                    || payload.starts_with(&ACK_SECOND_ALT_PREFIX)
                {
                    Some(HandshakeStage::Second)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_classification() {
        let matcher = AckMatcher::Exact;
        assert_eq!(matcher.classify(&ACK_FIRST), Some(HandshakeStage::First));
        assert_eq!(matcher.classify(&ACK_SECOND), Some(HandshakeStage::Second));
        assert_eq!(matcher.classify(&ACK_FRAME), Some(HandshakeStage::FrameAck));
    }

    #[test]
    fn test_exact_rejects_unrelated() {
        let matcher = AckMatcher::Exact;
        assert_eq!(matcher.classify(&[]), None);
        assert_eq!(matcher.classify(&[0xDE, 0xAD, 0xBE, 0xEF]), None);
        assert_eq!(matcher.classify(&[0x05, 0x00, 0x00, 0x01, 0x00]), None);
        // Prefix alone is not enough
        assert_eq!(matcher.classify(&ACK_FIRST[..5]), None);
        // Nor is a longer payload
        let mut longer = ACK_FRAME.to_vec();
        longer.push(0x00);
        assert_eq!(matcher.classify(&longer), None);
    }

    #[test]
    fn test_tolerant_prefix_matching() {
        let matcher = AckMatcher::FirmwareTolerant;
        let first_variant = [0x0C, 0x00, 0x01, 0x80, 0x81, 0x06, 0x33, 0x01];
        assert_eq!(matcher.classify(&first_variant), Some(HandshakeStage::First));

        let second_variant = [0x08, 0x00, 0x05, 0x80, 0x0E, 0x03, 0x07, 0x01];
        assert_eq!(
            matcher.classify(&second_variant),
            Some(HandshakeStage::Second)
        );
        assert_eq!(matcher.classify(&ACK_SECOND), Some(HandshakeStage::Second));
        assert_eq!(matcher.classify(&ACK_FRAME), Some(HandshakeStage::FrameAck));
        assert_eq!(matcher.classify(&[0x05, 0x00, 0x02, 0x00]), None);
        assert_eq!(matcher.classify(&[0x01, 0x02, 0x03]), None);
    }

    #[test]
    fn test_only_second_stage_is_optional() {
        assert!(HandshakeStage::First.is_required());
        assert!(!HandshakeStage::Second.is_required());
        assert!(HandshakeStage::FrameAck.is_required());
    }

    #[test]
    fn test_matcher_serialization() {
        let parsed: AckMatcher = serde_yaml::from_str("firmware_tolerant").unwrap();
        assert_eq!(parsed, AckMatcher::FirmwareTolerant);
        assert_eq!(serde_yaml::to_string(&AckMatcher::Exact).unwrap().trim(), "exact");
    }
}
