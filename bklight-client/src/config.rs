//! Session configuration.

use crate::error::SessionError;
use crate::imaging::Rotation;
use bklight_protocol::AckMatcher;
use std::time::Duration;

/// Default MTU requested after connecting.
pub const DEFAULT_MTU: u16 = 512;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Timeout for the load-bearing acknowledgements (first handshake, frame).
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the optional second-stage acknowledgement.
pub const DEFAULT_SECOND_STAGE_TIMEOUT: Duration = Duration::from_millis(500);

/// Delay between exchange steps when streaming back-to-back frames.
pub const DEFAULT_STREAMING_STAGE_DELAY: Duration = Duration::from_millis(20);

/// Minimum brightness factor accepted.
pub const MIN_BRIGHTNESS: f32 = 0.1;

/// Maximum brightness factor accepted.
pub const MAX_BRIGHTNESS: f32 = 1.0;

/// Configuration for one display session. Owned by the session built from it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device address (MAC on Linux/Windows, UUID on macOS).
    pub address: String,
    /// Retry connects and exchanges after failures.
    pub auto_reconnect: bool,
    /// Fixed delay between attempts.
    pub reconnect_delay: Duration,
    /// MTU to request (0 skips negotiation).
    pub mtu: u16,
    /// Rotation applied by `send_image`.
    pub rotation: Rotation,
    /// Brightness factor applied by `send_image`.
    pub brightness: f32,
    /// Log every inbound notification at info level.
    pub log_notifications: bool,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// How long to scan for the device before giving up.
    pub scan_timeout: Duration,
    /// Timeout for the first handshake and frame acknowledgements.
    pub ack_timeout: Duration,
    /// Timeout for the optional second handshake acknowledgement.
    pub second_stage_timeout: Duration,
    /// Inter-stage delay used by streaming sends.
    pub streaming_stage_delay: Duration,
    /// Acknowledgement matching strategy.
    pub ack_matcher: AckMatcher,
}

impl SessionConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(2),
            mtu: DEFAULT_MTU,
            rotation: Rotation::None,
            brightness: 1.0,
            log_notifications: false,
            max_retries: DEFAULT_MAX_RETRIES,
            scan_timeout: Duration::from_secs(6),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            second_stage_timeout: DEFAULT_SECOND_STAGE_TIMEOUT,
            streaming_stage_delay: DEFAULT_STREAMING_STAGE_DELAY,
            ack_matcher: AckMatcher::Exact,
        }
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_brightness(mut self, brightness: f32) -> Self {
        self.brightness = brightness.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS);
        self
    }

    pub fn with_log_notifications(mut self, enabled: bool) -> Self {
        self.log_notifications = enabled;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_second_stage_timeout(mut self, timeout: Duration) -> Self {
        self.second_stage_timeout = timeout;
        self
    }

    pub fn with_streaming_stage_delay(mut self, delay: Duration) -> Self {
        self.streaming_stage_delay = delay;
        self
    }

    pub fn with_ack_matcher(mut self, matcher: AckMatcher) -> Self {
        self.ack_matcher = matcher;
        self
    }

    /// Checks that the configuration can address a device.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.address.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "missing device address".to_string(),
            ));
        }
        Ok(())
    }
}
