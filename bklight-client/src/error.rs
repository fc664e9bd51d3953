//! Session error types.

use bklight_protocol::HandshakeStage;
use std::time::Duration;
use thiserror::Error;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("device {address} not found within {timeout:?}")]
    DeviceNotFound { address: String, timeout: Duration },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{stage} acknowledgement not received within {timeout:?}")]
    HandshakeTimeout {
        stage: HandshakeStage,
        timeout: Duration,
    },

    #[error("characteristic write failed: {0}")]
    TransportWrite(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] bklight_protocol::ProtocolError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl SessionError {
    /// Returns whether the retry policy may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::DeviceNotFound { .. }
                | SessionError::ConnectionFailed(_)
                | SessionError::HandshakeTimeout { .. }
                | SessionError::TransportWrite(_)
        )
    }
}
