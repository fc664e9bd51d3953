//! Per-exchange acknowledgement tracking.

use crate::error::SessionError;
use crate::link::NotificationReceiver;
use bklight_protocol::{hex_dump, AckMatcher, HandshakeStage};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// Latches for one exchange, one per stage.
///
/// Created fresh for every send attempt. Notifications that arrive while
/// waiting for one stage are latched for later stages, so an early
/// acknowledgement is not lost.
#[derive(Debug, Default)]
pub struct AckState {
    first: bool,
    second: bool,
    frame: bool,
    last_payload: Option<Bytes>,
}

impl AckState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self, stage: HandshakeStage) -> bool {
        match stage {
            HandshakeStage::First => self.first,
            HandshakeStage::Second => self.second,
            HandshakeStage::FrameAck => self.frame,
        }
    }

    pub fn set(&mut self, stage: HandshakeStage) {
        *self.latch(stage) = true;
    }

    pub fn clear(&mut self, stage: HandshakeStage) {
        *self.latch(stage) = false;
    }

    /// Most recent notification payload, recognised or not.
    pub fn last_payload(&self) -> Option<&Bytes> {
        self.last_payload.as_ref()
    }

    fn latch(&mut self, stage: HandshakeStage) -> &mut bool {
        match stage {
            HandshakeStage::First => &mut self.first,
            HandshakeStage::Second => &mut self.second,
            HandshakeStage::FrameAck => &mut self.frame,
        }
    }

    /// Classifies one notification and latches the stage it acknowledges.
    pub fn observe(&mut self, payload: Bytes, matcher: AckMatcher) -> Option<HandshakeStage> {
        let stage = matcher.classify(&payload);
        if let Some(stage) = stage {
            self.set(stage);
        }
        self.last_payload = Some(payload);
        stage
    }
}

/// Waits on a notification channel until `stage` is latched.
pub struct AckWaiter<'a> {
    pub address: &'a str,
    pub matcher: AckMatcher,
    pub log_notifications: bool,
}

impl AckWaiter<'_> {
    /// Returns `HandshakeTimeout` if the stage is not acknowledged in time and
    /// `ConnectionFailed` if the notification stream ends.
    pub async fn wait(
        &self,
        state: &mut AckState,
        notifications: &mut NotificationReceiver,
        stage: HandshakeStage,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;

        while !state.is_set(stage) {
            let payload = match tokio::time::timeout_at(deadline, notifications.recv()).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    return Err(SessionError::ConnectionFailed(format!(
                        "notification stream from {} closed",
                        self.address
                    )))
                }
                Err(_) => {
                    tracing::debug!("{}: {}_TIMEOUT", self.address, stage);
                    return Err(SessionError::HandshakeTimeout { stage, timeout });
                }
            };

            if self.log_notifications {
                tracing::info!("{}: NOTIF {}", self.address, hex_dump(&payload));
            } else {
                tracing::trace!("{}: NOTIF {}", self.address, hex_dump(&payload));
            }

            if state.observe(payload, self.matcher).is_none() {
                tracing::debug!("{}: ignoring unrecognised notification", self.address);
            }
        }

        tracing::debug!("{}: {}_OK", self.address, stage);
        Ok(())
    }
}
