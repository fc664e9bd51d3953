//! Display session: the per-panel protocol state machine.
//!
//! A session owns at most one [`DeviceLink`], stored inside its state. Every
//! send runs the full exchange in order:
//!
//! 1. first handshake, wait for its acknowledgement (required)
//! 2. second handshake, wait for its acknowledgement (optional)
//! 3. image frame written with response, wait for frame acceptance (required)
//!
//! Failures disconnect the link; with auto-reconnect the whole exchange is
//! retried on a fresh connection, so a frame may be delivered more than once.

use crate::acks::{AckState, AckWaiter};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::imaging;
use crate::link::{Connector, DeviceLink, LinkOptions, Transport};
use bklight_protocol::{Frame, HandshakeStage, HANDSHAKE_FIRST, HANDSHAKE_SECOND};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Default delay between exchange steps.
pub const DEFAULT_STAGE_DELAY: Duration = Duration::from_millis(200);

/// Session state. The link lives inside the state that owns it.
pub enum SessionState<T: Transport> {
    Disconnected,
    /// Holds the link once the peripheral accepted the connection and setup
    /// (MTU, subscription) is under way.
    Connecting(Option<DeviceLink<T>>),
    Connected(DeviceLink<T>),
    Sending(DeviceLink<T>),
}

impl<T: Transport> SessionState<T> {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Disconnected => SessionPhase::Disconnected,
            SessionState::Connecting(_) => SessionPhase::Connecting,
            SessionState::Connected(_) => SessionPhase::Connected,
            SessionState::Sending(_) => SessionPhase::Sending,
        }
    }
}

/// Observable session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
    Sending,
}

/// Delays applied within one exchange.
#[derive(Debug, Clone, Copy)]
struct Pacing {
    /// After each handshake acknowledgement (or skip).
    stage_delay: Duration,
    /// After the frame acknowledgement.
    settle: Duration,
}

/// A session with one panel.
pub struct DisplaySession<C: Connector> {
    config: SessionConfig,
    connector: Arc<C>,
    state: SessionState<C::Transport>,
}

impl<C: Connector> DisplaySession<C> {
    /// Creates a session (not yet connected).
    pub fn new(config: SessionConfig, connector: Arc<C>) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            state: SessionState::Disconnected,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    /// Whether the session is idle on a live link.
    pub fn is_connected(&self) -> bool {
        match &self.state {
            SessionState::Connected(link) => link.is_connected(),
            _ => false,
        }
    }

    fn link_options(&self) -> LinkOptions {
        LinkOptions {
            scan_timeout: self.config.scan_timeout,
            mtu: self.config.mtu,
        }
    }

    fn should_retry(&self, error: &SessionError, attempt: u32) -> bool {
        self.config.auto_reconnect && error.is_retryable() && attempt <= self.config.max_retries
    }

    /// Connects to the panel, retrying per the session's policy.
    ///
    /// On failure the session is left disconnected and the last error is
    /// returned.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.is_connected() {
                return Ok(());
            }
            // Drop whatever is left of a previous link first
            self.disconnect().await;

            self.state = SessionState::Connecting(None);
            tracing::debug!("Connecting to {} (attempt {})", self.config.address, attempt);

            let options = self.link_options();
            let opened = DeviceLink::connect(self.connector.as_ref(), &self.config.address, &options).await;
            let result = match opened {
                Ok(link) => {
                    // Reachable from disconnect() if setup is cancelled
                    self.state = SessionState::Connecting(Some(link));
                    match &mut self.state {
                        SessionState::Connecting(Some(link)) => link.establish(&options).await,
                        _ => Ok(()),
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.state = match std::mem::replace(&mut self.state, SessionState::Disconnected) {
                        SessionState::Connecting(Some(link)) => SessionState::Connected(link),
                        other => other,
                    };
                    tracing::info!("Connected to {}", self.config.address);
                    return Ok(());
                }
                Err(e) => {
                    self.disconnect().await;
                    if !self.should_retry(&e, attempt) {
                        tracing::debug!("Giving up on {}: {}", self.config.address, e);
                        return Err(e);
                    }
                    tracing::warn!(
                        "Connect to {} failed (attempt {}): {}; retrying in {:?}",
                        self.config.address,
                        attempt,
                        e,
                        self.config.reconnect_delay
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    /// Connects unless already idle on a live link.
    ///
    /// A session left in `Connecting` or `Sending` by a cancelled call is
    /// reconnected.
    pub async fn ensure_connected(&mut self) -> Result<(), SessionError> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect().await
    }

    /// Tears down the link, if any. Idempotent; never fails.
    pub async fn disconnect(&mut self) {
        match &mut self.state {
            SessionState::Connected(link)
            | SessionState::Sending(link)
            | SessionState::Connecting(Some(link)) => {
                link.disconnect().await;
            }
            SessionState::Disconnected | SessionState::Connecting(None) => {}
        }
        self.state = SessionState::Disconnected;
    }

    /// Sends an already-encoded frame.
    pub async fn send_frame(&mut self, frame: &[u8], stage_delay: Duration) -> Result<(), SessionError> {
        self.deliver(
            frame,
            Pacing {
                stage_delay,
                settle: stage_delay,
            },
        )
        .await
    }

    /// Sends an already-encoded frame with minimal inter-stage delays.
    pub async fn send_frame_streaming(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        self.deliver(
            frame,
            Pacing {
                stage_delay: self.config.streaming_stage_delay,
                settle: Duration::ZERO,
            },
        )
        .await
    }

    /// Applies this panel's rotation and brightness to an encoded image,
    /// frames it and sends it.
    pub async fn send_image(&mut self, image: &[u8], stage_delay: Duration) -> Result<(), SessionError> {
        let frame = self.prepare_frame(image)?;
        self.send_frame(&frame, stage_delay).await
    }

    /// Produces the frame `send_image` would send, without sending it.
    pub fn prepare_frame(&self, image: &[u8]) -> Result<Bytes, SessionError> {
        let processed = imaging::adjust_png(image, self.config.rotation, self.config.brightness)?;
        Ok(Frame::new(processed).encode()?.freeze())
    }

    async fn deliver(&mut self, frame: &[u8], pacing: Pacing) -> Result<(), SessionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            // connect() applies the retry budget on its own
            self.ensure_connected().await?;

            match self.exchange(frame, pacing).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.disconnect().await;
                    if !self.should_retry(&e, attempt) {
                        tracing::warn!("Send to {} failed: {}", self.config.address, e);
                        return Err(e);
                    }
                    tracing::warn!(
                        "Send to {} failed (attempt {}): {}; reconnecting in {:?}",
                        self.config.address,
                        attempt,
                        e,
                        self.config.reconnect_delay
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    async fn exchange(&mut self, frame: &[u8], pacing: Pacing) -> Result<(), SessionError> {
        self.state = match std::mem::replace(&mut self.state, SessionState::Disconnected) {
            SessionState::Connected(link) => SessionState::Sending(link),
            other => {
                self.state = other;
                return Err(SessionError::ConnectionFailed(format!(
                    "{} is not connected",
                    self.config.address
                )));
            }
        };

        let Self { config, state, .. } = &mut *self;
        let result = match state {
            SessionState::Sending(link) => run_exchange(link, config, frame, pacing).await,
            _ => Err(SessionError::ConnectionFailed(format!(
                "{} lost its link",
                config.address
            ))),
        };

        if result.is_ok() {
            self.state = match std::mem::replace(&mut self.state, SessionState::Disconnected) {
                SessionState::Sending(link) => SessionState::Connected(link),
                other => other,
            };
        }
        result
    }
}

async fn run_exchange<T: Transport>(
    link: &mut DeviceLink<T>,
    config: &SessionConfig,
    frame: &[u8],
    pacing: Pacing,
) -> Result<(), SessionError> {
    let waiter = AckWaiter {
        address: &config.address,
        matcher: config.ack_matcher,
        log_notifications: config.log_notifications,
    };
    let mut acks = AckState::new();
    let stale = link.drain_notifications();
    if stale > 0 {
        tracing::debug!("{}: discarded {} stale notifications", config.address, stale);
    }

    link.write(&HANDSHAKE_FIRST, false).await?;
    waiter
        .wait(
            &mut acks,
            link.notifications(),
            HandshakeStage::First,
            config.ack_timeout,
        )
        .await?;
    tokio::time::sleep(pacing.stage_delay).await;

    acks.clear(HandshakeStage::Second);
    link.write(&HANDSHAKE_SECOND, false).await?;
    match waiter
        .wait(
            &mut acks,
            link.notifications(),
            HandshakeStage::Second,
            config.second_stage_timeout,
        )
        .await
    {
        Ok(()) => {}
        Err(SessionError::HandshakeTimeout { stage, .. }) => {
            tracing::debug!("{}: {}_SKIPPED", config.address, stage);
        }
        Err(e) => return Err(e),
    }
    tokio::time::sleep(pacing.stage_delay).await;

    link.write(frame, true).await?;
    waiter
        .wait(
            &mut acks,
            link.notifications(),
            HandshakeStage::FrameAck,
            config.ack_timeout,
        )
        .await?;
    tokio::time::sleep(pacing.settle).await;

    tracing::debug!("{}: frame delivered ({} bytes)", config.address, frame.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::Rotation;
    use crate::loopback::{LoopbackConnector, PanelBehavior};
    use bklight_protocol::AckMatcher;
    use image::{Rgb, RgbImage};
    use tokio::time::Instant;

    const ADDR: &str = "F0:27:3C:1A:8B:C3";

    fn panel(behavior: PanelBehavior) -> Arc<LoopbackConnector> {
        let connector = LoopbackConnector::new();
        connector.add_panel(ADDR, behavior);
        Arc::new(connector)
    }

    fn session(connector: &Arc<LoopbackConnector>, max_retries: u32) -> DisplaySession<LoopbackConnector> {
        let config = SessionConfig::new(ADDR)
            .with_max_retries(max_retries)
            .with_reconnect_delay(Duration::from_millis(500));
        DisplaySession::new(config, connector.clone()).unwrap()
    }

    fn test_frame() -> Bytes {
        Frame::new(Bytes::from_static(b"\x89PNG test")).encode().unwrap().freeze()
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_frame_runs_full_exchange() {
        let connector = panel(PanelBehavior::default());
        let mut session = session(&connector, 3);
        session.connect().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Connected);

        let frame = test_frame();
        session.send_frame(&frame, DEFAULT_STAGE_DELAY).await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Connected);

        let stats = connector.stats(ADDR);
        assert_eq!(stats.writes.len(), 3);
        assert_eq!(stats.writes[0].data.as_ref(), &HANDSHAKE_FIRST[..]);
        assert!(!stats.writes[0].with_response);
        assert_eq!(stats.writes[1].data.as_ref(), &HANDSHAKE_SECOND[..]);
        assert!(!stats.writes[1].with_response);
        assert_eq!(stats.writes[2].data, frame);
        assert!(stats.writes[2].with_response);
        assert_eq!(stats.frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_connects_on_demand() {
        let connector = panel(PanelBehavior::default());
        let mut session = session(&connector, 0);

        session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await.unwrap();
        assert_eq!(connector.stats(ADDR).connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_first_ack_retries_whole_exchange() {
        for max_retries in [0, 1, 3] {
            let connector = panel(PanelBehavior {
                acks_first: false,
                ..PanelBehavior::default()
            });
            let mut session = session(&connector, max_retries);

            let result = session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await;
            assert!(matches!(
                result,
                Err(SessionError::HandshakeTimeout {
                    stage: HandshakeStage::First,
                    ..
                })
            ));

            let stats = connector.stats(ADDR);
            assert_eq!(stats.first_handshakes, max_retries + 1);
            assert_eq!(stats.connections, max_retries + 1);
            assert_eq!(stats.second_handshakes, 0);
            assert!(stats.frames.is_empty());
            assert_eq!(session.phase(), SessionPhase::Disconnected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_second_ack_is_skipped() {
        let connector = panel(PanelBehavior {
            acks_second: false,
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 0);

        session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await.unwrap();

        let stats = connector.stats(ADDR);
        assert_eq!(stats.first_handshakes, 1);
        assert_eq!(stats.second_handshakes, 1);
        assert_eq!(stats.frames.len(), 1);
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_frame_ack_fails() {
        let connector = panel(PanelBehavior {
            acks_frame: false,
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 1);

        let result = session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await;
        assert!(matches!(
            result,
            Err(SessionError::HandshakeTimeout {
                stage: HandshakeStage::FrameAck,
                ..
            })
        ));
        // Delivered twice, never acknowledged
        assert_eq!(connector.stats(ADDR).frames.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_auto_reconnect_fails_fast() {
        let connector = panel(PanelBehavior {
            failed_connects: 1,
            ..PanelBehavior::default()
        });
        let config = SessionConfig::new(ADDR).with_auto_reconnect(false);
        let mut session = DisplaySession::new(config, connector.clone()).unwrap();

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
        assert_eq!(connector.stats(ADDR).connect_attempts, 1);
        assert_eq!(session.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_fixed_delay() {
        let connector = panel(PanelBehavior {
            failed_connects: 2,
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 3);
        let started = Instant::now();

        session.connect().await.unwrap();

        assert_eq!(connector.stats(ADDR).connect_attempts, 3);
        assert!(session.is_connected());
        // Two failures, two fixed 500ms delays
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_budget() {
        let connector = panel(PanelBehavior {
            failed_connects: 10,
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 2);

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
        assert_eq!(connector.stats(ADDR).connect_attempts, 3);
        assert_eq!(session.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found_is_retried() {
        let connector = Arc::new(LoopbackConnector::new());
        let config = SessionConfig::new(ADDR)
            .with_max_retries(1)
            .with_reconnect_delay(Duration::from_secs(2))
            .with_scan_timeout(Duration::from_secs(6));
        let mut session = DisplaySession::new(config, connector).unwrap();
        let started = Instant::now();

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::DeviceNotFound { .. })));
        // Two scans and one delay
        assert!(started.elapsed() >= Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_reconnects_and_retries() {
        let connector = panel(PanelBehavior {
            failed_writes: 1,
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 3);

        session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await.unwrap();

        let stats = connector.stats(ADDR);
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.close_calls, 1);
        assert_eq!(stats.frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_link_is_reconnected() {
        let connector = panel(PanelBehavior::default());
        let mut session = session(&connector, 0);
        session.connect().await.unwrap();

        connector.drop_link(ADDR);
        assert!(!session.is_connected());

        session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await.unwrap();
        assert_eq!(connector.stats(ADDR).connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_variant_acks() {
        let behavior = PanelBehavior {
            variant_acks: true,
            ..PanelBehavior::default()
        };

        let connector = panel(behavior.clone());
        let mut strict = session(&connector, 0);
        let result = strict.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await;
        assert!(matches!(result, Err(SessionError::HandshakeTimeout { .. })));

        let connector = panel(behavior);
        let config = SessionConfig::new(ADDR)
            .with_max_retries(0)
            .with_ack_matcher(AckMatcher::FirmwareTolerant);
        let mut tolerant = DisplaySession::new(config, connector.clone()).unwrap();
        tolerant.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await.unwrap();
        assert_eq!(connector.stats(ADDR).frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_stage_timeout_is_configurable() {
        let connector = panel(PanelBehavior {
            acks_second: false,
            ..PanelBehavior::default()
        });
        let config = SessionConfig::new(ADDR)
            .with_second_stage_timeout(Duration::from_secs(5));
        let mut session = DisplaySession::new(config, connector).unwrap();
        session.connect().await.unwrap();

        let started = Instant::now();
        session.send_frame(&test_frame(), Duration::ZERO).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_uses_short_delays() {
        let connector = panel(PanelBehavior::default());
        let mut session = session(&connector, 0);
        session.connect().await.unwrap();

        let started = Instant::now();
        session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(600));

        let started = Instant::now();
        session.send_frame_streaming(&test_frame()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(connector.stats(ADDR).frames.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_image_applies_adjustments() {
        let connector = panel(PanelBehavior::default());
        let config = SessionConfig::new(ADDR)
            .with_rotation(Rotation::Deg180)
            .with_brightness(0.5);
        let mut session = DisplaySession::new(config, connector.clone()).unwrap();

        let mut source = RgbImage::new(4, 4);
        source.put_pixel(0, 0, Rgb([200, 100, 50]));
        let png = imaging::encode_png(&source).unwrap();

        session.send_image(&png, Duration::ZERO).await.unwrap();

        let stats = connector.stats(ADDR);
        let sent = image::load_from_memory(stats.frames[0].payload())
            .unwrap()
            .to_rgb8();
        assert_eq!(sent.get_pixel(3, 3), &Rgb([100, 50, 25]));
        assert_eq!(sent.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_exchange_is_cleaned_up() {
        let connector = panel(PanelBehavior {
            acks_first: false,
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 0);

        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(session.phase(), SessionPhase::Sending);

        session.disconnect().await;
        assert_eq!(session.phase(), SessionPhase::Disconnected);
        let stats = connector.stats(ADDR);
        assert_eq!(stats.unsubscribe_calls, 1);
        assert_eq!(stats.close_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_exchange_reconnects_on_next_send() {
        let connector = panel(PanelBehavior {
            acks_first: false,
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 0);
        let _ = tokio::time::timeout(
            Duration::from_secs(1),
            session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY),
        )
        .await;

        connector.update_behavior(ADDR, |b| b.acks_first = true);
        session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await.unwrap();
        assert_eq!(connector.stats(ADDR).connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_keeps_link_reachable() {
        let connector = panel(PanelBehavior {
            subscribe_latency: Duration::from_secs(5),
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 0);

        let cancelled = tokio::time::timeout(Duration::from_secs(1), session.connect()).await;
        assert!(cancelled.is_err());
        assert_eq!(session.phase(), SessionPhase::Connecting);
        assert!(!session.is_connected());
        assert_eq!(connector.stats(ADDR).connections, 1);
        assert_eq!(connector.stats(ADDR).close_calls, 0);

        session.disconnect().await;
        assert_eq!(session.phase(), SessionPhase::Disconnected);
        assert_eq!(connector.stats(ADDR).close_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_before_setup_reconnects() {
        let connector = panel(PanelBehavior {
            subscribe_latency: Duration::from_secs(5),
            ..PanelBehavior::default()
        });
        let mut session = session(&connector, 0);
        let _ = tokio::time::timeout(Duration::from_secs(1), session.connect()).await;

        connector.update_behavior(ADDR, |b| b.subscribe_latency = Duration::ZERO);
        session.send_frame(&test_frame(), DEFAULT_STAGE_DELAY).await.unwrap();

        let stats = connector.stats(ADDR);
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.close_calls, 1);
        assert_eq!(stats.frames_accepted, 1);
    }

    #[test]
    fn test_missing_address_is_invalid() {
        let connector = Arc::new(LoopbackConnector::new());
        let result = DisplaySession::new(SessionConfig::new(""), connector);
        assert!(matches!(result, Err(SessionError::InvalidConfiguration(_))));
    }
}
