//! Panel manager: many sessions presented as one canvas.
//!
//! In multi-panel mode every configured panel gets its own session. Images
//! are scaled to the canvas, cut into tiles and sent to all panels
//! concurrently. Every fan-out awaits all panels and reports every failure.
//!
//! There is no async drop: callers must run [`PanelManager::shutdown`] on
//! every path once [`PanelManager::connect`] has been called.

use crate::config::{AppConfig, PanelDescriptor};
use crate::error::{PanelError, PanelFailure};
use crate::geometry::TileGeometry;
use bklight_client::{imaging, Connector, DisplaySession, SessionError, SessionPhase};
use bklight_protocol::Frame;
use bytes::Bytes;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;

/// Name reported for the session in single-panel mode.
pub const SINGLE_PANEL_NAME: &str = "device";

struct PanelSession<C: Connector> {
    /// `None` in single-panel mode.
    descriptor: Option<PanelDescriptor>,
    session: DisplaySession<C>,
}

impl<C: Connector> PanelSession<C> {
    fn name(&self) -> &str {
        self.descriptor
            .as_ref()
            .map_or(SINGLE_PANEL_NAME, |d| d.name.as_str())
    }

    fn failure(&self, error: SessionError) -> PanelFailure {
        PanelFailure {
            name: self.name().to_string(),
            address: self.session.address().to_string(),
            error,
        }
    }

    /// Tile of `canvas` this panel shows. The whole canvas in single mode.
    fn tile(&self, geometry: &TileGeometry, canvas: &RgbImage) -> RgbImage {
        match &self.descriptor {
            Some(d) => geometry.crop_tile(canvas, d.grid_x, d.grid_y),
            None => canvas.clone(),
        }
    }
}

/// A set of panels addressed as one canvas.
pub struct PanelManager<C: Connector> {
    panels: Vec<PanelSession<C>>,
    geometry: TileGeometry,
    /// Panel indices in the order their connections completed.
    connected: Vec<usize>,
    multi_panel: bool,
    stage_delay: Duration,
    frame_interval: Duration,
}

impl<C: Connector> PanelManager<C> {
    /// Builds one session per configured panel, or a single session for
    /// `device.address` when no panels are listed. Nothing is connected yet.
    pub fn new(config: &AppConfig, connector: Arc<C>) -> Result<Self, PanelError> {
        config
            .validate()
            .map_err(|e| PanelError::InvalidConfiguration(e.to_string()))?;

        let descriptors = config.panels.descriptors();
        let multi_panel = !descriptors.is_empty();
        let tile_width = config.panels.tile_width;
        let tile_height = config.panels.tile_height;

        let (panels, geometry) = if multi_panel {
            let (columns, rows) = config.panels.grid_size();
            let panels = descriptors
                .into_iter()
                .map(|descriptor| -> Result<PanelSession<C>, PanelError> {
                    let session_config = config.panel_session_config(&descriptor);
                    let session = DisplaySession::new(session_config, connector.clone())
                        .map_err(|e| PanelError::InvalidConfiguration(format!("{}: {}", descriptor.name, e)))?;
                    Ok(PanelSession {
                        descriptor: Some(descriptor),
                        session,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            (panels, TileGeometry::new(tile_width, tile_height, columns, rows))
        } else {
            let session_config = config.device_session_config().ok_or_else(|| {
                PanelError::InvalidConfiguration("missing device address".to_string())
            })?;
            let session = DisplaySession::new(session_config, connector)
                .map_err(|e| PanelError::InvalidConfiguration(e.to_string()))?;
            (
                vec![PanelSession {
                    descriptor: None,
                    session,
                }],
                TileGeometry::single(tile_width, tile_height),
            )
        };

        Ok(Self {
            panels,
            geometry,
            connected: Vec::new(),
            multi_panel,
            stage_delay: config.display.stage_delay(),
            frame_interval: config.display.frame_interval(),
        })
    }

    /// Canvas size in pixels.
    pub fn canvas_size(&self) -> (u32, u32) {
        self.geometry.canvas_size()
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    /// Configured pause between frames for callers that pace playback.
    pub fn frame_interval(&self) -> Duration {
        self.frame_interval
    }

    /// Configured inter-stage delay for non-streaming sends.
    pub fn stage_delay(&self) -> Duration {
        self.stage_delay
    }

    pub fn is_multi_panel(&self) -> bool {
        self.multi_panel
    }

    /// Number of sessions (and of frames per prebuffered image).
    pub fn len(&self) -> usize {
        self.panels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }

    /// Panel names and session phases, in session order.
    pub fn status(&self) -> Vec<(String, SessionPhase)> {
        self.panels
            .iter()
            .map(|p| (p.name().to_string(), p.session.phase()))
            .collect()
    }

    fn fan_out_result(&self, failures: Vec<PanelFailure>) -> Result<(), PanelError> {
        if failures.is_empty() {
            return Ok(());
        }
        if !self.multi_panel {
            if let Some(failure) = failures.into_iter().next() {
                return Err(PanelError::Session(failure));
            }
            return Ok(());
        }
        Err(PanelError::Fanout {
            failures,
            total: self.panels.len(),
        })
    }

    /// Connects every panel concurrently.
    ///
    /// If any panel fails, every panel is torn down and all failures are
    /// returned.
    pub async fn connect(&mut self) -> Result<(), PanelError> {
        tracing::info!("Connecting {} panel(s)", self.panels.len());

        let mut pending: FuturesUnordered<_> = self
            .panels
            .iter_mut()
            .enumerate()
            .map(|(index, panel)| async move {
                let result = panel.session.connect().await.map_err(|e| panel.failure(e));
                (index, result)
            })
            .collect();

        let mut connected = Vec::new();
        let mut failures = Vec::new();
        while let Some((index, result)) = pending.next().await {
            match result {
                Ok(()) => connected.push(index),
                Err(failure) => {
                    tracing::warn!("Panel {} failed to connect: {}", failure.name, failure.error);
                    failures.push(failure);
                }
            }
        }
        drop(pending);
        self.connected = connected;

        if failures.is_empty() {
            return Ok(());
        }
        self.shutdown_sessions().await;
        self.fan_out_result(failures)
    }

    /// Disconnects every session, most recently connected first. Never fails.
    pub async fn shutdown(mut self) {
        self.shutdown_sessions().await;
    }

    async fn shutdown_sessions(&mut self) {
        let mut order: Vec<usize> = self.connected.drain(..).rev().collect();
        // Sessions that never completed a connect (or were left mid-send)
        for index in 0..self.panels.len() {
            if !order.contains(&index) {
                order.push(index);
            }
        }

        for index in order {
            let panel = &mut self.panels[index];
            if panel.session.phase() != SessionPhase::Disconnected {
                tracing::debug!("Disconnecting panel {}", panel.name());
            }
            panel.session.disconnect().await;
        }
    }

    /// Sends a bitmap to the canvas.
    ///
    /// In multi-panel mode the bitmap is scaled to the canvas if needed and
    /// each panel receives its tile.
    pub async fn send_image(&mut self, image: &RgbImage, stage_delay: Duration) -> Result<(), PanelError> {
        let canvas = if self.multi_panel {
            self.geometry.fit_canvas(image)
        } else {
            image.clone()
        };

        let mut pngs = Vec::with_capacity(self.panels.len());
        for panel in &self.panels {
            let tile = panel.tile(&self.geometry, &canvas);
            let png = imaging::encode_png(&tile).map_err(|e| PanelError::Session(panel.failure(e)))?;
            pngs.push(png);
        }

        let results = join_all(self.panels.iter_mut().zip(pngs).map(|(panel, png)| async move {
            panel
                .session
                .send_image(&png, stage_delay)
                .await
                .map_err(|e| panel.failure(e))
        }))
        .await;

        self.fan_out_result(results.into_iter().filter_map(Result::err).collect())
    }

    /// Prepares the frames for one bitmap without touching any link.
    ///
    /// Each panel's tile gets that panel's rotation and brightness, is
    /// reduced to 64 colours and compressed. Returns one frame per session,
    /// in session order.
    pub fn prebuffer_image(&self, image: &RgbImage) -> Result<Vec<Bytes>, PanelError> {
        let canvas = if self.multi_panel {
            self.geometry.fit_canvas(image)
        } else {
            image.clone()
        };

        self.panels
            .iter()
            .map(|panel| {
                let config = panel.session.config();
                let tile = imaging::adjust(
                    panel.tile(&self.geometry, &canvas),
                    config.rotation,
                    config.brightness,
                );
                imaging::encode_png_compact(&tile)
                    .and_then(|png| Ok(Frame::new(png).encode()?.freeze()))
                    .map_err(|e| PanelError::Session(panel.failure(e)))
            })
            .collect()
    }

    /// Prepares the frames for a whole animation.
    pub fn prebuffer_images(&self, images: &[RgbImage]) -> Result<Vec<Vec<Bytes>>, PanelError> {
        images.iter().map(|image| self.prebuffer_image(image)).collect()
    }

    /// Sends prepared frames, `frames[i]` to session `i`.
    pub async fn send_prebuffered(&mut self, frames: &[Bytes], stage_delay: Duration) -> Result<(), PanelError> {
        self.check_frame_count(frames)?;
        let results = join_all(self.panels.iter_mut().zip(frames).map(|(panel, frame)| async move {
            panel
                .session
                .send_frame(frame, stage_delay)
                .await
                .map_err(|e| panel.failure(e))
        }))
        .await;

        self.fan_out_result(results.into_iter().filter_map(Result::err).collect())
    }

    /// Sends prepared frames with minimal inter-stage delays.
    pub async fn send_prebuffered_streaming(&mut self, frames: &[Bytes]) -> Result<(), PanelError> {
        self.check_frame_count(frames)?;
        let results = join_all(self.panels.iter_mut().zip(frames).map(|(panel, frame)| async move {
            panel
                .session
                .send_frame_streaming(frame)
                .await
                .map_err(|e| panel.failure(e))
        }))
        .await;

        self.fan_out_result(results.into_iter().filter_map(Result::err).collect())
    }

    fn check_frame_count(&self, frames: &[Bytes]) -> Result<(), PanelError> {
        if frames.len() != self.panels.len() {
            return Err(PanelError::FrameCountMismatch {
                expected: self.panels.len(),
                actual: frames.len(),
            });
        }
        Ok(())
    }
}
