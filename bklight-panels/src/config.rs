//! Application configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (`--config`, BKLIGHT_CONFIG, or `./config.yaml` if present)
//! 3. Environment variables
//!
//! Command-line overrides are applied by the binary on top of the result.
//! Sessions never read the environment; they receive a [`SessionConfig`]
//! built from the normalized configuration.

use bklight_client::config::{MAX_BRIGHTNESS, MIN_BRIGHTNESS};
use bklight_client::{Rotation, SessionConfig};
use bklight_protocol::AckMatcher;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file used when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Largest canvas accepted, in pixels.
pub const MAX_CANVAS_PIXELS: u32 = 16 * 1024 * 1024;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Device defaults (and the single-panel address).
    pub device: DeviceConfig,
    /// Display and retry settings.
    pub display: DisplayConfig,
    /// Multi-panel layout.
    pub panels: PanelsConfig,
}

impl AppConfig {
    /// Loads configuration from `path`, BKLIGHT_CONFIG or `./config.yaml`,
    /// then applies environment overrides and normalizes.
    ///
    /// An explicitly named file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("BKLIGHT_CONFIG").map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    /// Loads configuration from a YAML file, without overrides or normalization.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        // An empty file is an empty mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AppConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_yaml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Serializes the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Applies environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup("BKLIGHT_ADDRESS") {
            if !address.trim().is_empty() {
                self.device.address = Some(address.trim().to_string());
            }
        }
        if let Some(mtu) = lookup("BKLIGHT_MTU") {
            if let Ok(parsed) = mtu.trim().parse() {
                self.device.mtu = parsed;
            }
        }
        if let Some(brightness) = lookup("BKLIGHT_BRIGHTNESS") {
            if let Ok(parsed) = brightness.trim().parse() {
                self.device.brightness = parsed;
            }
        }
        if let Some(enabled) = lookup("BKLIGHT_AUTO_RECONNECT") {
            self.device.auto_reconnect = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Some(retries) = lookup("BKLIGHT_MAX_RETRIES") {
            if let Ok(parsed) = retries.trim().parse() {
                self.display.max_retries = parsed;
            }
        }
    }

    /// Clamps out-of-range values, drops unusable panel entries and derives
    /// the layout. Idempotent.
    pub fn normalize(&mut self) {
        self.device.normalize();
        self.panels.normalize();
    }

    /// Checks that there is something to connect to.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.is_multi_panel() && self.device.address().is_none() {
            return Err(ConfigError::ValidationError(
                "no panel configured; set device.address or define panels.list".to_string(),
            ));
        }
        if self.panels.tile_width == 0 || self.panels.tile_height == 0 {
            return Err(ConfigError::ValidationError(
                "panels.tile_width and panels.tile_height must be positive".to_string(),
            ));
        }
        if self.is_multi_panel() {
            let (columns, rows) = self.panels.grid_size();
            let width = columns.checked_mul(self.panels.tile_width);
            let height = rows.checked_mul(self.panels.tile_height);
            let pixels = width.zip(height).and_then(|(w, h)| w.checked_mul(h));
            if pixels.map_or(true, |pixels| pixels > MAX_CANVAS_PIXELS) {
                return Err(ConfigError::ValidationError(format!(
                    "canvas of {}x{} tiles of {}x{} pixels is too large",
                    columns, rows, self.panels.tile_width, self.panels.tile_height
                )));
            }
        }
        Ok(())
    }

    /// Points the configuration at a discovered device: `device.address`
    /// and the address of the first panel entry, adding one if the list is
    /// empty.
    pub fn assign_device(&mut self, address: &str) {
        let address = address.trim().to_string();
        self.device.address = Some(address.clone());
        match self.panels.list.first_mut() {
            None => self.panels.list.push(PanelEntry::Address(address)),
            Some(PanelEntry::Address(existing)) => *existing = address,
            Some(PanelEntry::Detailed(entry)) => entry.address = Some(address),
        }
    }

    /// Whether a panel list is configured.
    pub fn is_multi_panel(&self) -> bool {
        !self.panels.descriptors().is_empty()
    }

    /// Session configuration for the single configured device.
    pub fn device_session_config(&self) -> Option<SessionConfig> {
        let address = self.device.address()?;
        Some(self.session_config(address, None, None))
    }

    /// Session configuration for one panel, falling back to device defaults.
    pub fn panel_session_config(&self, panel: &PanelDescriptor) -> SessionConfig {
        self.session_config(&panel.address, panel.rotation, panel.brightness)
    }

    fn session_config(
        &self,
        address: &str,
        rotation: Option<Rotation>,
        brightness: Option<f32>,
    ) -> SessionConfig {
        let device = &self.device;
        let display = &self.display;
        SessionConfig::new(address)
            .with_auto_reconnect(device.auto_reconnect)
            .with_reconnect_delay(secs(device.reconnect_delay))
            .with_mtu(device.mtu)
            .with_rotation(rotation.unwrap_or_else(|| device.rotation()))
            .with_brightness(brightness.unwrap_or(device.brightness))
            .with_log_notifications(display.log_notifications)
            .with_max_retries(display.max_retries)
            .with_scan_timeout(secs(device.scan_timeout))
            .with_ack_timeout(secs(device.ack_timeout))
            .with_second_stage_timeout(secs(device.second_stage_timeout))
            .with_streaming_stage_delay(secs(display.streaming_stage_delay))
            .with_ack_matcher(device.ack_matching)
    }
}

/// Converts seconds to a duration, treating negative or invalid values as zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Address of the single panel (MAC, or UUID on macOS).
    pub address: Option<String>,
    /// Retry connects and sends after failures.
    pub auto_reconnect: bool,
    /// Delay between attempts, in seconds.
    pub reconnect_delay: f64,
    /// MTU to request after connecting.
    pub mtu: u16,
    /// Default counter-clockwise rotation in degrees (0, 90, 180, 270).
    pub rotate: i32,
    /// Default brightness factor.
    pub brightness: f32,
    /// Scan timeout in seconds.
    pub scan_timeout: f64,
    /// Timeout for the first handshake and frame acknowledgements, in seconds.
    pub ack_timeout: f64,
    /// Timeout for the optional second handshake acknowledgement, in seconds.
    pub second_stage_timeout: f64,
    /// Acknowledgement matching strategy.
    pub ack_matching: AckMatcher,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            auto_reconnect: true,
            reconnect_delay: 2.0,
            mtu: 512,
            rotate: 0,
            brightness: 0.85,
            scan_timeout: 6.0,
            ack_timeout: 5.0,
            second_stage_timeout: 0.5,
            ack_matching: AckMatcher::Exact,
        }
    }
}

impl DeviceConfig {
    fn normalize(&mut self) {
        self.brightness = clamp_brightness(self.brightness);
        self.scan_timeout = self.scan_timeout.max(1.0);
        if Rotation::from_degrees(self.rotate).is_none() || !(0..360).contains(&self.rotate) {
            self.rotate = 0;
        }
        self.address = self
            .address
            .take()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
    }

    /// The configured address, if any.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Default rotation.
    pub fn rotation(&self) -> Rotation {
        Rotation::from_degrees(self.rotate).unwrap_or_default()
    }
}

/// Display configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Seconds between frames for callers that pace playback.
    pub frame_interval: f64,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Log every notification at info level.
    pub log_notifications: bool,
    /// Delay between exchange steps, in seconds.
    pub stage_delay: f64,
    /// Delay between exchange steps when streaming, in seconds.
    pub streaming_stage_delay: f64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            frame_interval: 5.0,
            max_retries: 3,
            log_notifications: false,
            stage_delay: 0.2,
            streaming_stage_delay: 0.02,
        }
    }
}

impl DisplayConfig {
    pub fn frame_interval(&self) -> Duration {
        secs(self.frame_interval)
    }

    pub fn stage_delay(&self) -> Duration {
        secs(self.stage_delay)
    }
}

/// Multi-panel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelsConfig {
    /// Width of one panel in pixels.
    pub tile_width: u32,
    /// Height of one panel in pixels.
    pub tile_height: u32,
    /// Canvas size in tiles.
    pub layout: LayoutConfig,
    /// Panels, either bare addresses or full entries.
    pub list: Vec<PanelEntry>,
}

impl Default for PanelsConfig {
    fn default() -> Self {
        Self {
            tile_width: 32,
            tile_height: 32,
            layout: LayoutConfig::default(),
            list: Vec::new(),
        }
    }
}

/// Canvas size in tiles. Missing values are derived from the panel grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub columns: Option<u32>,
    pub rows: Option<u32>,
}

/// One entry of `panels.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PanelEntry {
    /// A bare address at grid (0, 0).
    Address(String),
    Detailed(PanelEntryConfig),
}

/// A full panel entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelEntryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub grid_x: u32,
    pub grid_y: u32,
    /// Rotation override in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<i32>,
    /// Brightness override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f32>,
}

/// A normalized panel: where it sits and how to reach it.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelDescriptor {
    pub name: String,
    pub address: String,
    pub grid_x: u32,
    pub grid_y: u32,
    /// Overrides the device rotation.
    pub rotation: Option<Rotation>,
    /// Overrides the device brightness.
    pub brightness: Option<f32>,
}

impl PanelDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>, grid_x: u32, grid_y: u32) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            grid_x,
            grid_y,
            rotation: None,
            brightness: None,
        }
    }
}

impl PanelsConfig {
    fn normalize(&mut self) {
        let mut entries = Vec::with_capacity(self.list.len());
        for entry in self.list.drain(..) {
            let mut entry = match entry {
                PanelEntry::Address(address) => PanelEntryConfig {
                    address: Some(address),
                    ..PanelEntryConfig::default()
                },
                PanelEntry::Detailed(entry) => entry,
            };

            entry.address = entry
                .address
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty());
            if entry.address.is_none() {
                tracing::warn!("Ignoring panel entry without an address");
                continue;
            }
            if entry.name.as_deref().map_or(true, |n| n.trim().is_empty()) {
                entry.name = Some(format!("panel_{}", entries.len() + 1));
            }
            entry.rotation = entry.rotation.filter(|r| matches!(r, 0 | 90 | 180 | 270));
            entry.brightness = entry.brightness.map(clamp_brightness);
            entries.push(PanelEntry::Detailed(entry));
        }
        self.list = entries;

        let descriptors = self.descriptors();
        if self.layout.columns.is_none() {
            self.layout.columns = Some(
                descriptors
                    .iter()
                    .map(|d| d.grid_x.saturating_add(1))
                    .max()
                    .unwrap_or(1),
            );
        }
        if self.layout.rows.is_none() {
            self.layout.rows = Some(
                descriptors
                    .iter()
                    .map(|d| d.grid_y.saturating_add(1))
                    .max()
                    .unwrap_or(1),
            );
        }
    }

    /// The usable panels, in configuration order.
    ///
    /// Entries without an address are skipped; unnamed ones are named by
    /// position among the usable entries.
    pub fn descriptors(&self) -> Vec<PanelDescriptor> {
        let mut descriptors = Vec::with_capacity(self.list.len());
        for entry in &self.list {
            let descriptor = match entry {
                PanelEntry::Address(address) => {
                    let address = address.trim();
                    if address.is_empty() {
                        continue;
                    }
                    PanelDescriptor::new(format!("panel_{}", descriptors.len() + 1), address, 0, 0)
                }
                PanelEntry::Detailed(entry) => {
                    let Some(address) = entry.address.as_deref().map(str::trim).filter(|a| !a.is_empty())
                    else {
                        continue;
                    };
                    let name = entry
                        .name
                        .clone()
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| format!("panel_{}", descriptors.len() + 1));
                    PanelDescriptor {
                        name,
                        address: address.to_string(),
                        grid_x: entry.grid_x,
                        grid_y: entry.grid_y,
                        rotation: entry.rotation.and_then(Rotation::from_degrees),
                        brightness: entry.brightness.map(clamp_brightness),
                    }
                }
            };
            descriptors.push(descriptor);
        }
        descriptors
    }

    /// Canvas size in tiles.
    pub fn grid_size(&self) -> (u32, u32) {
        let descriptors = self.descriptors();
        let columns = self
            .layout
            .columns
            .unwrap_or_else(|| descriptors.iter().map(|d| d.grid_x.saturating_add(1)).max().unwrap_or(1));
        let rows = self
            .layout
            .rows
            .unwrap_or_else(|| descriptors.iter().map(|d| d.grid_y.saturating_add(1)).max().unwrap_or(1));
        (columns, rows)
    }
}

fn clamp_brightness(value: f32) -> f32 {
    if value.is_nan() {
        return MAX_BRIGHTNESS;
    }
    value.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS)
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0:?}: {1}")]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file {0:?}: {1}")]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}
