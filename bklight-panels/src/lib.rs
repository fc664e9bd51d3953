//! # bklight-panels
//!
//! Multi-panel canvas for BK-Light displays.
//!
//! This crate provides:
//! - Application configuration (YAML file, environment overrides, normalization)
//! - Tile geometry for grids of equally sized panels
//! - A panel manager that connects, feeds and tears down many sessions at once
//! - Frame prebuffering for low-latency playback

pub mod config;
pub mod error;
pub mod geometry;
pub mod manager;

pub use config::{AppConfig, ConfigError, PanelDescriptor};
pub use error::{PanelError, PanelFailure};
pub use geometry::TileGeometry;
pub use manager::PanelManager;
