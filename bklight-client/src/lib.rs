//! # bklight-client
//!
//! Device sessions for BK-Light panels.
//!
//! This crate provides:
//! - A backend-neutral device link (connect, subscribe, write, teardown)
//! - The per-panel handshake state machine with retry and reconnect policy
//! - Per-panel image adjustment (rotation, brightness) and PNG encoding
//! - Discovery of nearby panels, with one scan shared between resolvers
//! - An in-process loopback backend for simulation and tests
//! - A BLE backend (`ble` feature)

pub mod acks;
#[cfg(feature = "ble")]
pub mod ble;
pub mod config;
pub mod error;
pub mod imaging;
pub mod link;
pub mod loopback;
pub mod scan;
pub mod session;

pub use acks::{AckState, AckWaiter};
#[cfg(feature = "ble")]
pub use ble::{BleConnector, BleTransport};
pub use config::SessionConfig;
pub use error::SessionError;
pub use imaging::Rotation;
pub use link::{discover_panels, Connector, DeviceLink, DiscoveredDevice, Discovery, LinkOptions, Transport};
pub use loopback::{LoopbackConnector, PanelBehavior};
pub use scan::{ScanControl, ScanLease, SharedScan};
pub use session::{DisplaySession, SessionPhase, SessionState, DEFAULT_STAGE_DELAY};
