//! In-process simulated panels.
//!
//! [`LoopbackConnector`] implements the device side of the protocol: it
//! acknowledges handshakes and frames the way a panel does, records every
//! write, and can be told to misbehave (missing acknowledgements, refused
//! connections, failing teardown). It backs `--simulate` runs and the test
//! suites.

use crate::error::SessionError;
use crate::link::{Connector, DiscoveredDevice, Discovery, LinkOptions, NotificationSender, Transport};
use bklight_protocol::ack::{ACK_FIRST, ACK_FRAME, ACK_SECOND};
use bklight_protocol::{Frame, HANDSHAKE_FIRST, HANDSHAKE_SECOND};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Writes and frames kept per panel unless a behavior says otherwise.
pub const DEFAULT_CAPTURE_LIMIT: usize = 256;

/// Advertised name of simulated panels.
pub const SIMULATED_PANEL_NAME: &str = "LED_BLE_SIM";

/// First-stage acknowledgement as sent by tolerant-matching firmware.
const VARIANT_ACK_FIRST: [u8; 12] = [
    0x0C, 0x00, 0x01, 0x80, 0x81, 0x06, 0x33, 0x00, 0x00, 0x01, 0x00, 0x01,
];

/// Second-stage acknowledgement as sent by tolerant-matching firmware.
const VARIANT_ACK_SECOND: [u8; 8] = [0x08, 0x00, 0x05, 0x80, 0x0E, 0x03, 0x07, 0x02];

/// How a simulated panel behaves.
#[derive(Debug, Clone)]
pub struct PanelBehavior {
    /// Visible to scans.
    pub discoverable: bool,
    /// Number of initial connect attempts that are refused.
    pub failed_connects: u32,
    /// Whether the link reports itself up after connecting.
    pub reports_connected: bool,
    /// Whether MTU requests succeed.
    pub mtu_supported: bool,
    /// Acknowledge the first handshake.
    pub acks_first: bool,
    /// Acknowledge the second handshake.
    pub acks_second: bool,
    /// Acknowledge image frames.
    pub acks_frame: bool,
    /// Send the firmware-variant handshake acknowledgements.
    pub variant_acks: bool,
    /// Number of initial writes that fail.
    pub failed_writes: u32,
    /// Unsubscribe and close report errors.
    pub failing_teardown: bool,
    /// Simulated connect latency.
    pub connect_latency: Duration,
    /// Simulated delay before a subscription takes effect.
    pub subscribe_latency: Duration,
    /// Advertised local name, reported by discovery.
    pub local_name: Option<String>,
    /// Most recent writes and frames kept in [`PanelStats`]. Counters are
    /// not capped.
    pub capture_limit: usize,
}

impl Default for PanelBehavior {
    fn default() -> Self {
        Self {
            discoverable: true,
            failed_connects: 0,
            reports_connected: true,
            mtu_supported: true,
            acks_first: true,
            acks_second: true,
            acks_frame: true,
            variant_acks: false,
            failed_writes: 0,
            failing_teardown: false,
            connect_latency: Duration::ZERO,
            subscribe_latency: Duration::ZERO,
            local_name: Some(SIMULATED_PANEL_NAME.to_string()),
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }
}

/// A write observed by a simulated panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub data: Bytes,
    pub with_response: bool,
}

/// Counters and captures for one simulated panel.
#[derive(Debug, Clone, Default)]
pub struct PanelStats {
    pub connect_attempts: u32,
    pub connections: u32,
    pub negotiated_mtu: Option<u16>,
    pub first_handshakes: u32,
    pub second_handshakes: u32,
    /// Every write, including failed ones.
    pub write_count: u64,
    /// Image frames accepted (decoded and checksum-verified).
    pub frames_accepted: u64,
    /// Payload bytes across accepted frames.
    pub payload_bytes: u64,
    /// Most recent writes, oldest first.
    pub writes: VecDeque<RecordedWrite>,
    /// Most recent accepted frames, oldest first.
    pub frames: VecDeque<Frame>,
    pub unsubscribe_calls: u32,
    pub close_calls: u32,
}

#[derive(Debug)]
struct SimulatedPanel {
    behavior: PanelBehavior,
    stats: PanelStats,
    generation: u64,
    link_up: bool,
    sink: Option<NotificationSender>,
}

type Panels = Arc<Mutex<HashMap<String, SimulatedPanel>>>;
type CloseLog = Arc<Mutex<Vec<String>>>;

fn key(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

/// Connector for simulated panels. Cheap to clone; clones share panels.
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    panels: Panels,
    close_log: CloseLog,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a simulated panel.
    pub fn add_panel(&self, address: &str, behavior: PanelBehavior) {
        self.panels.lock().insert(
            key(address),
            SimulatedPanel {
                behavior,
                stats: PanelStats::default(),
                generation: 0,
                link_up: false,
                sink: None,
            },
        );
    }

    /// Changes the behavior of a registered panel, keeping its stats.
    pub fn update_behavior(&self, address: &str, update: impl FnOnce(&mut PanelBehavior)) {
        if let Some(panel) = self.panels.lock().get_mut(&key(address)) {
            update(&mut panel.behavior);
        }
    }

    /// Simulates the panel dropping its current connection.
    pub fn drop_link(&self, address: &str) {
        if let Some(panel) = self.panels.lock().get_mut(&key(address)) {
            panel.link_up = false;
            panel.sink = None;
        }
    }

    /// Snapshot of a panel's counters. Unknown addresses return empty stats.
    pub fn stats(&self, address: &str) -> PanelStats {
        self.panels
            .lock()
            .get(&key(address))
            .map(|panel| panel.stats.clone())
            .unwrap_or_default()
    }

    /// Addresses in the order their connections were closed.
    pub fn close_log(&self) -> Vec<String> {
        self.close_log.lock().clone()
    }

    /// Connect attempts across all panels.
    pub fn total_connect_attempts(&self) -> u32 {
        self.panels
            .lock()
            .values()
            .map(|panel| panel.stats.connect_attempts)
            .sum()
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn open(
        &self,
        address: &str,
        options: &LinkOptions,
    ) -> Result<LoopbackTransport, SessionError> {
        let address = key(address);
        let latency = {
            let mut panels = self.panels.lock();
            match panels.get_mut(&address) {
                Some(panel) if panel.behavior.discoverable => {
                    panel.stats.connect_attempts += 1;
                    Some(panel.behavior.connect_latency)
                }
                _ => None,
            }
        };

        let latency = match latency {
            Some(latency) => latency,
            None => {
                tokio::time::sleep(options.scan_timeout).await;
                return Err(SessionError::DeviceNotFound {
                    address,
                    timeout: options.scan_timeout,
                });
            }
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut panels = self.panels.lock();
        let panel = panels
            .get_mut(&address)
            .ok_or_else(|| SessionError::ConnectionFailed(format!("{} vanished", address)))?;

        if panel.stats.connect_attempts <= panel.behavior.failed_connects {
            return Err(SessionError::ConnectionFailed(format!(
                "{} refused the connection",
                address
            )));
        }

        panel.stats.connections += 1;
        panel.generation += 1;
        panel.link_up = panel.behavior.reports_connected;
        panel.sink = None;

        Ok(LoopbackTransport {
            address,
            generation: panel.generation,
            panels: self.panels.clone(),
            close_log: self.close_log.clone(),
        })
    }
}

impl Discovery for LoopbackConnector {
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, SessionError> {
        tokio::time::sleep(timeout).await;
        let mut devices: Vec<_> = self
            .panels
            .lock()
            .iter()
            .filter(|(_, panel)| panel.behavior.discoverable)
            .map(|(address, panel)| DiscoveredDevice {
                address: address.clone(),
                name: panel.behavior.local_name.clone(),
            })
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }
}

/// Transport to a simulated panel.
#[derive(Debug)]
pub struct LoopbackTransport {
    address: String,
    generation: u64,
    panels: Panels,
    close_log: CloseLog,
}

impl LoopbackTransport {
    fn with_panel<R>(
        &self,
        f: impl FnOnce(&mut SimulatedPanel) -> Result<R, SessionError>,
    ) -> Result<R, SessionError> {
        let mut panels = self.panels.lock();
        let panel = panels
            .get_mut(&self.address)
            .ok_or_else(|| SessionError::ConnectionFailed(format!("{} vanished", self.address)))?;
        f(panel)
    }

    fn live(&self, panel: &SimulatedPanel) -> bool {
        panel.generation == self.generation && panel.link_up
    }
}

fn capture<T>(buffer: &mut VecDeque<T>, item: T, limit: usize) {
    if limit == 0 {
        return;
    }
    while buffer.len() >= limit {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

impl SimulatedPanel {
    fn notify(&self, payload: &[u8]) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(Bytes::copy_from_slice(payload));
        }
    }

    fn receive(&mut self, data: &[u8]) {
        if data == HANDSHAKE_FIRST {
            self.stats.first_handshakes += 1;
            if self.behavior.acks_first {
                let ack: &[u8] = if self.behavior.variant_acks {
                    &VARIANT_ACK_FIRST
                } else {
                    &ACK_FIRST
                };
                self.notify(ack);
            }
        } else if data == HANDSHAKE_SECOND {
            self.stats.second_handshakes += 1;
            if self.behavior.acks_second {
                let ack: &[u8] = if self.behavior.variant_acks {
                    &VARIANT_ACK_SECOND
                } else {
                    &ACK_SECOND
                };
                self.notify(ack);
            }
        } else if let Ok(frame) = Frame::from_bytes(data) {
            self.stats.frames_accepted += 1;
            self.stats.payload_bytes += frame.payload().len() as u64;
            capture(&mut self.stats.frames, frame, self.behavior.capture_limit);
            if self.behavior.acks_frame {
                self.notify(&ACK_FRAME);
            }
        }
    }
}

impl Transport for LoopbackTransport {
    async fn write(&mut self, data: &[u8], with_response: bool) -> Result<(), SessionError> {
        self.with_panel(|panel| {
            if panel.generation != self.generation || !panel.link_up {
                return Err(SessionError::TransportWrite("not connected".to_string()));
            }
            panel.stats.write_count += 1;
            let limit = panel.behavior.capture_limit;
            capture(
                &mut panel.stats.writes,
                RecordedWrite {
                    data: Bytes::copy_from_slice(data),
                    with_response,
                },
                limit,
            );
            if panel.behavior.failed_writes > 0 {
                panel.behavior.failed_writes -= 1;
                return Err(SessionError::TransportWrite(
                    "simulated write failure".to_string(),
                ));
            }
            panel.receive(data);
            Ok(())
        })
    }

    async fn negotiate_mtu(&mut self, mtu: u16) -> Result<u16, SessionError> {
        self.with_panel(|panel| {
            if !panel.behavior.mtu_supported {
                return Err(SessionError::ConnectionFailed(
                    "MTU exchange not supported".to_string(),
                ));
            }
            panel.stats.negotiated_mtu = Some(mtu);
            Ok(mtu)
        })
    }

    async fn subscribe(&mut self, sink: NotificationSender) -> Result<(), SessionError> {
        let latency = self.with_panel(|panel| Ok(panel.behavior.subscribe_latency))?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.with_panel(|panel| {
            panel.sink = Some(sink);
            Ok(())
        })
    }

    async fn unsubscribe(&mut self) -> Result<(), SessionError> {
        self.with_panel(|panel| {
            panel.stats.unsubscribe_calls += 1;
            if panel.generation == self.generation {
                panel.sink = None;
            }
            if panel.behavior.failing_teardown {
                return Err(SessionError::ConnectionFailed(
                    "simulated unsubscribe failure".to_string(),
                ));
            }
            Ok(())
        })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.close_log.lock().push(self.address.clone());
        self.with_panel(|panel| {
            panel.stats.close_calls += 1;
            if panel.generation == self.generation {
                panel.link_up = false;
                panel.sink = None;
            }
            if panel.behavior.failing_teardown {
                return Err(SessionError::ConnectionFailed(
                    "simulated close failure".to_string(),
                ));
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.panels
            .lock()
            .get(&self.address)
            .map(|panel| self.live(panel))
            .unwrap_or(false)
    }
}
