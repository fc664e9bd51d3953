//! BLE backend built on btleplug.

use crate::error::SessionError;
use crate::link::{Connector, DiscoveredDevice, Discovery, LinkOptions, NotificationSender, Transport};
use crate::scan::{ScanControl, SharedScan};
use bklight_protocol::{NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC};
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn ble_error(context: &str, e: btleplug::Error) -> SessionError {
    SessionError::ConnectionFailed(format!("{}: {}", context, e))
}

/// Disconnects `peripheral` on the current runtime, if there is one.
fn spawn_disconnect(peripheral: Peripheral) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                tracing::debug!("background disconnect failed: {}", e);
            }
        });
    }
}

/// Scan control for one adapter.
#[derive(Clone)]
struct AdapterScan {
    adapter: Adapter,
}

impl ScanControl for AdapterScan {
    async fn start(&self) -> Result<(), SessionError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ble_error("starting scan", e))
    }

    async fn stop(&self) {
        if let Err(e) = self.adapter.stop_scan().await {
            tracing::debug!("stop_scan failed: {}", e);
        }
    }
}

/// Connects through the first Bluetooth adapter on the host.
///
/// Clones share the adapter and its scan, so concurrent sessions resolving
/// addresses keep the scan running until the last of them is done.
#[derive(Clone)]
pub struct BleConnector {
    adapter: Adapter,
    scan: SharedScan<AdapterScan>,
}

impl BleConnector {
    pub async fn new() -> Result<Self, SessionError> {
        let manager = Manager::new()
            .await
            .map_err(|e| ble_error("bluetooth manager", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ble_error("listing adapters", e))?
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::ConnectionFailed("no bluetooth adapter found".to_string()))?;
        let scan = SharedScan::new(AdapterScan {
            adapter: adapter.clone(),
        });
        Ok(Self { adapter, scan })
    }

    async fn lookup(&self, address: &str) -> Result<Option<Peripheral>, SessionError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| ble_error("listing peripherals", e))?;
        Ok(peripherals
            .into_iter()
            .find(|peripheral| matches_address(peripheral, address)))
    }

    /// Scans until the device shows up, then falls back to the adapter's
    /// cached peripherals.
    async fn resolve(&self, address: &str, timeout: Duration) -> Result<Peripheral, SessionError> {
        let lease = self.scan.acquire().await?;

        let deadline = Instant::now() + timeout;
        let mut found = None;
        while Instant::now() < deadline {
            match self.lookup(address).await {
                Ok(Some(peripheral)) => {
                    found = Some(peripheral);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    lease.release().await;
                    return Err(e);
                }
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
        lease.release().await;

        match found {
            Some(peripheral) => Ok(peripheral),
            None => self
                .lookup(address)
                .await?
                .ok_or_else(|| SessionError::DeviceNotFound {
                    address: address.to_string(),
                    timeout,
                }),
        }
    }
}

fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    // MAC on Linux/Windows, CoreBluetooth UUID on macOS
    peripheral.address().to_string().eq_ignore_ascii_case(address)
        || format!("{:?}", peripheral.id())
            .to_ascii_uppercase()
            .contains(&address.to_ascii_uppercase())
}

impl Connector for BleConnector {
    type Transport = BleTransport;

    async fn open(&self, address: &str, options: &LinkOptions) -> Result<BleTransport, SessionError> {
        let peripheral = self.resolve(address, options.scan_timeout).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| ble_error("connect", e))?;
        let guard = ConnectGuard(Some(peripheral.clone()));
        if let Err(e) = peripheral.discover_services().await {
            guard.disarm();
            let _ = peripheral.disconnect().await;
            return Err(ble_error("service discovery", e));
        }

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let (Some(write_char), Some(notify_char)) =
            (find(WRITE_CHARACTERISTIC), find(NOTIFY_CHARACTERISTIC))
        else {
            guard.disarm();
            let _ = peripheral.disconnect().await;
            return Err(SessionError::ConnectionFailed(format!(
                "{} does not expose the panel characteristics",
                address
            )));
        };

        let connected = peripheral.is_connected().await.unwrap_or(false);
        guard.disarm();
        Ok(BleTransport {
            peripheral,
            write_char,
            notify_char,
            connected: Arc::new(AtomicBool::new(connected)),
            forwarder: None,
        })
    }
}

/// A connected peripheral.
pub struct BleTransport {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_char: Characteristic,
    connected: Arc<AtomicBool>,
    forwarder: Option<JoinHandle<()>>,
}

impl BleTransport {
    fn stop_forwarder(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

impl Transport for BleTransport {
    async fn write(&mut self, data: &[u8], with_response: bool) -> Result<(), SessionError> {
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&self.write_char, data, write_type)
            .await
            .map_err(|e| SessionError::TransportWrite(e.to_string()))
    }

    async fn negotiate_mtu(&mut self, _mtu: u16) -> Result<u16, SessionError> {
        Err(SessionError::ConnectionFailed(
            "MTU exchange is not exposed by this backend".to_string(),
        ))
    }

    async fn subscribe(&mut self, sink: NotificationSender) -> Result<(), SessionError> {
        let mut stream = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| ble_error("notification stream", e))?;
        self.peripheral
            .subscribe(&self.notify_char)
            .await
            .map_err(|e| ble_error("subscribe", e))?;

        self.stop_forwarder();
        let connected = self.connected.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != NOTIFY_CHARACTERISTIC {
                    continue;
                }
                if sink.send(Bytes::from(notification.value)).is_err() {
                    return;
                }
            }
            // Stream ends when the peripheral goes away
            connected.store(false, Ordering::SeqCst);
        }));
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), SessionError> {
        self.stop_forwarder();
        self.peripheral
            .unsubscribe(&self.notify_char)
            .await
            .map_err(|e| ble_error("unsubscribe", e))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.stop_forwarder();
        self.connected.store(false, Ordering::SeqCst);
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| ble_error("disconnect", e))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.stop_forwarder();
        // Dropped without close(): do not leave the peripheral connected
        if self.connected.swap(false, Ordering::SeqCst) {
            spawn_disconnect(self.peripheral.clone());
        }
    }
}

/// Disconnects a freshly connected peripheral if `open` is abandoned before
/// a transport takes ownership of it.
struct ConnectGuard(Option<Peripheral>);

impl ConnectGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        if let Some(peripheral) = self.0.take() {
            spawn_disconnect(peripheral);
        }
    }
}

impl Discovery for BleConnector {
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, SessionError> {
        let lease = self.scan.acquire().await?;
        tokio::time::sleep(timeout).await;
        let peripherals = self.adapter.peripherals().await;
        lease.release().await;

        let mut devices = Vec::new();
        for peripheral in peripherals.map_err(|e| ble_error("listing peripherals", e))? {
            let name = match peripheral.properties().await {
                Ok(properties) => properties.and_then(|p| p.local_name),
                Err(e) => {
                    tracing::debug!("{}: no properties: {}", peripheral.address(), e);
                    None
                }
            };
            devices.push(DiscoveredDevice {
                address: peripheral.address().to_string(),
                name,
            });
        }
        Ok(devices)
    }
}
