//! Device link: one BLE connection to one panel.
//!
//! Backends implement [`Connector`] (address resolution and connect) and
//! [`Transport`] (characteristic I/O on an established connection).
//! [`DeviceLink`] drives them through the connection lifecycle and owns the
//! notification channel for the connection.

use crate::error::SessionError;
use bklight_protocol::PANEL_NAME_PREFIX;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

/// Time given to the peripheral to settle after unsubscribing.
pub const UNSUBSCRIBE_SETTLE: Duration = Duration::from_millis(100);

/// Sender half used by backends to deliver raw notification payloads.
pub type NotificationSender = mpsc::UnboundedSender<Bytes>;

/// Receiver half consumed by the session while waiting for acknowledgements.
pub type NotificationReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Parameters for opening a connection.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// How long to scan before declaring the device missing.
    pub scan_timeout: Duration,
    /// MTU to request (0 skips negotiation).
    pub mtu: u16,
}

/// An established connection to a peripheral.
pub trait Transport: Send {
    /// Writes to the command characteristic.
    fn write(
        &mut self,
        data: &[u8],
        with_response: bool,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Requests an MTU. Returns the negotiated value.
    fn negotiate_mtu(&mut self, mtu: u16) -> impl Future<Output = Result<u16, SessionError>> + Send;

    /// Subscribes to the notify characteristic, delivering payloads to `sink`.
    fn subscribe(
        &mut self,
        sink: NotificationSender,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Stops notifications.
    fn unsubscribe(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Closes the connection.
    fn close(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Whether the peripheral reports the connection as up.
    fn is_connected(&self) -> bool;
}

/// Resolves addresses and opens transports.
pub trait Connector: Send + Sync {
    type Transport: Transport;

    /// Resolves `address` within `options.scan_timeout` and connects to it.
    fn open(
        &self,
        address: &str,
        options: &LinkOptions,
    ) -> impl Future<Output = Result<Self::Transport, SessionError>> + Send;
}

/// A peripheral seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
}

impl DiscoveredDevice {
    /// Whether the advertised name marks a BK-Light panel.
    pub fn is_panel(&self) -> bool {
        self.name
            .as_deref()
            .is_some_and(|name| name.starts_with(PANEL_NAME_PREFIX))
    }
}

/// Lists nearby peripherals.
pub trait Discovery: Send + Sync {
    /// Scans for `timeout` and returns every peripheral seen.
    fn discover(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<DiscoveredDevice>, SessionError>> + Send;
}

/// Scans for BK-Light panels, sorted by name.
pub async fn discover_panels<D: Discovery>(
    discovery: &D,
    timeout: Duration,
) -> Result<Vec<DiscoveredDevice>, SessionError> {
    let mut panels: Vec<_> = discovery
        .discover(timeout)
        .await?
        .into_iter()
        .filter(DiscoveredDevice::is_panel)
        .collect();
    panels.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.address.cmp(&b.address)));
    Ok(panels)
}

/// A connected, subscribed link to one panel.
pub struct DeviceLink<T: Transport> {
    address: String,
    transport: T,
    notifications: NotificationReceiver,
    /// Held until the subscription is made.
    sink: Option<NotificationSender>,
    closed: bool,
}

impl<T: Transport> DeviceLink<T> {
    /// Resolves, connects, negotiates MTU and subscribes to notifications.
    ///
    /// MTU negotiation failure is logged and ignored. Any other failure after
    /// the connection was established closes it before returning.
    pub async fn open<C>(
        connector: &C,
        address: &str,
        options: &LinkOptions,
    ) -> Result<Self, SessionError>
    where
        C: Connector<Transport = T>,
    {
        let mut link = Self::connect(connector, address, options).await?;
        link.establish(options).await?;
        Ok(link)
    }

    /// Resolves and connects, without subscribing.
    ///
    /// The returned link owns the connection; callers that may be cancelled
    /// should store it before calling [`DeviceLink::establish`] so that
    /// [`DeviceLink::disconnect`] can still reach it.
    pub async fn connect<C>(
        connector: &C,
        address: &str,
        options: &LinkOptions,
    ) -> Result<Self, SessionError>
    where
        C: Connector<Transport = T>,
    {
        tracing::debug!("Opening link to {}", address);
        let transport = connector.open(address, options).await?;
        let (sink, notifications) = mpsc::unbounded_channel();
        Ok(Self {
            address: address.to_string(),
            transport,
            notifications,
            sink: Some(sink),
            closed: false,
        })
    }

    /// Finishes setup on a connected link: checks it is live, negotiates the
    /// MTU and subscribes. On failure the link is disconnected.
    pub async fn establish(&mut self, options: &LinkOptions) -> Result<(), SessionError> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };

        if !self.transport.is_connected() {
            self.disconnect().await;
            return Err(SessionError::ConnectionFailed(format!(
                "{} did not report a live connection",
                self.address
            )));
        }

        if options.mtu > 0 {
            match self.transport.negotiate_mtu(options.mtu).await {
                Ok(mtu) => tracing::debug!("{}: negotiated MTU {}", self.address, mtu),
                Err(e) => tracing::debug!("{}: MTU negotiation skipped: {}", self.address, e),
            }
        }

        if let Err(e) = self.transport.subscribe(sink).await {
            self.disconnect().await;
            return Err(e);
        }

        tracing::debug!("Link to {} established", self.address);
        Ok(())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the link is established and the peripheral reports it up.
    pub fn is_connected(&self) -> bool {
        !self.closed && self.sink.is_none() && self.transport.is_connected()
    }

    /// Writes raw bytes to the command characteristic.
    pub async fn write(&mut self, data: &[u8], with_response: bool) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::ConnectionFailed(format!(
                "link to {} is closed",
                self.address
            )));
        }
        self.transport.write(data, with_response).await
    }

    /// Inbound notification payloads for this connection.
    pub fn notifications(&mut self) -> &mut NotificationReceiver {
        &mut self.notifications
    }

    /// Discards notifications received before now.
    pub fn drain_notifications(&mut self) -> usize {
        let mut drained = 0;
        while self.notifications.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Tears the link down. Idempotent; never fails.
    ///
    /// Called from cleanup paths, so every error is logged and swallowed.
    pub async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!("Disconnecting from {}", self.address);

        // A link cancelled before subscribing has nothing to unsubscribe
        if self.sink.is_none() && self.transport.is_connected() {
            if let Err(e) = self.transport.unsubscribe().await {
                tracing::debug!("{}: unsubscribe failed: {}", self.address, e);
            }
            tokio::time::sleep(UNSUBSCRIBE_SETTLE).await;
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!("{}: close failed: {}", self.address, e);
        }
        self.notifications.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConnector, PanelBehavior};

    const ADDR: &str = "F0:27:3C:1A:8B:C3";

    fn options() -> LinkOptions {
        LinkOptions {
            scan_timeout: Duration::from_secs(6),
            mtu: 512,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_and_disconnect() {
        let connector = LoopbackConnector::new();
        connector.add_panel(ADDR, PanelBehavior::default());

        let mut link = DeviceLink::open(&connector, ADDR, &options()).await.unwrap();
        assert!(link.is_connected());
        assert_eq!(connector.stats(ADDR).negotiated_mtu, Some(512));

        link.disconnect().await;
        assert!(!link.is_connected());
        link.disconnect().await;

        let stats = connector.stats(ADDR);
        assert_eq!(stats.unsubscribe_calls, 1);
        assert_eq!(stats.close_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_failure_is_not_fatal() {
        let connector = LoopbackConnector::new();
        connector.add_panel(
            ADDR,
            PanelBehavior {
                mtu_supported: false,
                ..PanelBehavior::default()
            },
        );

        let link = DeviceLink::open(&connector, ADDR, &options()).await.unwrap();
        assert!(link.is_connected());
        assert_eq!(connector.stats(ADDR).negotiated_mtu, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_after_connect() {
        let connector = LoopbackConnector::new();
        connector.add_panel(
            ADDR,
            PanelBehavior {
                reports_connected: false,
                ..PanelBehavior::default()
            },
        );

        let result = DeviceLink::open(&connector, ADDR, &options()).await;
        assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
        assert_eq!(connector.stats(ADDR).close_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device() {
        let connector = LoopbackConnector::new();
        let result = DeviceLink::open(&connector, ADDR, &options()).await;
        assert!(matches!(result, Err(SessionError::DeviceNotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_swallows_teardown_errors() {
        let connector = LoopbackConnector::new();
        connector.add_panel(
            ADDR,
            PanelBehavior {
                failing_teardown: true,
                ..PanelBehavior::default()
            },
        );

        let mut link = DeviceLink::open(&connector, ADDR, &options()).await.unwrap();
        link.disconnect().await;

        let stats = connector.stats(ADDR);
        assert_eq!(stats.unsubscribe_calls, 1);
        assert_eq!(stats.close_calls, 1);
        assert!(!link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_after_disconnect_fails() {
        let connector = LoopbackConnector::new();
        connector.add_panel(ADDR, PanelBehavior::default());

        let mut link = DeviceLink::open(&connector, ADDR, &options()).await.unwrap();
        link.disconnect().await;
        let result = link.write(&[0x01], false).await;
        assert!(matches!(result, Err(SessionError::ConnectionFailed(_))));
    }
}
