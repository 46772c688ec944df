//! Shared, lazily connected handle to the capture device.
//!
//! The HTTP layer talks to one device through a [`ScannerSession`]. The
//! session opens the link on first use and again after any failure, so a
//! device that was unreachable at startup, or that dropped mid-scan, is
//! picked up on the next request without restarting the server.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DeviceError;

use super::client::{ConnectionState, DeviceClient, DeviceSettings};
use super::protocol::{DeviceStatus, LayerInfo, ScanRequest, ScanResult};
use super::CancelSignal;

/// Default bound on a whole scan, from SCAN command to last layer byte.
pub const DEFAULT_SCAN_DEADLINE: Duration = Duration::from_secs(300);

/// One device connection shared between request handlers.
///
/// Exchanges are serialized by an async mutex held for the whole exchange.
pub struct ScannerSession {
    settings: DeviceSettings,
    scan_deadline: Duration,
    client: Mutex<Option<DeviceClient>>,
}

impl ScannerSession {
    /// Create a session; nothing is opened until the first exchange.
    pub fn new(settings: DeviceSettings) -> Self {
        Self {
            settings,
            scan_deadline: DEFAULT_SCAN_DEADLINE,
            client: Mutex::new(None),
        }
    }

    pub fn with_scan_deadline(mut self, deadline: Duration) -> Self {
        self.scan_deadline = deadline;
        self
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn scan_deadline(&self) -> Duration {
        self.scan_deadline
    }

    /// Connection state without waiting on an exchange in progress.
    ///
    /// Reports `Scanning` while another task holds the device.
    pub fn state(&self) -> ConnectionState {
        match self.client.try_lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|client| client.state())
                .unwrap_or(ConnectionState::Disconnected),
            Err(_) => ConnectionState::Scanning,
        }
    }

    /// Query device health.
    pub async fn status(&self) -> Result<DeviceStatus, DeviceError> {
        let mut slot = self.client.lock().await;
        let client = self.connected(&mut slot).await?;
        client.status().await
    }

    /// Layer geometry for the current device session.
    pub async fn layers(&self) -> Result<Vec<LayerInfo>, DeviceError> {
        let mut slot = self.client.lock().await;
        let client = self.connected(&mut slot).await?;
        Ok(client.layers().to_vec())
    }

    /// Run a scan bounded by the configured deadline.
    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanResult, DeviceError> {
        let cancel = CancelSignal::with_deadline(self.scan_deadline);
        let mut slot = self.client.lock().await;
        let client = self.connected(&mut slot).await?;
        client.start_scan(request, &cancel).await
    }

    pub async fn set_focus(&self, layer: u32) -> Result<(), DeviceError> {
        let mut slot = self.client.lock().await;
        let client = self.connected(&mut slot).await?;
        client.set_focus(layer).await
    }

    pub async fn calibrate(&self) -> Result<(), DeviceError> {
        let mut slot = self.client.lock().await;
        let client = self.connected(&mut slot).await?;
        client.calibrate().await
    }

    /// Close the connection if one is open.
    pub async fn close(&self) {
        if let Some(mut client) = self.client.lock().await.take() {
            client.close().await;
        }
    }

    /// Return the open client, connecting and fetching layer info first if
    /// there is none.
    async fn connected<'a>(
        &self,
        slot: &'a mut Option<DeviceClient>,
    ) -> Result<&'a mut DeviceClient, DeviceError> {
        let usable = slot.as_ref().is_some_and(|client| client.is_connected());
        if !usable {
            *slot = None;
            debug!(address = %self.settings.address, "Opening device session");
            let mut client = DeviceClient::connect(&self.settings).await?;
            let layers = client.query_layer_info().await?;
            info!(layers = layers.len(), "Device session ready");
            *slot = Some(client);
        }

        slot.as_mut().ok_or(DeviceError::InvalidState {
            operation: "connect",
            required: ConnectionState::Connected.as_str(),
            actual: ConnectionState::Disconnected.as_str(),
        })
    }
}

impl std::fmt::Debug for ScannerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerSession")
            .field("settings", &self.settings)
            .field("scan_deadline", &self.scan_deadline)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
