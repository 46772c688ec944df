//! Stateful client for the capture device.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::DeviceError;

use super::protocol::{
    encode_command, encode_scan_payload, parse_layer_header, parse_layer_info, parse_status,
    read_exact, read_frame, DeviceStatus, LayerData, LayerInfo, Opcode, ScanRequest, ScanResult,
    DEFAULT_MAX_FRAME_LEN, LAYER_HEADER_LEN,
};
use super::CancelSignal;

/// Byte stream the client can talk over.
pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceIo for T {}

// =============================================================================
// Settings
// =============================================================================

/// Physical link to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// `host:port`
    #[default]
    Tcp,

    /// Path to a serial character device. Line settings (baud rate, parity)
    /// must be configured on the device node beforehand.
    Serial,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "serial" => Ok(Transport::Serial),
            other => Err(format!(
                "unsupported device protocol '{}' (expected tcp or serial)",
                other
            )),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Serial => f.write_str("serial"),
        }
    }
}

/// How to reach the device and how long to wait on it.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub transport: Transport,

    /// `host:port` for TCP, device path for serial
    pub address: String,

    /// Bound on opening the link
    pub connect_timeout: Duration,

    /// Bound on each individual read
    pub read_timeout: Duration,

    /// Largest response or layer block accepted
    pub max_frame_len: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            transport: Transport::Tcp,
            address: "localhost:9090".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Scanning,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Scanning => "scanning",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Device Client
// =============================================================================

/// Client for one device session.
///
/// Every exchange takes `&mut self`, so exchanges on one client never
/// interleave. Share a client between tasks behind a `tokio::sync::Mutex`.
///
/// Any I/O, timeout, framing or cancellation failure drops the connection
/// and leaves the client `Disconnected`. Nothing is retried internally.
///
/// An exchange owns the stream while it is on the wire. If the caller drops
/// the exchange future part-way (for example a request handler timing out
/// mid-scan), the stream goes with it, and the next call finds the client
/// without a stream and resets it to `Disconnected`.
pub struct DeviceClient<S = Box<dyn DeviceIo>> {
    stream: Option<S>,
    state: ConnectionState,
    layers: Vec<LayerInfo>,
    read_timeout: Duration,
    max_frame_len: usize,
}

impl DeviceClient<Box<dyn DeviceIo>> {
    /// Open the configured transport and perform the handshake.
    pub async fn connect(settings: &DeviceSettings) -> Result<Self, DeviceError> {
        let mut client = Self::new(settings);
        client.state = ConnectionState::Connecting;
        debug!(
            transport = %settings.transport,
            address = %settings.address,
            "Connecting to capture device"
        );

        let stream = match open_transport(settings).await {
            Ok(stream) => stream,
            Err(e) => {
                client.state = ConnectionState::Disconnected;
                warn!(address = %settings.address, error = %e, "Device connect failed");
                return Err(e);
            }
        };

        client.handshake(stream).await?;
        Ok(client)
    }
}

async fn open_transport(settings: &DeviceSettings) -> Result<Box<dyn DeviceIo>, DeviceError> {
    let timed_out = || DeviceError::Timeout {
        operation: "connect",
        millis: settings.connect_timeout.as_millis() as u64,
    };

    match settings.transport {
        Transport::Tcp => {
            let connect = TcpStream::connect(settings.address.as_str());
            let stream = tokio::time::timeout(settings.connect_timeout, connect)
                .await
                .map_err(|_| timed_out())??;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Transport::Serial => {
            let mut options = tokio::fs::OpenOptions::new();
            options.read(true).write(true);
            let open = options.open(&settings.address);
            let file = tokio::time::timeout(settings.connect_timeout, open)
                .await
                .map_err(|_| timed_out())??;
            Ok(Box::new(file))
        }
    }
}

impl<S: DeviceIo> DeviceClient<S> {
    /// Create a disconnected client.
    pub fn new(settings: &DeviceSettings) -> Self {
        Self {
            stream: None,
            state: ConnectionState::Disconnected,
            layers: Vec::new(),
            read_timeout: settings.read_timeout,
            max_frame_len: settings.max_frame_len,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Layer geometry from the last [`query_layer_info`](Self::query_layer_info).
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    /// Send CONNECT over an already-open stream.
    ///
    /// The device does not answer the handshake; a successful write is
    /// enough to consider the session open.
    pub async fn handshake(&mut self, mut stream: S) -> Result<(), DeviceError> {
        self.reset();
        self.state = ConnectionState::Connecting;

        if let Err(e) = send_command(&mut stream, Opcode::Connect, &[]).await {
            self.state = ConnectionState::Disconnected;
            warn!(error = %e, "Device handshake failed");
            return Err(e);
        }

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        info!("Capture device connected");
        Ok(())
    }

    /// Fetch and cache the geometry of every focus layer.
    pub async fn query_layer_info(&mut self) -> Result<Vec<LayerInfo>, DeviceError> {
        let (read_timeout, max_len) = (self.read_timeout, self.max_frame_len);
        let mut stream = self.begin("query_layer_info")?;

        let result = async {
            send_command(&mut stream, Opcode::GetLayers, &[]).await?;
            let payload = read_frame(&mut stream, max_len, read_timeout, None).await?;
            parse_layer_info(&payload)
        }
        .await;

        match result {
            Ok(layers) => {
                self.finish(stream);
                debug!(count = layers.len(), "Received layer info");
                self.layers = layers.clone();
                Ok(layers)
            }
            Err(e) => Err(self.fail("query_layer_info", e)),
        }
    }

    /// Capture `request.layers`, returning them in request order.
    ///
    /// `cancel` is checked before every read. On any failure no partial
    /// result is returned and the client ends up `Disconnected`.
    pub async fn start_scan(
        &mut self,
        request: &ScanRequest,
        cancel: &CancelSignal,
    ) -> Result<ScanResult, DeviceError> {
        let (read_timeout, max_len) = (self.read_timeout, self.max_frame_len);
        let mut stream = self.begin("start_scan")?;
        self.state = ConnectionState::Scanning;
        info!(
            layers = request.layers.len(),
            width = request.width,
            height = request.height,
            "Starting scan"
        );

        let result = receive_scan(&mut stream, request, max_len, read_timeout, cancel).await;

        match result {
            Ok(layers) => {
                self.finish(stream);
                let timestamp = unix_seconds();
                let slide_id = SLIDE_IDS
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .next(timestamp);
                let scan = ScanResult {
                    slide_id,
                    timestamp,
                    layers,
                };
                info!(slide_id = %scan.slide_id, layers = scan.layers.len(), "Scan complete");
                Ok(scan)
            }
            Err(e) => Err(self.fail("start_scan", e)),
        }
    }

    /// Query temperature, readiness and the active focus layer.
    pub async fn status(&mut self) -> Result<DeviceStatus, DeviceError> {
        let (read_timeout, max_len) = (self.read_timeout, self.max_frame_len);
        let mut stream = self.begin("status")?;

        let result = async {
            send_command(&mut stream, Opcode::Status, &[]).await?;
            let payload = read_frame(&mut stream, max_len, read_timeout, None).await?;
            parse_status(&payload)
        }
        .await;

        match result {
            Ok(status) => {
                self.finish(stream);
                Ok(status)
            }
            Err(e) => Err(self.fail("status", e)),
        }
    }

    /// Move the device focus to `layer`. The device sends no reply.
    pub async fn set_focus(&mut self, layer: u32) -> Result<(), DeviceError> {
        self.send_only("set_focus", Opcode::SetFocus, &layer.to_be_bytes())
            .await
    }

    /// Start a calibration cycle. The device sends no reply.
    pub async fn calibrate(&mut self) -> Result<(), DeviceError> {
        self.send_only("calibrate", Opcode::Calibrate, &[]).await
    }

    /// Send DISCONNECT if possible and release the connection.
    ///
    /// Never fails; the client is `Disconnected` afterwards.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let goodbye = async {
                send_command(&mut stream, Opcode::Disconnect, &[]).await?;
                stream.shutdown().await?;
                Ok::<(), DeviceError>(())
            };
            let outcome = tokio::time::timeout(self.read_timeout, goodbye)
                .await
                .unwrap_or(Err(DeviceError::Timeout {
                    operation: "close",
                    millis: self.read_timeout.as_millis() as u64,
                }));
            if let Err(e) = outcome {
                debug!(error = %e, "DISCONNECT not delivered");
            }
            info!("Capture device disconnected");
        }
        self.reset();
    }

    async fn send_only(
        &mut self,
        operation: &'static str,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), DeviceError> {
        let mut stream = self.begin(operation)?;
        match send_command(&mut stream, opcode, payload).await {
            Ok(()) => {
                self.finish(stream);
                Ok(())
            }
            Err(e) => Err(self.fail(operation, e)),
        }
    }

    /// Check state and take the stream for the duration of one exchange.
    fn begin(&mut self, operation: &'static str) -> Result<S, DeviceError> {
        if self.state != ConnectionState::Disconnected && self.stream.is_none() {
            warn!(
                operation,
                state = self.state.as_str(),
                "Previous device exchange was interrupted, dropping connection"
            );
            self.reset();
        }

        if self.state != ConnectionState::Connected {
            return Err(DeviceError::InvalidState {
                operation,
                required: ConnectionState::Connected.as_str(),
                actual: self.state.as_str(),
            });
        }

        self.stream.take().ok_or(DeviceError::InvalidState {
            operation,
            required: ConnectionState::Connected.as_str(),
            actual: ConnectionState::Disconnected.as_str(),
        })
    }

    /// Hand the stream back after a completed exchange.
    fn finish(&mut self, stream: S) {
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
    }

    fn fail(&mut self, operation: &'static str, err: DeviceError) -> DeviceError {
        warn!(operation, error = %err, "Device exchange failed, disconnecting");
        self.reset();
        err
    }

    fn reset(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
        self.layers.clear();
    }
}

async fn send_command<W>(stream: &mut W, opcode: Opcode, payload: &[u8]) -> Result<(), DeviceError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&encode_command(opcode, payload)).await?;
    stream.flush().await?;
    Ok(())
}

async fn receive_scan<S>(
    stream: &mut S,
    request: &ScanRequest,
    max_len: usize,
    read_timeout: Duration,
    cancel: &CancelSignal,
) -> Result<Vec<LayerData>, DeviceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    cancel.check()?;
    send_command(stream, Opcode::Scan, &encode_scan_payload(request)).await?;

    let mut layers = Vec::with_capacity(request.layers.len());
    for _ in &request.layers {
        let mut raw_header = [0u8; LAYER_HEADER_LEN];
        read_exact(stream, &mut raw_header, read_timeout, Some(cancel)).await?;
        let header = parse_layer_header(&raw_header);

        let len = header.data_length as usize;
        if len > max_len {
            return Err(DeviceError::Framing(format!(
                "layer {} declares {} bytes, limit is {}",
                header.layer, len, max_len
            )));
        }

        let mut data = bytes::BytesMut::zeroed(len);
        read_exact(stream, &mut data, read_timeout, Some(cancel)).await?;
        debug!(layer = header.layer, bytes = len, "Received layer");
        layers.push(LayerData::from_header(header, data.freeze()));
    }
    Ok(layers)
}

/// Issues `slide_<unix seconds>` ids, adding a `_<n>` suffix when an id
/// for the same second was already issued.
#[derive(Debug)]
struct SlideIds {
    second: u64,
    repeats: u32,
}

impl SlideIds {
    const fn new() -> Self {
        Self {
            second: 0,
            repeats: 0,
        }
    }

    fn next(&mut self, timestamp: u64) -> String {
        if timestamp == self.second {
            self.repeats += 1;
        } else {
            self.second = timestamp;
            self.repeats = 0;
        }
        match self.repeats {
            0 => format!("slide_{}", timestamp),
            n => format!("slide_{}_{}", timestamp, n),
        }
    }
}

static SLIDE_IDS: Mutex<SlideIds> = Mutex::new(SlideIds::new());

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
