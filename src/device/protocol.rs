//! Wire format of the capture device protocol.
//!
//! All integers are big-endian. Everything here is transport-agnostic: the
//! encoders produce bytes, the parsers consume complete payloads, and the
//! read helpers work on any `AsyncRead`.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::DeviceError;

use super::CancelSignal;

/// Largest response payload or layer data block accepted by default (1 GiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024 * 1024;

/// Size of the `[u8 opcode][u32 length]` command prefix.
pub const COMMAND_HEADER_LEN: usize = 5;

/// Size of one record in the GET_LAYERS response.
pub const LAYER_RECORD_LEN: usize = 20;

/// Size of the header preceding each layer during a scan.
pub const LAYER_HEADER_LEN: usize = 32;

/// Minimum size of the STATUS response payload.
pub const STATUS_PAYLOAD_LEN: usize = 13;

/// Fixed part of the SCAN payload: origin, size, layer count.
const SCAN_FIXED_LEN: usize = 20;

// =============================================================================
// Opcodes
// =============================================================================

/// Command opcodes understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Connect = 0x01,
    Disconnect = 0x02,
    Scan = 0x03,
    GetLayers = 0x04,
    Calibrate = 0x05,
    Status = 0x06,
    SetFocus = 0x07,
    GetImage = 0x08,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Opcode::Connect),
            0x02 => Some(Opcode::Disconnect),
            0x03 => Some(Opcode::Scan),
            0x04 => Some(Opcode::GetLayers),
            0x05 => Some(Opcode::Calibrate),
            0x06 => Some(Opcode::Status),
            0x07 => Some(Opcode::SetFocus),
            0x08 => Some(Opcode::GetImage),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Geometry of one focus layer, reported once per session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerInfo {
    pub layer_index: u32,
    pub width: u32,
    pub height: u32,
    pub focus_depth_microns: f64,
    pub tile_size_pixels: u32,
}

/// Region and layers to capture.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScanRequest {
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
    pub layers: Vec<u32>,
}

/// Header sent by the device before each layer's pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerHeader {
    pub layer: u32,
    pub width: u32,
    pub height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub tile_size: u32,
    pub compressed: bool,
    pub data_length: u32,
}

/// One captured focus layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerData {
    pub layer: u32,
    pub raw_bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
    pub tile_size_pixels: u32,
    pub compressed: bool,
}

impl LayerData {
    pub fn from_header(header: LayerHeader, raw_bytes: Bytes) -> Self {
        Self {
            layer: header.layer,
            raw_bytes,
            width: header.width,
            height: header.height,
            tiles_x: header.tiles_x,
            tiles_y: header.tiles_y,
            tile_size_pixels: header.tile_size,
            compressed: header.compressed,
        }
    }
}

/// Result of a completed scan: every requested layer, in request order.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// `slide_<unix seconds>`, suffixed `_<n>` for repeats within a second
    pub slide_id: String,

    /// Unix seconds at which the scan completed
    pub timestamp: u64,

    pub layers: Vec<LayerData>,
}

/// Device health as reported by STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub temperature_celsius: f64,
    pub ready: bool,
    pub error_code: u32,
    pub current_layer: u32,
}

// =============================================================================
// Encoding
// =============================================================================

/// Frame a command: `[opcode][u32 BE payload length][payload]`.
pub fn encode_command(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(COMMAND_HEADER_LEN + payload.len());
    buf.put_u8(opcode.as_u8());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Parse one complete command frame. Used by device simulators and tests.
pub fn decode_command(frame: &[u8]) -> Result<(Opcode, Bytes), DeviceError> {
    if frame.len() < COMMAND_HEADER_LEN {
        return Err(DeviceError::Framing(format!(
            "command frame is {} bytes, header needs {}",
            frame.len(),
            COMMAND_HEADER_LEN
        )));
    }
    let mut buf = frame;
    let raw = buf.get_u8();
    let opcode = Opcode::from_u8(raw)
        .ok_or_else(|| DeviceError::Framing(format!("unknown opcode 0x{:02x}", raw)))?;
    let len = buf.get_u32() as usize;
    if buf.remaining() != len {
        return Err(DeviceError::Framing(format!(
            "declared payload {} bytes, frame carries {}",
            len,
            buf.remaining()
        )));
    }
    Ok((opcode, Bytes::copy_from_slice(buf)))
}

/// SCAN payload: origin, size, layer count, then one u32 per layer.
pub fn encode_scan_payload(request: &ScanRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(SCAN_FIXED_LEN + 4 * request.layers.len());
    buf.put_u32(request.start_x);
    buf.put_u32(request.start_y);
    buf.put_u32(request.width);
    buf.put_u32(request.height);
    buf.put_u32(request.layers.len() as u32);
    for layer in &request.layers {
        buf.put_u32(*layer);
    }
    buf.freeze()
}

/// Inverse of [`encode_scan_payload`].
pub fn decode_scan_payload(payload: &[u8]) -> Result<ScanRequest, DeviceError> {
    if payload.len() < SCAN_FIXED_LEN {
        return Err(DeviceError::Framing(format!(
            "scan payload is {} bytes, needs at least {}",
            payload.len(),
            SCAN_FIXED_LEN
        )));
    }
    let mut buf = payload;
    let start_x = buf.get_u32();
    let start_y = buf.get_u32();
    let width = buf.get_u32();
    let height = buf.get_u32();
    let count = buf.get_u32() as usize;
    if buf.remaining() != count * 4 {
        return Err(DeviceError::Framing(format!(
            "scan payload declares {} layers but carries {} bytes of indices",
            count,
            buf.remaining()
        )));
    }
    let layers = (0..count).map(|_| buf.get_u32()).collect();
    Ok(ScanRequest {
        start_x,
        start_y,
        width,
        height,
        layers,
    })
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse the GET_LAYERS response: `[u32 count][20-byte record]*`.
///
/// Focus depth travels in thousandths of a micron.
pub fn parse_layer_info(payload: &[u8]) -> Result<Vec<LayerInfo>, DeviceError> {
    if payload.len() < 4 {
        return Err(DeviceError::Framing(format!(
            "layer info payload is {} bytes, count needs 4",
            payload.len()
        )));
    }
    let mut buf = payload;
    let count = buf.get_u32() as usize;
    let needed = count.saturating_mul(LAYER_RECORD_LEN);
    if buf.remaining() < needed {
        return Err(DeviceError::Framing(format!(
            "layer info declares {} records ({} bytes) but carries {}",
            count,
            needed,
            buf.remaining()
        )));
    }

    let mut layers = Vec::with_capacity(count);
    for _ in 0..count {
        layers.push(LayerInfo {
            layer_index: buf.get_u32(),
            width: buf.get_u32(),
            height: buf.get_u32(),
            focus_depth_microns: buf.get_u32() as f64 / 1000.0,
            tile_size_pixels: buf.get_u32(),
        });
    }
    Ok(layers)
}

/// Parse a 32-byte layer header.
///
/// Byte 24 is the compressed flag (1 = compressed), bytes 25-27 are padding,
/// bytes 28-31 are the data length.
pub fn parse_layer_header(header: &[u8; LAYER_HEADER_LEN]) -> LayerHeader {
    let mut buf = &header[..];
    let layer = buf.get_u32();
    let width = buf.get_u32();
    let height = buf.get_u32();
    let tiles_x = buf.get_u32();
    let tiles_y = buf.get_u32();
    let tile_size = buf.get_u32();
    let compressed = buf.get_u8() == 1;
    buf.advance(3);
    let data_length = buf.get_u32();
    LayerHeader {
        layer,
        width,
        height,
        tiles_x,
        tiles_y,
        tile_size,
        compressed,
        data_length,
    }
}

/// Parse the STATUS response.
///
/// Temperature travels in hundredths of a degree.
pub fn parse_status(payload: &[u8]) -> Result<DeviceStatus, DeviceError> {
    if payload.len() < STATUS_PAYLOAD_LEN {
        return Err(DeviceError::Framing(format!(
            "status payload is {} bytes, needs {}",
            payload.len(),
            STATUS_PAYLOAD_LEN
        )));
    }
    let mut buf = payload;
    let temperature = buf.get_u32();
    let ready = buf.get_u8() == 1;
    let error_code = buf.get_u32();
    let current_layer = buf.get_u32();
    Ok(DeviceStatus {
        connected: true,
        temperature_celsius: temperature as f64 / 100.0,
        ready,
        error_code,
        current_layer,
    })
}

// =============================================================================
// Reading
// =============================================================================

/// Fill `buf` completely, looping over partial reads.
///
/// Each individual read is bounded by `read_timeout`. When `cancel` is given
/// it is checked before every read, and its deadline also bounds the wait.
/// End of stream before `buf` is full is [`DeviceError::Closed`].
pub async fn read_exact<R>(
    reader: &mut R,
    buf: &mut [u8],
    read_timeout: Duration,
    cancel: Option<&CancelSignal>,
) -> Result<(), DeviceError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let mut wait = read_timeout;
        if let Some(signal) = cancel {
            signal.check()?;
            if let Some(remaining) = signal.remaining() {
                wait = wait.min(remaining);
            }
        }

        let n = match tokio::time::timeout(wait, reader.read(&mut buf[filled..])).await {
            Ok(result) => result?,
            Err(_) => {
                if let Some(signal) = cancel {
                    signal.check()?;
                }
                return Err(DeviceError::Timeout {
                    operation: "read",
                    millis: read_timeout.as_millis() as u64,
                });
            }
        };
        if n == 0 {
            return Err(DeviceError::Closed {
                expected: buf.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Read a `[u32 BE length][payload]` response.
pub async fn read_frame<R>(
    reader: &mut R,
    max_len: usize,
    read_timeout: Duration,
    cancel: Option<&CancelSignal>,
) -> Result<Bytes, DeviceError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact(reader, &mut len_buf, read_timeout, cancel).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(DeviceError::Framing(format!(
            "response of {} bytes exceeds limit of {}",
            len, max_len
        )));
    }

    let mut payload = BytesMut::zeroed(len);
    read_exact(reader, &mut payload, read_timeout, cancel).await?;
    Ok(payload.freeze())
}

// =============================================================================
// Tests
// =============================================================================
