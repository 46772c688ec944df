//! Capture device client.
//!
//! The capture device streams raw focus-layer images over a length-framed
//! binary protocol, either on TCP or on a serial character device.
//!
//! # Protocol
//!
//! ```text
//! command:  [u8 opcode][u32 BE length][payload]
//! response: [u32 BE length][payload]
//! ```
//!
//! During a scan the device answers with one block per requested layer:
//! a 32-byte [`LayerHeader`] followed by `data_length` bytes of pixel data.
//!
//! # Connection State
//!
//! ```text
//! Disconnected ──connect──► Connecting ──handshake──► Connected
//!      ▲                                                 │  ▲
//!      │                                    start_scan   ▼  │ all layers read
//!      └───────────── any I/O or framing failure ───── Scanning
//! ```
//!
//! [`ScannerSession`] wraps one client for shared use by request handlers
//! and reconnects after failures.

mod client;
mod protocol;
mod session;

pub use client::{ConnectionState, DeviceClient, DeviceIo, DeviceSettings, Transport};
pub use protocol::{
    decode_command, decode_scan_payload, encode_command, encode_scan_payload, parse_layer_header,
    parse_layer_info, parse_status, read_exact, read_frame, DeviceStatus, LayerData, LayerHeader,
    LayerInfo, Opcode, ScanRequest, ScanResult, COMMAND_HEADER_LEN, DEFAULT_MAX_FRAME_LEN,
    LAYER_HEADER_LEN, LAYER_RECORD_LEN, STATUS_PAYLOAD_LEN,
};
pub use session::{ScannerSession, DEFAULT_SCAN_DEADLINE};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::DeviceError;

// =============================================================================
// Cancel Signal
// =============================================================================

/// Cancellation flag with an optional deadline.
///
/// Checked before every device read during a scan. Clones share the flag,
/// so any holder can cancel.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    /// A signal with no deadline that only fires on [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that also fires once `timeout` has elapsed.
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if cancelled or past the deadline.
    pub fn check(&self) -> Result<(), DeviceError> {
        if self.is_cancelled() {
            return Err(DeviceError::Cancelled("cancelled by caller"));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(DeviceError::Cancelled("deadline exceeded"));
            }
        }
        Ok(())
    }
}
