use thiserror::Error;

/// Errors raised by the capture device client.
///
/// Every variant except `InvalidState` leaves the client in
/// `ConnectionState::Disconnected`.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// Connection-level I/O failure (reset, refused, broken pipe)
    #[error("Device I/O error: {0}")]
    Io(String),

    /// Connect or read did not complete in time
    #[error("Device timed out during {operation} after {millis}ms")]
    Timeout { operation: &'static str, millis: u64 },

    /// Stream ended before the declared length was read
    #[error("Device closed the connection: expected {expected} bytes, got {received}")]
    Closed { expected: usize, received: usize },

    /// Declared length inconsistent with the payload or over the frame limit
    #[error("Protocol framing error: {0}")]
    Framing(String),

    /// Operation not allowed in the current connection state
    #[error("Invalid device state: {operation} requires {required}, client is {actual}")]
    InvalidState {
        operation: &'static str,
        required: &'static str,
        actual: &'static str,
    },

    /// Scan receive aborted by the caller's cancel signal or deadline
    #[error("Scan cancelled: {0}")]
    Cancelled(&'static str),

    /// Unsupported transport or bad address
    #[error("Invalid device configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Io(err.to_string())
    }
}

/// Errors raised by a compute backend.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    /// Device memory could not be allocated
    #[error("Device allocation of {len} bytes failed: {message}")]
    Allocation { len: usize, message: String },

    /// Unknown or already-freed device buffer handle
    #[error("Invalid device buffer handle: {0}")]
    InvalidBuffer(u64),

    /// Host/device copy had mismatched lengths
    #[error("Copy size mismatch: device buffer is {device} bytes, host slice is {host}")]
    CopySize { device: usize, host: usize },

    /// Kernel arguments rejected or kernel execution failed
    #[error("Kernel {kernel} failed: {message}")]
    Kernel {
        kernel: &'static str,
        message: String,
    },
}

/// Errors raised by a slide archive.
#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    /// Slide or tile not present in the archive
    #[error("Not found in archive: {0}")]
    NotFound(String),

    /// Underlying storage failure
    #[error("Archive I/O error: {0}")]
    Io(String),

    /// Stored data does not match the expected tile layout
    #[error("Corrupt archive data for {key}: {message}")]
    Corrupt { key: String, message: String },
}

/// Errors that can occur while serving a tile.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// Focus layer outside 0..=39
    #[error("Invalid focus layer: {layer} (valid range: 0-{max})")]
    InvalidLayer { layer: u32, max: u32 },

    /// Quality outside 1..=100
    #[error("Invalid quality: {quality} (must be 1-100)")]
    InvalidQuality { quality: u32 },

    /// Unknown output format name
    #[error("Invalid format: {format} (expected jpeg, webp or avif)")]
    InvalidFormat { format: String },

    /// Output dimensions are zero or exceed the pooled buffer capacity
    #[error("Invalid tile size {width}x{height}: {reason}")]
    InvalidSize {
        width: u32,
        height: u32,
        reason: String,
    },

    /// Focus composite with mismatched or empty layer/weight lists
    #[error("Invalid focus composite: {0}")]
    InvalidComposite(String),

    /// Batch exceeds the hard item cap
    #[error("Batch size too large: {size} (max {max})")]
    BatchTooLarge { size: usize, max: usize },

    /// Raw layer bytes could not be loaded
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// No pooled buffer could be checked out
    #[error("Buffer pool error: {0}")]
    Pool(#[from] PoolError),

    /// Backend allocation, copy, or kernel failure
    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),

    /// Encoding the corrected pixels failed
    #[error("Failed to encode tile: {message}")]
    EncodeError { message: String },

    /// A worker or blocking task failed unexpectedly
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the buffer pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Requested length exceeds the fixed per-buffer capacity
    #[error("Requested {requested} bytes exceeds pooled buffer capacity of {capacity} bytes")]
    TooLarge { requested: usize, capacity: usize },

    /// Pool was shut down while waiting for a buffer
    #[error("Buffer pool closed")]
    Closed,
}
