//! Configuration management for the cyto-viewer binary.
//!
//! Settings come from:
//! - Command-line arguments via clap
//! - Environment variables with the `CYTO_` prefix
//! - Defaults for everything optional
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use cyto_viewer::config::{Cli, Command};
//!
//! match Cli::parse().command {
//!     Command::Serve(config) => println!("Listening on {}", config.bind_address()),
//!     Command::Probe(config) => println!("Probing {}", config.device.address),
//! }
//! ```
//!
//! # Environment Variables
//!
//! - `CYTO_HOST` - Server bind address (default: 0.0.0.0)
//! - `CYTO_PORT` - Server port (default: 8080)
//! - `CYTO_CACHE_SIZE_MB` - Tile cache budget in megabytes (default: 8192)
//! - `CYTO_COLOR_CORRECTION` - Apply the scanner colour matrix (default: true)
//! - `CYTO_SHARPEN_AMOUNT` - Unsharp mask strength (default: off)
//! - `CYTO_BATCH_WORKERS` - Concurrent batch workers (default: 4)
//! - `CYTO_POOL_BUFFERS` - Pixel buffers in the staging pool (default: 16)
//! - `CYTO_TILE_SIZE` - Tile edge in pixels (default: 512)
//! - `CYTO_STORAGE_PATH` - Root of the pre-cut tile archive (default: ./data/slides)
//! - `CYTO_CAPTURE_SLIDES` - Recent scans held in memory (default: 4)
//! - `CYTO_DEVICE_ENABLED` - Talk to a capture device (default: false)
//! - `CYTO_DEVICE_PROTOCOL` - `tcp` or `serial` (default: tcp)
//! - `CYTO_DEVICE_ADDRESS` - `host:port` or device path (default: localhost:9090)
//! - `CYTO_AUTH_ENABLED` - Require a session for `/api` routes (default: false)
//! - `CYTO_AUTH_SECRET` - HMAC secret for session tokens
//! - `CYTO_AUTH_PASSWORD` - Password accepted by `/api/login`

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::device::{DeviceSettings, Transport, DEFAULT_MAX_FRAME_LEN};
use crate::pool::DEFAULT_POOL_BUFFERS;
use crate::slide::DEFAULT_CAPTURE_SLIDES;
use crate::tile::{DEFAULT_BATCH_WORKERS, DEFAULT_TILE_SIZE};

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default tile cache budget in megabytes.
pub const DEFAULT_CACHE_SIZE_MB: usize = 8192;

/// Default root of the pre-cut tile archive.
pub const DEFAULT_STORAGE_PATH: &str = "./data/slides";

/// Default device address.
pub const DEFAULT_DEVICE_ADDRESS: &str = "localhost:9090";

/// Default device connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default per-read device timeout in seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Default bound on a whole scan in seconds.
pub const DEFAULT_SCAN_DEADLINE_SECS: u64 = 300;

/// Default session lifetime in hours.
pub const DEFAULT_TOKEN_TTL_HOURS: u64 = 24;

/// Largest accepted tile edge.
pub const MAX_TILE_SIZE: u32 = 4096;

// =============================================================================
// CLI Arguments
// =============================================================================

/// cyto-viewer - tile server for multi-layer cytology slides.
#[derive(Parser, Debug, Clone)]
#[command(name = "cyto-viewer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP tile server.
    Serve(ServeConfig),

    /// Connect to the capture device and print its layers and status.
    Probe(ProbeConfig),
}

/// Capture device connection settings, shared by `serve` and `probe`.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Link to the device: `tcp` or `serial`.
    #[arg(long = "device-protocol", default_value = "tcp", env = "CYTO_DEVICE_PROTOCOL")]
    pub protocol: String,

    /// `host:port` for TCP, character device path for serial.
    #[arg(long = "device-address", default_value = DEFAULT_DEVICE_ADDRESS, env = "CYTO_DEVICE_ADDRESS")]
    pub address: String,

    /// Seconds allowed for opening the link.
    #[arg(long = "device-connect-timeout", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "CYTO_DEVICE_CONNECT_TIMEOUT")]
    pub connect_timeout_secs: u64,

    /// Seconds allowed for each individual read.
    #[arg(long = "device-read-timeout", default_value_t = DEFAULT_READ_TIMEOUT_SECS, env = "CYTO_DEVICE_READ_TIMEOUT")]
    pub read_timeout_secs: u64,
}

impl DeviceArgs {
    pub fn transport(&self) -> Result<Transport, String> {
        self.protocol.parse()
    }

    /// Build client settings. Call `validate()` first.
    pub fn settings(&self) -> Result<DeviceSettings, String> {
        Ok(DeviceSettings {
            transport: self.transport()?,
            address: self.address.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        self.transport()?;
        if self.address.is_empty() {
            return Err("device address is required".to_string());
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err("device timeouts must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Configuration for the `serve` command.
#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "CYTO_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "CYTO_PORT")]
    pub port: u16,

    /// Allowed CORS origins (comma-separated).
    ///
    /// If not specified, allows any origin.
    #[arg(long, env = "CYTO_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Compute and Cache Configuration
    // =========================================================================
    /// Tile cache budget in megabytes of encoded tile data.
    #[arg(long, default_value_t = DEFAULT_CACHE_SIZE_MB, env = "CYTO_CACHE_SIZE_MB")]
    pub cache_size_mb: usize,

    /// Apply the scanner colour correction matrix to every tile.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "CYTO_COLOR_CORRECTION")]
    pub color_correction: bool,

    /// Unsharp mask strength. Sharpening is off when unset.
    #[arg(long, env = "CYTO_SHARPEN_AMOUNT")]
    pub sharpen_amount: Option<f32>,

    /// Workers rendering the items of one batch request.
    #[arg(long, default_value_t = DEFAULT_BATCH_WORKERS, env = "CYTO_BATCH_WORKERS")]
    pub batch_workers: usize,

    /// Pixel buffers in the staging pool.
    #[arg(long, default_value_t = DEFAULT_POOL_BUFFERS, env = "CYTO_POOL_BUFFERS")]
    pub pool_buffers: usize,

    /// Tile edge in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "CYTO_TILE_SIZE")]
    pub tile_size: u32,

    // =========================================================================
    // Storage Configuration
    // =========================================================================
    /// Root of the pre-cut tile archive.
    #[arg(long, default_value = DEFAULT_STORAGE_PATH, env = "CYTO_STORAGE_PATH")]
    pub storage_path: PathBuf,

    /// Completed scans kept in memory.
    #[arg(long, default_value_t = DEFAULT_CAPTURE_SLIDES, env = "CYTO_CAPTURE_SLIDES")]
    pub capture_slides: usize,

    // =========================================================================
    // Device Configuration
    // =========================================================================
    /// Enable the scanner routes.
    ///
    /// The server starts even when the device is unreachable; it connects on
    /// first use.
    #[arg(long, default_value_t = false, env = "CYTO_DEVICE_ENABLED")]
    pub device_enabled: bool,

    #[command(flatten)]
    pub device: DeviceArgs,

    /// Seconds allowed for a whole scan.
    #[arg(long, default_value_t = DEFAULT_SCAN_DEADLINE_SECS, env = "CYTO_SCAN_DEADLINE")]
    pub scan_deadline_secs: u64,

    // =========================================================================
    // Authentication Configuration
    // =========================================================================
    /// Require a session token on `/api` routes.
    #[arg(long, default_value_t = false, env = "CYTO_AUTH_ENABLED")]
    pub auth_enabled: bool,

    /// Secret key for signing session tokens.
    ///
    /// If not provided and auth is enabled, the server will fail to start.
    #[arg(long, env = "CYTO_AUTH_SECRET")]
    pub auth_secret: Option<String>,

    /// Password accepted by `/api/login`. Any password is accepted when unset.
    #[arg(long, env = "CYTO_AUTH_PASSWORD")]
    pub auth_password: Option<String>,

    /// Session lifetime in hours.
    #[arg(long, default_value_t = DEFAULT_TOKEN_TTL_HOURS, env = "CYTO_TOKEN_TTL_HOURS")]
    pub token_ttl_hours: u64,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_enabled && !matches!(self.auth_secret.as_deref(), Some(s) if !s.is_empty()) {
            return Err(
                "Authentication is enabled but no secret provided. \
                 Set --auth-secret or CYTO_AUTH_SECRET, or disable auth"
                    .to_string(),
            );
        }
        if self.auth_enabled && self.token_ttl_hours == 0 {
            return Err("token_ttl_hours must be greater than 0".to_string());
        }

        if self.port == 0 {
            return Err("port must be greater than 0".to_string());
        }

        if self.cache_size_mb == 0 {
            return Err("cache_size_mb must be at least 1".to_string());
        }
        if self.batch_workers == 0 {
            return Err("batch_workers must be greater than 0".to_string());
        }
        if self.pool_buffers == 0 {
            return Err("pool_buffers must be greater than 0".to_string());
        }
        if self.capture_slides == 0 {
            return Err("capture_slides must be greater than 0".to_string());
        }

        if self.tile_size == 0 || self.tile_size > MAX_TILE_SIZE {
            return Err(format!("tile_size must be between 1 and {}", MAX_TILE_SIZE));
        }

        if let Some(amount) = self.sharpen_amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err("sharpen_amount must be a non-negative number".to_string());
            }
        }

        if self.device_enabled {
            self.device.validate()?;
            if self.scan_deadline_secs == 0 {
                return Err("scan_deadline must be greater than 0".to_string());
            }
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cache_capacity_bytes(&self) -> usize {
        self.cache_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn scan_deadline(&self) -> Duration {
        Duration::from_secs(self.scan_deadline_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_hours * 60 * 60)
    }
}

/// Configuration for the `probe` command.
#[derive(Args, Debug, Clone)]
pub struct ProbeConfig {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

// =============================================================================
// Tests
// =============================================================================
