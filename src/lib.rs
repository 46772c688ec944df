//! # cyto-viewer
//!
//! A tile server for multi-layer cytology slides.
//!
//! A slide is captured as a stack of focus layers. Tiles are read as raw
//! RGBA pixels, corrected on a compute backend (colour matrix, optional
//! focus stacking and sharpening), encoded to JPEG or WebP and kept in a
//! byte-budgeted cache.
//!
//! ## Features
//!
//! - **Byte-budgeted tile cache**: LRU eviction by total encoded size
//! - **Compute offload**: pixel kernels behind a backend trait, run off the async runtime
//! - **Bounded memory**: fixed pool of staging buffers shared by all requests
//! - **Batch rendering**: up to 100 tiles per request with per-tile results
//! - **Capture device client**: length-framed binary protocol over TCP or serial
//! - **Authentication**: optional HMAC-SHA256 session tokens
//!
//! ## Architecture
//!
//! - [`tile`] - Tile pipeline, batch coordinator, cache and encoding
//! - [`compute`] - Compute backend trait and CPU implementation
//! - [`pool`] - Staging buffer pool
//! - [`slide`] - Slide archives (disk and in-memory captures)
//! - [`device`] - Capture device protocol and client
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cyto_viewer::{
//!     create_router, AppState, BufferPool, CaptureStore, ChainedArchive, CpuBackend,
//!     FsSlideArchive, RouterConfig, TileCache, TilePipeline,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let captures = Arc::new(CaptureStore::default());
//!     let archive = ChainedArchive::new(captures.clone(), FsSlideArchive::new("./data/slides"));
//!     let pipeline = TilePipeline::new(
//!         archive,
//!         TileCache::with_capacity(512 * 1024 * 1024),
//!         BufferPool::new(16, 512 * 512 * 4),
//!         Arc::new(CpuBackend::new()),
//!     );
//!
//!     let state = AppState::new(pipeline, captures);
//!     let router = create_router(state, RouterConfig::without_auth());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod compute;
pub mod config;
pub mod device;
pub mod error;
pub mod pool;
pub mod server;
pub mod slide;
pub mod tile;

// Re-export commonly used types
pub use compute::{ColorMatrix, ComputeBackend, CpuBackend};
pub use config::{Cli, Command, DeviceArgs, ProbeConfig, ServeConfig};
pub use device::{
    CancelSignal, ConnectionState, DeviceClient, DeviceSettings, DeviceStatus, LayerInfo,
    ScanRequest, ScanResult, ScannerSession, Transport,
};
pub use error::{ArchiveError, ComputeError, DeviceError, PoolError, TileError};
pub use pool::BufferPool;
pub use server::{create_router, AppState, RouterConfig, SessionAuth};
pub use slide::{CaptureStore, ChainedArchive, FsSlideArchive, SlideArchive};
pub use tile::{
    BatchCoordinator, FocusComposite, PipelineSettings, TileCache, TileEncoder, TileFormat,
    TileIdentity, TilePipeline, TileRequest, TileResponse, TileResult,
};
