//! Tile request pipeline.
//!
//! Everything between an HTTP tile request and the encoded bytes sent back:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       HTTP Handlers / Batch Route       │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │            BatchCoordinator             │
//! │     (N workers over a shared queue)     │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              TilePipeline               │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │   TileEncoder   │  │
//! │  │ (byte-budget │  │ (JPEG / WebP)   │  │
//! │  │    LRU)      │  │                 │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └──────┬──────────────┬──────────────┬────┘
//!        ▼              ▼              ▼
//!   SlideArchive    BufferPool   ComputeBackend
//! ```
//!
//! # Components
//!
//! - [`TilePipeline`]: cache lookup, raw load, kernels, encode, cache store
//! - [`BatchCoordinator`]: bounded fan-out with one result slot per request
//! - [`TileCache`]: LRU cache of encoded tiles budgeted by total bytes
//! - [`TileIdentity`]: slide, focus layer, position and zoom of one tile
//! - [`TileRequest`]: identity plus output size, format and quality
//! - [`TileEncoder`]: RGBA to JPEG or WebP
//!
//! # Example
//!
//! ```
//! use cyto_viewer::tile::{TileCache, TileIdentity, TileResult};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = TileCache::with_capacity(64 * 1024 * 1024);
//!     let key = TileIdentity::new("slide_1700000000", 12, 3, 4, 0).cache_key();
//!     assert_eq!(key, "slide_1700000000:12:3:4:0");
//!
//!     if cache.get(&key).await.is_none() {
//!         let result = TileResult {
//!             encoded_bytes: vec![0u8; 128],
//!             width: 512,
//!             height: 512,
//!             content_type: "image/webp",
//!             cache_key: key.clone(),
//!         };
//!         cache.set(key.clone(), result).await;
//!     }
//!     assert!(cache.contains(&key).await);
//! }
//! ```

mod batch;
mod cache;
mod encoder;
mod request;
mod service;

#[cfg(test)]
mod test_support;

pub use batch::{BatchCoordinator, BatchSlot, DEFAULT_BATCH_WORKERS, MAX_BATCH_SIZE};
pub use cache::{CacheStats, TileCache, DEFAULT_TILE_CACHE_CAPACITY};
pub use encoder::{
    clamp_quality, TileEncoder, TileFormat, DEFAULT_QUALITY, MAX_QUALITY, MIN_QUALITY,
};
pub use request::{
    FocusComposite, TileIdentity, TileRequest, TileResult, DEFAULT_TILE_SIZE, FOCUS_LAYER_COUNT,
    MAX_FOCUS_LAYER,
};
pub use service::{PipelineSettings, TilePipeline, TileResponse};
