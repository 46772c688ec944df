//! Slide archive layer.
//!
//! The tile pipeline reads raw RGBA pixels through the [`SlideArchive`]
//! trait. Two sources exist in a running server:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Tile Pipeline              │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │             ChainedArchive              │
//! │    (capture store first, then disk)     │
//! └────────────────────┬────────────────────┘
//!                      │
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//! ┌─────────────────┐    ┌─────────────────────┐
//! │  CaptureStore   │    │   FsSlideArchive    │
//! │ (recent scans)  │    │  (pre-cut .raw)     │
//! └─────────────────┘    └─────────────────────┘
//! ```

mod archive;
mod capture;

pub use archive::{ChainedArchive, FsSlideArchive, SlideArchive};
pub use capture::{CaptureStore, CapturedSlideInfo, DEFAULT_CAPTURE_SLIDES};
