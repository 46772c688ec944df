//! In-memory store of slides captured from the device.
//!
//! A completed scan holds one full-resolution RGBA image per focus layer.
//! The store keeps the most recent scans and serves tiles by slicing them
//! out of those images, so freshly captured slides are viewable before they
//! reach long-term storage.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::compute::{rgba_len, BYTES_PER_PIXEL};
use crate::device::{LayerData, ScanResult};
use crate::error::ArchiveError;
use crate::tile::TileIdentity;

use super::SlideArchive;

/// Default number of captured slides kept in memory.
pub const DEFAULT_CAPTURE_SLIDES: usize = 4;

/// Summary of a captured slide.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapturedSlideInfo {
    pub slide_id: String,
    pub timestamp: u64,
    pub layers: Vec<u32>,
    pub width: u32,
    pub height: u32,
}

struct CapturedSlide {
    timestamp: u64,
    layers: HashMap<u32, LayerData>,
}

/// Recently captured slides, evicted least-recently-used first.
pub struct CaptureStore {
    slides: Mutex<LruCache<String, CapturedSlide>>,
}

impl CaptureStore {
    /// Keep at most `max_slides` scans (minimum 1).
    pub fn new(max_slides: usize) -> Self {
        let cap = NonZeroUsize::new(max_slides).unwrap_or(NonZeroUsize::MIN);
        Self {
            slides: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Store a completed scan and return its summary, along with the id of
    /// the older slide dropped to make room, if any.
    ///
    /// A scan with the id of a held slide replaces it.
    pub async fn insert(&self, scan: ScanResult) -> (CapturedSlideInfo, Option<String>) {
        let info = summarize(&scan.slide_id, scan.timestamp, &scan.layers);
        let layers = scan.layers.into_iter().map(|l| (l.layer, l)).collect();

        let mut slides = self.slides.lock().await;
        let pushed = slides.push(
            scan.slide_id,
            CapturedSlide {
                timestamp: scan.timestamp,
                layers,
            },
        );
        let evicted = pushed
            .map(|(id, _)| id)
            .filter(|id| *id != info.slide_id);
        if let Some(id) = &evicted {
            info!(slide_id = %id, "Dropped captured slide from memory");
        }
        (info, evicted)
    }

    /// Summaries of every held slide, most recent first.
    pub async fn list(&self) -> Vec<CapturedSlideInfo> {
        let slides = self.slides.lock().await;
        slides
            .iter()
            .map(|(id, slide)| {
                let layers: Vec<LayerData> = slide.layers.values().cloned().collect();
                summarize(id, slide.timestamp, &layers)
            })
            .collect()
    }

    /// Summary of one slide, without marking it recently used.
    pub async fn info(&self, slide_id: &str) -> Option<CapturedSlideInfo> {
        let slides = self.slides.lock().await;
        slides.peek(slide_id).map(|slide| {
            let layers: Vec<LayerData> = slide.layers.values().cloned().collect();
            summarize(slide_id, slide.timestamp, &layers)
        })
    }

    pub async fn contains(&self, slide_id: &str) -> bool {
        self.slides.lock().await.contains(slide_id)
    }

    pub async fn remove(&self, slide_id: &str) -> bool {
        self.slides.lock().await.pop(slide_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.slides.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slides.lock().await.is_empty()
    }
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_SLIDES)
    }
}

fn summarize(slide_id: &str, timestamp: u64, layers: &[LayerData]) -> CapturedSlideInfo {
    let mut indices: Vec<u32> = layers.iter().map(|l| l.layer).collect();
    indices.sort_unstable();
    let (width, height) = layers
        .iter()
        .map(|l| (l.width, l.height))
        .max()
        .unwrap_or((0, 0));
    CapturedSlideInfo {
        slide_id: slide_id.to_string(),
        timestamp,
        layers: indices,
        width,
        height,
    }
}

/// Copy the `width × height` tile at (`tile_x`, `tile_y`) out of `layer`.
///
/// Pixels past the right or bottom edge of the layer are transparent black.
fn slice_tile(
    layer: &LayerData,
    key: &str,
    tile_x: u32,
    tile_y: u32,
    width: u32,
    height: u32,
) -> Result<Bytes, ArchiveError> {
    if layer.compressed {
        return Err(ArchiveError::Corrupt {
            key: key.to_string(),
            message: "compressed layer data cannot be sliced".to_string(),
        });
    }
    let expected = rgba_len(layer.width, layer.height);
    if layer.raw_bytes.len() != expected {
        return Err(ArchiveError::Corrupt {
            key: key.to_string(),
            message: format!(
                "layer holds {} bytes, {}x{} RGBA needs {}",
                layer.raw_bytes.len(),
                layer.width,
                layer.height,
                expected
            ),
        });
    }

    let origin_x = tile_x as u64 * width as u64;
    let origin_y = tile_y as u64 * height as u64;
    if origin_x >= layer.width as u64 || origin_y >= layer.height as u64 {
        return Err(ArchiveError::NotFound(key.to_string()));
    }
    let (origin_x, origin_y) = (origin_x as usize, origin_y as usize);

    let copy_w = (layer.width as usize - origin_x).min(width as usize);
    let copy_h = (layer.height as usize - origin_y).min(height as usize);
    let src_stride = layer.width as usize * BYTES_PER_PIXEL;
    let dst_stride = width as usize * BYTES_PER_PIXEL;

    let mut out = vec![0u8; rgba_len(width, height)];
    for row in 0..copy_h {
        let src = (origin_y + row) * src_stride + origin_x * BYTES_PER_PIXEL;
        let dst = row * dst_stride;
        let n = copy_w * BYTES_PER_PIXEL;
        out[dst..dst + n].copy_from_slice(&layer.raw_bytes[src..src + n]);
    }
    Ok(Bytes::from(out))
}

#[async_trait]
impl SlideArchive for CaptureStore {
    /// Only zoom level 0 (native capture resolution) is held in memory.
    async fn read_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<Bytes, ArchiveError> {
        let key = identity.cache_key();
        if identity.zoom != 0 {
            return Err(ArchiveError::NotFound(key));
        }

        // Slice under the lock; the copy is bounded by one tile
        let mut slides = self.slides.lock().await;
        let layer = slides
            .get(identity.slide_id.as_ref())
            .and_then(|slide| slide.layers.get(&identity.focus_layer))
            .ok_or_else(|| ArchiveError::NotFound(key.clone()))?;
        slice_tile(layer, &key, identity.tile_x, identity.tile_y, width, height)
    }

    async fn has_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<bool, ArchiveError> {
        if identity.zoom != 0 {
            return Ok(false);
        }
        let slides = self.slides.lock().await;
        let found = slides
            .peek(identity.slide_id.as_ref())
            .and_then(|slide| slide.layers.get(&identity.focus_layer))
            .is_some_and(|layer| {
                (identity.tile_x as u64 * width as u64) < layer.width as u64
                    && (identity.tile_y as u64 * height as u64) < layer.height as u64
            });
        Ok(found)
    }
}

// =============================================================================
// Tests
// =============================================================================
