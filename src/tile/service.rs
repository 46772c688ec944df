//! Tile pipeline: cache lookup, raw load, compute, encode, cache store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          TilePipeline                            │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                       get_tile()                           │  │
//! │  │  1. Apply defaults, validate   5. Kernels on blocking pool │  │
//! │  │  2. Check cache                6. Encode                   │  │
//! │  │  3. Read raw layers            7. Cache & return           │  │
//! │  │  4. Check out pooled buffer                                │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │        │              │               │                │         │
//! │        ▼              ▼               ▼                ▼         │
//! │  ┌───────────┐ ┌──────────────┐ ┌────────────┐ ┌──────────────┐  │
//! │  │ TileCache │ │ SlideArchive │ │ BufferPool │ │ComputeBackend│  │
//! │  └───────────┘ └──────────────┘ └────────────┘ └──────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The kernel sequence per tile is
//! `upload → [focus_stack] → color_correct → [sharpen] → download`,
//! all inside one [`DeviceScope`] so device memory is freed on every path.
//! A failed tile is never cached.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::compute::{rgba_len, ColorMatrix, ComputeBackend, DeviceScope};
use crate::error::{ComputeError, TileError};
use crate::pool::BufferPool;
use crate::slide::SlideArchive;

use super::cache::TileCache;
use super::encoder::TileEncoder;
use super::request::{TileRequest, TileResult};

// =============================================================================
// Settings
// =============================================================================

/// Per-server pixel correction settings.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    /// Colour transform applied to every tile; `None` copies pixels through
    pub color_matrix: Option<ColorMatrix>,

    /// Unsharp mask strength; `None` skips sharpening
    pub sharpen_amount: Option<f32>,
}

// =============================================================================
// Tile Response
// =============================================================================

/// Response from the tile pipeline.
#[derive(Debug, Clone)]
pub struct TileResponse {
    /// The encoded tile
    pub result: TileResult,

    /// Whether this tile was served from cache
    pub cache_hit: bool,
}

// =============================================================================
// Tile Pipeline
// =============================================================================

/// Serves encoded tiles, rendering and caching them on first request.
///
/// # Type Parameters
///
/// * `A` - The slide archive supplying raw pixels
///
/// # Example
///
/// ```ignore
/// use cyto_viewer::tile::{TileIdentity, TilePipeline, TileRequest};
///
/// let pipeline = TilePipeline::new(archive, cache, pool, backend);
///
/// let request = TileRequest::new(TileIdentity::new("slide_1700000000", 12, 3, 4, 0));
/// let response = pipeline.get_tile(request).await?;
///
/// println!("{} bytes, cache hit: {}", response.result.size_bytes(), response.cache_hit);
/// ```
pub struct TilePipeline<A: SlideArchive> {
    archive: A,
    cache: TileCache,
    pool: BufferPool,
    backend: Arc<dyn ComputeBackend>,
    encoder: TileEncoder,
    settings: PipelineSettings,
}

impl<A: SlideArchive> TilePipeline<A> {
    /// Create a pipeline with no colour correction or sharpening.
    pub fn new(
        archive: A,
        cache: TileCache,
        pool: BufferPool,
        backend: Arc<dyn ComputeBackend>,
    ) -> Self {
        Self {
            archive,
            cache,
            pool,
            backend,
            encoder: TileEncoder::new(),
            settings: PipelineSettings::default(),
        }
    }

    /// Replace the pixel correction settings.
    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Get a tile, using the cache when available.
    ///
    /// Unset format and quality default to WebP and 85 before anything else
    /// happens. Invalid requests are rejected before the cache is consulted.
    ///
    /// # Errors
    ///
    /// Validation errors, `Archive` when raw pixels cannot be loaded,
    /// `Pool` when no buffer fits, `Compute`/`EncodeError` when rendering
    /// fails. None of these leave anything in the cache.
    pub async fn get_tile(&self, request: TileRequest) -> Result<TileResponse, TileError> {
        let request = request.with_defaults();
        request.validate(self.pool.buffer_capacity())?;

        let cache_key = request.cache_key();
        if let Some(result) = self.cache.get(&cache_key).await {
            debug!(cache_key = %cache_key, "Tile cache hit");
            return Ok(TileResponse {
                result,
                cache_hit: true,
            });
        }
        debug!(cache_key = %cache_key, "Tile cache miss");

        let result = match self.render(&request, cache_key.clone()).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    cache_key = %cache_key,
                    slide_id = %request.identity.slide_id,
                    error = %e,
                    "Tile render failed"
                );
                return Err(e);
            }
        };

        self.cache.set(cache_key, result.clone()).await;

        Ok(TileResponse {
            result,
            cache_hit: false,
        })
    }

    /// Whether a validated request can be served without rendering it:
    /// either it is cached or every source layer is in the archive.
    pub async fn is_available(&self, request: &TileRequest) -> Result<bool, TileError> {
        if self.cache.contains(&request.cache_key()).await {
            return Ok(true);
        }
        let layers = match &request.composite {
            Some(composite) => composite.layers.clone(),
            None => vec![request.identity.focus_layer],
        };
        for layer in layers {
            let identity = request.identity.with_layer(layer);
            if !self
                .archive
                .has_tile(&identity, request.width, request.height)
                .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Render a validated request without touching the cache.
    pub async fn render(
        &self,
        request: &TileRequest,
        cache_key: String,
    ) -> Result<TileResult, TileError> {
        let (width, height) = (request.width, request.height);
        let format = request.resolved_format();
        let quality = request.resolved_quality();

        let (layer_ids, weights) = match &request.composite {
            Some(composite) => (composite.layers.clone(), Some(composite.weights.clone())),
            None => (vec![request.identity.focus_layer], None),
        };

        let mut raw_layers = Vec::with_capacity(layer_ids.len());
        for layer in layer_ids {
            let identity = request.identity.with_layer(layer);
            raw_layers.push(self.archive.read_tile(&identity, width, height).await?);
        }

        let mut pixels = self.pool.checkout(rgba_len(width, height)).await?;

        let backend = Arc::clone(&self.backend);
        let encoder = self.encoder.clone();
        let settings = self.settings.clone();

        // The pooled buffer moves into the task and is returned when the
        // closure ends, even if the caller stops waiting.
        let task = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, TileError> {
            run_kernels(
                backend.as_ref(),
                &raw_layers,
                weights.as_deref(),
                &mut pixels,
                width,
                height,
                &settings,
            )?;
            encoder.encode(&pixels, width, height, format, quality)
        });

        let encoded_bytes = task
            .await
            .map_err(|e| TileError::Internal(format!("compute task failed: {}", e)))??;

        Ok(TileResult {
            encoded_bytes,
            width,
            height,
            content_type: format.content_type(),
            cache_key,
        })
    }

    /// Tile cache shared by every request through this pipeline.
    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    /// Name of the compute backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }
}

/// Run the kernel sequence for one tile and download the result into `out`.
fn run_kernels(
    backend: &dyn ComputeBackend,
    layers: &[Bytes],
    weights: Option<&[f32]>,
    out: &mut [u8],
    width: u32,
    height: u32,
    settings: &PipelineSettings,
) -> Result<(), ComputeError> {
    let len = out.len();
    let mut scope = DeviceScope::new(backend);

    let mut current = match weights {
        Some(weights) => {
            let inputs = layers
                .iter()
                .map(|layer| scope.upload(layer))
                .collect::<Result<Vec<_>, _>>()?;
            let stacked = scope.alloc(len)?;
            backend.focus_stack(&inputs, weights, &stacked, width, height)?;
            stacked
        }
        None => {
            let layer = layers.first().ok_or_else(|| ComputeError::Kernel {
                kernel: "upload",
                message: "no input layer".to_string(),
            })?;
            scope.upload(layer)?
        }
    };

    let corrected = scope.alloc(len)?;
    backend.color_correct(
        &current,
        &corrected,
        width,
        height,
        settings.color_matrix.as_ref(),
    )?;
    current = corrected;

    if let Some(amount) = settings.sharpen_amount {
        let sharpened = scope.alloc(len)?;
        backend.sharpen(&current, &sharpened, width, height, amount)?;
        current = sharpened;
    }

    backend.download(&current, out)
}

impl<A: SlideArchive> std::fmt::Debug for TilePipeline<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TilePipeline")
            .field("backend", &self.backend.name())
            .field("cache_capacity", &self.cache.capacity())
            .field("pool_buffers", &self.pool.total())
            .field("settings", &self.settings)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
