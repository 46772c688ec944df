//! Tile identity, request, and result types.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::TileError;

use super::encoder::{TileFormat, DEFAULT_QUALITY, MAX_QUALITY};

/// Number of focus layers a slide can carry.
pub const FOCUS_LAYER_COUNT: u32 = 40;

/// Highest valid focus layer index.
pub const MAX_FOCUS_LAYER: u32 = FOCUS_LAYER_COUNT - 1;

/// Conventional output tile edge in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 512;

// =============================================================================
// Tile Identity
// =============================================================================

/// Address of one tile of one focus layer of a slide.
///
/// Serializes to `"{slide_id}:{focus_layer}:{tile_x}:{tile_y}:{zoom}"`.
/// The four numeric fields never contain `:`, so the key can be split from
/// the right and the mapping is injective even when the slide id contains
/// colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileIdentity {
    /// Slide identifier
    pub slide_id: Arc<str>,

    /// Focus layer (0-39)
    pub focus_layer: u32,

    /// Tile X coordinate (0-indexed from left)
    pub tile_x: u32,

    /// Tile Y coordinate (0-indexed from top)
    pub tile_y: u32,

    /// Zoom level
    pub zoom: u32,
}

impl TileIdentity {
    pub fn new(
        slide_id: impl Into<Arc<str>>,
        focus_layer: u32,
        tile_x: u32,
        tile_y: u32,
        zoom: u32,
    ) -> Self {
        Self {
            slide_id: slide_id.into(),
            focus_layer,
            tile_x,
            tile_y,
            zoom,
        }
    }

    /// Stable string key used by the tile cache.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }

    /// Inverse of [`cache_key`](Self::cache_key).
    pub fn parse_cache_key(key: &str) -> Option<Self> {
        let mut parts = key.rsplitn(5, ':');
        let zoom = parts.next()?.parse().ok()?;
        let tile_y = parts.next()?.parse().ok()?;
        let tile_x = parts.next()?.parse().ok()?;
        let focus_layer = parts.next()?.parse().ok()?;
        let slide_id = parts.next()?;
        Some(Self::new(slide_id, focus_layer, tile_x, tile_y, zoom))
    }

    /// Same tile position on a different focus layer.
    pub fn with_layer(&self, focus_layer: u32) -> Self {
        Self {
            focus_layer,
            ..self.clone()
        }
    }
}

impl fmt::Display for TileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.slide_id, self.focus_layer, self.tile_x, self.tile_y, self.zoom
        )
    }
}

// =============================================================================
// Focus Composite
// =============================================================================

/// Blend of several focus layers at the same tile position.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusComposite {
    /// Focus layers to blend, in order
    pub layers: Vec<u32>,

    /// One weight per layer
    pub weights: Vec<f32>,
}

impl FocusComposite {
    pub fn new(layers: Vec<u32>, weights: Vec<f32>) -> Self {
        Self { layers, weights }
    }

    /// Equal weights across `layers`.
    pub fn uniform(layers: Vec<u32>) -> Self {
        let weights = vec![1.0; layers.len()];
        Self { layers, weights }
    }

    /// Parse `"2,3,4"` (equal weights) or `"2@0.25,3@0.5,4@0.25"`.
    pub fn parse(spec: &str) -> Result<Self, TileError> {
        let mut layers = Vec::new();
        let mut weights = Vec::new();
        for item in spec.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (layer, weight) = match item.split_once('@') {
                Some((layer, weight)) => (layer, weight.trim().parse::<f32>().ok()),
                None => (item, Some(1.0)),
            };
            let layer = layer.trim().parse::<u32>().ok();
            match (layer, weight) {
                (Some(layer), Some(weight)) => {
                    layers.push(layer);
                    weights.push(weight);
                }
                _ => {
                    return Err(TileError::InvalidComposite(format!(
                        "cannot parse '{}'",
                        item
                    )))
                }
            }
        }
        let composite = Self { layers, weights };
        composite.validate()?;
        Ok(composite)
    }

    fn validate(&self) -> Result<(), TileError> {
        if self.layers.is_empty() {
            return Err(TileError::InvalidComposite("no layers".to_string()));
        }
        if self.layers.len() != self.weights.len() {
            return Err(TileError::InvalidComposite(format!(
                "{} layers but {} weights",
                self.layers.len(),
                self.weights.len()
            )));
        }
        if let Some(&layer) = self.layers.iter().find(|&&l| l > MAX_FOCUS_LAYER) {
            return Err(TileError::InvalidLayer {
                layer,
                max: MAX_FOCUS_LAYER,
            });
        }
        if self.weights.iter().any(|w| !w.is_finite()) {
            return Err(TileError::InvalidComposite(
                "weights must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn key_suffix(&self) -> String {
        let parts: Vec<String> = self
            .layers
            .iter()
            .zip(&self.weights)
            .map(|(l, w)| format!("{}@{}", l, w))
            .collect();
        format!("|stack:{}", parts.join(","))
    }
}

// =============================================================================
// Tile Request
// =============================================================================

/// A request for one encoded tile.
#[derive(Debug, Clone)]
pub struct TileRequest {
    /// Which tile
    pub identity: TileIdentity,

    /// Output width in pixels
    pub width: u32,

    /// Output height in pixels
    pub height: u32,

    /// Output format; `None` means unset
    pub format: Option<TileFormat>,

    /// Encoder quality 1-100; 0 means unset
    pub quality: u32,

    /// Blend several focus layers instead of serving `identity.focus_layer`
    pub composite: Option<FocusComposite>,
}

impl TileRequest {
    /// Create a 512×512 request with format and quality unset.
    pub fn new(identity: TileIdentity) -> Self {
        Self {
            identity,
            width: DEFAULT_TILE_SIZE,
            height: DEFAULT_TILE_SIZE,
            format: None,
            quality: 0,
            composite: None,
        }
    }

    pub fn with_format(mut self, format: TileFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_quality(mut self, quality: u32) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_composite(mut self, composite: FocusComposite) -> Self {
        self.composite = Some(composite);
        self
    }

    /// Fill unset fields: format WebP, quality 85.
    pub fn with_defaults(mut self) -> Self {
        if self.format.is_none() {
            self.format = Some(TileFormat::default());
        }
        if self.quality == 0 {
            self.quality = DEFAULT_QUALITY as u32;
        }
        self
    }

    /// Output format, defaulting when unset.
    pub fn resolved_format(&self) -> TileFormat {
        self.format.unwrap_or_default()
    }

    /// Quality, defaulting when unset.
    pub fn resolved_quality(&self) -> u8 {
        if self.quality == 0 {
            DEFAULT_QUALITY
        } else {
            self.quality.min(MAX_QUALITY as u32) as u8
        }
    }

    /// Reject out-of-range fields before any pipeline work starts.
    ///
    /// `max_tile_bytes` is the pooled buffer capacity.
    pub fn validate(&self, max_tile_bytes: usize) -> Result<(), TileError> {
        if self.identity.focus_layer > MAX_FOCUS_LAYER {
            return Err(TileError::InvalidLayer {
                layer: self.identity.focus_layer,
                max: MAX_FOCUS_LAYER,
            });
        }
        if self.quality > MAX_QUALITY as u32 {
            return Err(TileError::InvalidQuality {
                quality: self.quality,
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(TileError::InvalidSize {
                width: self.width,
                height: self.height,
                reason: "dimensions must be non-zero".to_string(),
            });
        }
        let needed = crate::compute::rgba_len(self.width, self.height);
        if needed > max_tile_bytes {
            return Err(TileError::InvalidSize {
                width: self.width,
                height: self.height,
                reason: format!(
                    "needs {} bytes, buffer capacity is {}",
                    needed, max_tile_bytes
                ),
            });
        }
        if let Some(ref composite) = self.composite {
            composite.validate()?;
        }
        Ok(())
    }

    /// Cache key: the identity key, plus the blend description for composites.
    pub fn cache_key(&self) -> String {
        match &self.composite {
            None => self.identity.cache_key(),
            Some(composite) => format!("{}{}", self.identity.cache_key(), composite.key_suffix()),
        }
    }
}

// =============================================================================
// Tile Result
// =============================================================================

/// An encoded tile.
///
/// Cloning deep-copies the encoded bytes, so a clone never shares storage
/// with its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileResult {
    /// Encoded image bytes
    #[serde(skip)]
    pub encoded_bytes: Vec<u8>,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// MIME type of `encoded_bytes`
    pub content_type: &'static str,

    /// Key this tile is cached under
    pub cache_key: String,
}

impl TileResult {
    /// Size of the encoded bytes.
    pub fn size_bytes(&self) -> usize {
        self.encoded_bytes.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
