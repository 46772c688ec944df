//! Tile encoder.
//!
//! Turns corrected RGBA pixels into the bytes sent to the viewer.
//!
//! # Formats
//!
//! - **JPEG**: alpha is dropped; quality 1-100 controls the quantizer.
//! - **WebP**: lossless encoding of the full RGBA buffer. Quality is accepted
//!   but has no effect.
//! - **AVIF**: not encoded natively; falls back to WebP and reports
//!   `image/webp` as the content type.

use std::fmt;
use std::str::FromStr;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::ExtendedColorType;

use crate::compute::{rgba_len, BYTES_PER_PIXEL};
use crate::error::TileError;

/// Default encoder quality (1-100).
pub const DEFAULT_QUALITY: u8 = 85;

/// Minimum allowed quality.
pub const MIN_QUALITY: u8 = 1;

/// Maximum allowed quality.
pub const MAX_QUALITY: u8 = 100;

// =============================================================================
// Tile Format
// =============================================================================

/// Output image format requested by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TileFormat {
    Jpeg,
    #[default]
    Webp,
    Avif,
}

impl TileFormat {
    /// Lowercase name used in query strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            TileFormat::Jpeg => "jpeg",
            TileFormat::Webp => "webp",
            TileFormat::Avif => "avif",
        }
    }

    /// MIME type of the bytes actually produced for this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Jpeg => "image/jpeg",
            // AVIF is served as WebP
            TileFormat::Webp | TileFormat::Avif => "image/webp",
        }
    }

    /// Parse an optional query value; absent or empty means unset.
    pub fn parse_optional(name: Option<&str>) -> Result<Option<Self>, TileError> {
        match name {
            None | Some("") => Ok(None),
            Some(name) => name.parse().map(Some),
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TileFormat {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(TileFormat::Jpeg),
            "webp" => Ok(TileFormat::Webp),
            "avif" => Ok(TileFormat::Avif),
            _ => Err(TileError::InvalidFormat {
                format: s.to_string(),
            }),
        }
    }
}

// =============================================================================
// Tile Encoder
// =============================================================================

/// Encodes RGBA tiles into the requested output format.
#[derive(Debug, Clone, Default)]
pub struct TileEncoder {}

impl TileEncoder {
    pub fn new() -> Self {
        Self {}
    }

    /// Encode `width × height` RGBA pixels.
    ///
    /// # Errors
    ///
    /// Returns `EncodeError` if `rgba` does not hold exactly `width × height`
    /// pixels or the codec fails.
    pub fn encode(
        &self,
        rgba: &[u8],
        width: u32,
        height: u32,
        format: TileFormat,
        quality: u8,
    ) -> Result<Vec<u8>, TileError> {
        let expected = rgba_len(width, height);
        if rgba.len() != expected {
            return Err(TileError::EncodeError {
                message: format!(
                    "pixel buffer is {} bytes, {}x{} RGBA needs {}",
                    rgba.len(),
                    width,
                    height,
                    expected
                ),
            });
        }

        match format {
            TileFormat::Jpeg => encode_jpeg(rgba, width, height, clamp_quality(quality)),
            TileFormat::Webp | TileFormat::Avif => encode_webp(rgba, width, height),
        }
    }
}

fn encode_jpeg(rgba: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, TileError> {
    let rgb: Vec<u8> = rgba
        .chunks_exact(BYTES_PER_PIXEL)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();

    let mut output = Vec::new();
    JpegEncoder::new_with_quality(&mut output, quality)
        .encode(&rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| TileError::EncodeError {
            message: e.to_string(),
        })?;
    Ok(output)
}

fn encode_webp(rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>, TileError> {
    let mut output = Vec::new();
    WebPEncoder::new_lossless(&mut output)
        .encode(rgba, width, height, ExtendedColorType::Rgba8)
        .map_err(|e| TileError::EncodeError {
            message: e.to_string(),
        })?;
    Ok(output)
}

/// Clamp quality to 1-100.
#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_QUALITY, MAX_QUALITY)
}

// =============================================================================
// Tests
// =============================================================================
