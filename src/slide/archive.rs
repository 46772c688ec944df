//! Slide archive trait and the filesystem implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::compute::rgba_len;
use crate::error::ArchiveError;
use crate::tile::TileIdentity;

// =============================================================================
// SlideArchive Trait
// =============================================================================

/// Source of raw RGBA pixels for a tile.
///
/// This abstraction lets the tile pipeline read from disk, from freshly
/// captured scans, or from a test fixture without knowing which.
#[async_trait]
pub trait SlideArchive: Send + Sync {
    /// Read the raw pixels for one tile of one focus layer.
    ///
    /// The returned buffer holds exactly `width × height × 4` bytes of
    /// row-major RGBA.
    ///
    /// # Errors
    ///
    /// `NotFound` when the slide or tile is absent, `Corrupt` when stored
    /// data has the wrong size, `Io` for storage failures.
    async fn read_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<Bytes, ArchiveError>;

    /// Whether [`read_tile`](Self::read_tile) would find the tile.
    ///
    /// The default reads the tile. Archives that can answer from metadata
    /// override it.
    async fn has_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<bool, ArchiveError> {
        match self.read_tile(identity, width, height).await {
            Ok(_) => Ok(true),
            Err(ArchiveError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<T: SlideArchive + ?Sized> SlideArchive for Arc<T> {
    async fn read_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<Bytes, ArchiveError> {
        (**self).read_tile(identity, width, height).await
    }

    async fn has_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<bool, ArchiveError> {
        (**self).has_tile(identity, width, height).await
    }
}

// =============================================================================
// Filesystem Archive
// =============================================================================

/// Archive of pre-cut raw tiles on local disk.
///
/// Layout: `{base}/{slide_id}/{focus_layer}/{zoom}/{tile_x}_{tile_y}.raw`,
/// each file holding `width × height × 4` RGBA bytes.
#[derive(Debug, Clone)]
pub struct FsSlideArchive {
    base: PathBuf,
}

impl FsSlideArchive {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    /// Path of the file holding `identity`, or `None` if the slide id would
    /// escape the base directory.
    pub fn tile_path(&self, identity: &TileIdentity) -> Option<PathBuf> {
        let slide = identity.slide_id.as_ref();
        if !is_safe_component(slide) {
            return None;
        }
        Some(
            self.base
                .join(slide)
                .join(identity.focus_layer.to_string())
                .join(identity.zoom.to_string())
                .join(format!("{}_{}.raw", identity.tile_x, identity.tile_y)),
        )
    }
}

fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[async_trait]
impl SlideArchive for FsSlideArchive {
    async fn read_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<Bytes, ArchiveError> {
        let key = identity.cache_key();
        let path = self
            .tile_path(identity)
            .ok_or_else(|| ArchiveError::NotFound(key.clone()))?;

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Raw tile not on disk");
                return Err(ArchiveError::NotFound(key));
            }
            Err(e) => return Err(ArchiveError::Io(format!("{}: {}", path.display(), e))),
        };

        let expected = rgba_len(width, height);
        if data.len() != expected {
            return Err(ArchiveError::Corrupt {
                key,
                message: format!(
                    "file is {} bytes, {}x{} RGBA needs {}",
                    data.len(),
                    width,
                    height,
                    expected
                ),
            });
        }
        Ok(Bytes::from(data))
    }

    /// Checks the file without reading it. Size is checked on read.
    async fn has_tile(
        &self,
        identity: &TileIdentity,
        _width: u32,
        _height: u32,
    ) -> Result<bool, ArchiveError> {
        let Some(path) = self.tile_path(identity) else {
            return Ok(false);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ArchiveError::Io(format!("{}: {}", path.display(), e))),
        }
    }
}

// =============================================================================
// Chained Archive
// =============================================================================

/// Consults `primary` first and falls back to `fallback` on `NotFound`.
#[derive(Debug, Clone)]
pub struct ChainedArchive<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> ChainedArchive<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn fallback(&self) -> &F {
        &self.fallback
    }
}

#[async_trait]
impl<P: SlideArchive, F: SlideArchive> SlideArchive for ChainedArchive<P, F> {
    async fn read_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<Bytes, ArchiveError> {
        match self.primary.read_tile(identity, width, height).await {
            Err(ArchiveError::NotFound(_)) => {
                self.fallback.read_tile(identity, width, height).await
            }
            other => other,
        }
    }

    async fn has_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<bool, ArchiveError> {
        if self.primary.has_tile(identity, width, height).await? {
            return Ok(true);
        }
        self.fallback.has_tile(identity, width, height).await
    }
}

// =============================================================================
// Tests
// =============================================================================
