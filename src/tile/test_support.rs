//! Fixtures shared by the pipeline and batch tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::compute::{rgba_len, ColorMatrix, ComputeBackend, CpuBackend, DeviceBuffer};
use crate::error::{ArchiveError, ComputeError};
use crate::pool::BufferPool;
use crate::slide::SlideArchive;

use super::{TileCache, TileIdentity, TilePipeline};

/// Red channel value that makes [`PoisonBackend`] fail.
pub const POISON: u8 = 0xEE;

/// Archive whose every pixel is `[(tile_x * 10 + focus_layer) % 200, 0, 0, 255]`,
/// or [`POISON`] red for tiles with `tile_x == poison_x`.
///
/// The modulus keeps pattern pixels below [`POISON`] for any coordinate.
pub struct PatternArchive {
    pub reads: AtomicUsize,
    pub poison_x: Option<u32>,
    pub missing_x: Option<u32>,
}

impl PatternArchive {
    pub fn new() -> Self {
        Self {
            reads: AtomicUsize::new(0),
            poison_x: None,
            missing_x: None,
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SlideArchive for PatternArchive {
    async fn read_tile(
        &self,
        identity: &TileIdentity,
        width: u32,
        height: u32,
    ) -> Result<Bytes, ArchiveError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if Some(identity.tile_x) == self.missing_x {
            return Err(ArchiveError::NotFound(identity.cache_key()));
        }
        let red = if Some(identity.tile_x) == self.poison_x {
            POISON
        } else {
            ((identity.tile_x * 10 + identity.focus_layer) % 200) as u8
        };
        let pixels: Vec<u8> = [red, 0, 0, 255]
            .iter()
            .copied()
            .cycle()
            .take(rgba_len(width, height))
            .collect();
        Ok(Bytes::from(pixels))
    }
}

/// CPU backend whose `color_correct` fails on inputs starting with a
/// [`POISON`] pixel.
pub struct PoisonBackend {
    inner: CpuBackend,
}

impl PoisonBackend {
    pub fn new() -> Self {
        Self {
            inner: CpuBackend::new(),
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated_bytes()
    }
}

impl ComputeBackend for PoisonBackend {
    fn name(&self) -> &'static str {
        "poison"
    }

    fn alloc(&self, len: usize) -> Result<DeviceBuffer, ComputeError> {
        self.inner.alloc(len)
    }

    fn free(&self, buffer: DeviceBuffer) {
        self.inner.free(buffer)
    }

    fn upload(&self, dst: &DeviceBuffer, src: &[u8]) -> Result<(), ComputeError> {
        self.inner.upload(dst, src)
    }

    fn download(&self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), ComputeError> {
        self.inner.download(src, dst)
    }

    fn color_correct(
        &self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        width: u32,
        height: u32,
        matrix: Option<&ColorMatrix>,
    ) -> Result<(), ComputeError> {
        let mut pixels = vec![0u8; input.len()];
        self.inner.download(input, &mut pixels)?;
        if pixels.first() == Some(&POISON) {
            return Err(ComputeError::Kernel {
                kernel: "color_correct",
                message: "poisoned input".to_string(),
            });
        }
        self.inner.color_correct(input, output, width, height, matrix)
    }

    fn focus_stack(
        &self,
        layers: &[DeviceBuffer],
        weights: &[f32],
        output: &DeviceBuffer,
        width: u32,
        height: u32,
    ) -> Result<(), ComputeError> {
        self.inner.focus_stack(layers, weights, output, width, height)
    }

    fn sharpen(
        &self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        width: u32,
        height: u32,
        amount: f32,
    ) -> Result<(), ComputeError> {
        self.inner.sharpen(input, output, width, height, amount)
    }
}

/// Pipeline over `archive` with small tiles in mind: 4 buffers of 64×64 RGBA.
pub fn pipeline<A: SlideArchive>(
    archive: A,
    backend: Arc<dyn ComputeBackend>,
) -> TilePipeline<A> {
    TilePipeline::new(
        archive,
        TileCache::with_capacity(1024 * 1024),
        BufferPool::new(4, rgba_len(64, 64)),
        backend,
    )
}
