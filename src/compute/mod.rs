//! Compute offload for tile pixel correction.
//!
//! The pipeline talks to compute hardware only through the
//! [`ComputeBackend`] trait: allocate device memory, copy host bytes in, run
//! kernels, copy results out. Every call blocks the invoking thread until the
//! device work has finished, so callers run it on a blocking thread
//! (`tokio::task::spawn_blocking`) rather than on the async executor.
//!
//! # Kernels
//!
//! | Kernel          | Contract                                                     |
//! |-----------------|--------------------------------------------------------------|
//! | `color_correct` | RGBA × 4×4 matrix, clamped to 0..=255; copy when no matrix    |
//! | `focus_stack`   | per-pixel weighted mean of N layers; zero weight sum = no-op  |
//! | `sharpen`       | 3×3 unsharp mask on interior pixels; borders and alpha copied |
//!
//! # Backends
//!
//! - [`CpuBackend`]: portable implementation; "device memory" is a host-side
//!   slab addressed by handle. Used when no accelerator is configured and in tests.

mod cpu;

pub use cpu::{CpuBackend, DEFAULT_DEVICE_MEMORY};

use crate::error::ComputeError;

/// Bytes per RGBA pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// Handle to a buffer in device memory.
///
/// Handles are plain identifiers: copying one does not copy device memory.
/// Using a handle after [`ComputeBackend::free`] yields
/// [`ComputeError::InvalidBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    id: u64,
    len: usize,
}

impl DeviceBuffer {
    /// Create a handle. Only backends mint handles.
    pub fn new(id: u64, len: usize) -> Self {
        Self { id, len }
    }

    /// Backend-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Row-major 4×4 matrix applied to RGBA pixels.
///
/// Row `c` produces output channel `c`: `out[c] = Σ_j m[c][j] * in[j]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMatrix(pub [[f32; 4]; 4]);

impl ColorMatrix {
    /// Identity transform.
    pub const fn identity() -> Self {
        Self([
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Default stain balance for the capture device's sensor.
    ///
    /// Slight per-channel gain on R, G and B; alpha untouched.
    pub const fn scanner_default() -> Self {
        Self([
            [1.05, 0.0, 0.0, 0.0],
            [0.0, 1.02, 0.0, 0.0],
            [0.0, 0.0, 1.08, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// Build from 16 row-major values.
    pub fn from_row_major(values: &[f32]) -> Option<Self> {
        if values.len() != 16 {
            return None;
        }
        let mut m = [[0.0f32; 4]; 4];
        for (i, v) in values.iter().enumerate() {
            m[i / 4][i % 4] = *v;
        }
        Some(Self(m))
    }
}

impl Default for ColorMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

/// Compute capability used by the tile pipeline.
///
/// Implementations must be safe to call from several blocking threads at
/// once. They may queue work internally, but each method returns only once
/// the work it submitted is complete.
pub trait ComputeBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Allocate `len` zero-filled bytes of device memory.
    fn alloc(&self, len: usize) -> Result<DeviceBuffer, ComputeError>;

    /// Release device memory. Freeing an unknown handle is a no-op.
    fn free(&self, buffer: DeviceBuffer);

    /// Copy `src` into the device buffer. Lengths must match.
    fn upload(&self, dst: &DeviceBuffer, src: &[u8]) -> Result<(), ComputeError>;

    /// Copy the device buffer into `dst`. Lengths must match.
    fn download(&self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), ComputeError>;

    /// Apply `matrix` to every RGBA pixel, or copy when `matrix` is `None`.
    fn color_correct(
        &self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        width: u32,
        height: u32,
        matrix: Option<&ColorMatrix>,
    ) -> Result<(), ComputeError>;

    /// Weighted per-pixel mean across `layers`.
    ///
    /// `weights` is parallel to `layers`. Pixels whose weight sum is zero
    /// keep whatever `output` held before the call.
    fn focus_stack(
        &self,
        layers: &[DeviceBuffer],
        weights: &[f32],
        output: &DeviceBuffer,
        width: u32,
        height: u32,
    ) -> Result<(), ComputeError>;

    /// 3×3 unsharp mask with strength `amount`.
    fn sharpen(
        &self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        width: u32,
        height: u32,
        amount: f32,
    ) -> Result<(), ComputeError>;
}

/// Device allocations freed together when the scope ends.
///
/// Lets pipeline code use `?` freely between `alloc` and the final
/// download without leaking device memory on the error path.
pub struct DeviceScope<'a> {
    backend: &'a dyn ComputeBackend,
    buffers: Vec<DeviceBuffer>,
}

impl<'a> DeviceScope<'a> {
    pub fn new(backend: &'a dyn ComputeBackend) -> Self {
        Self {
            backend,
            buffers: Vec::new(),
        }
    }

    /// Allocate a zero-filled buffer owned by this scope.
    pub fn alloc(&mut self, len: usize) -> Result<DeviceBuffer, ComputeError> {
        let buffer = self.backend.alloc(len)?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    /// Allocate and fill a buffer with `data`.
    pub fn upload(&mut self, data: &[u8]) -> Result<DeviceBuffer, ComputeError> {
        let buffer = self.alloc(data.len())?;
        self.backend.upload(&buffer, data)?;
        Ok(buffer)
    }

    pub fn backend(&self) -> &'a dyn ComputeBackend {
        self.backend
    }
}

impl Drop for DeviceScope<'_> {
    fn drop(&mut self) {
        for buffer in self.buffers.drain(..) {
            self.backend.free(buffer);
        }
    }
}

/// Byte length of a `width × height` RGBA image.
pub fn rgba_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}
