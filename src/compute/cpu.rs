//! Portable CPU implementation of [`ComputeBackend`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::ComputeError;

use super::{rgba_len, ColorMatrix, ComputeBackend, DeviceBuffer, BYTES_PER_PIXEL};

/// Default simulated device memory: 2GB.
pub const DEFAULT_DEVICE_MEMORY: usize = 2 * 1024 * 1024 * 1024;

#[derive(Default)]
struct Slab {
    buffers: HashMap<u64, Vec<u8>>,
    allocated: usize,
}

/// CPU backend. Device memory is a host-side slab with a byte limit so
/// allocation failures behave like they would on a real accelerator.
pub struct CpuBackend {
    slab: Mutex<Slab>,
    next_id: AtomicU64,
    memory_limit: usize,
}

impl CpuBackend {
    /// Create a backend with [`DEFAULT_DEVICE_MEMORY`] of device memory.
    pub fn new() -> Self {
        Self::with_memory_limit(DEFAULT_DEVICE_MEMORY)
    }

    /// Create a backend that refuses allocations beyond `memory_limit` bytes.
    pub fn with_memory_limit(memory_limit: usize) -> Self {
        Self {
            slab: Mutex::new(Slab::default()),
            next_id: AtomicU64::new(1),
            memory_limit,
        }
    }

    /// Bytes of device memory currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.lock().allocated
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slab> {
        self.slab.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take `ids` out of the slab. On a missing id everything taken so far
    /// goes back and nothing is checked out.
    fn checkout(&self, ids: &[u64]) -> Result<Checkout<'_>, ComputeError> {
        let mut slab = self.lock();
        let mut taken: Vec<(u64, Vec<u8>)> = Vec::with_capacity(ids.len());
        for &id in ids {
            if taken.iter().any(|(held, _)| *held == id) {
                continue;
            }
            match slab.buffers.remove(&id) {
                Some(data) => taken.push((id, data)),
                None => {
                    slab.buffers.extend(taken);
                    return Err(ComputeError::InvalidBuffer(id));
                }
            }
        }
        Ok(Checkout {
            backend: self,
            taken,
        })
    }

    /// Run `kernel` over `inputs` into `output` with the slab unlocked, so
    /// kernels on other buffers proceed in parallel.
    fn run_unlocked<F>(
        &self,
        inputs: &[&DeviceBuffer],
        output: &DeviceBuffer,
        kernel: F,
    ) -> Result<(), ComputeError>
    where
        F: FnOnce(&[&[u8]], &mut [u8]) -> Result<(), ComputeError>,
    {
        let mut ids = Vec::with_capacity(inputs.len() + 1);
        ids.push(output.id());
        ids.extend(inputs.iter().map(|input| input.id()));

        let mut checkout = self.checkout(&ids)?;
        let Some(((_, dst), rest)) = checkout.taken.split_first_mut() else {
            return Err(ComputeError::InvalidBuffer(output.id()));
        };
        let srcs = inputs
            .iter()
            .map(|input| {
                rest.iter()
                    .find(|(id, _)| *id == input.id())
                    .map(|(_, data)| data.as_slice())
                    .ok_or(ComputeError::InvalidBuffer(input.id()))
            })
            .collect::<Result<Vec<&[u8]>, _>>()?;
        kernel(srcs.as_slice(), dst.as_mut_slice())
    }
}

/// Buffers held outside the slab while a kernel runs. They go back on drop,
/// including when the kernel panics.
struct Checkout<'a> {
    backend: &'a CpuBackend,
    taken: Vec<(u64, Vec<u8>)>,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if self.taken.is_empty() {
            return;
        }
        let mut slab = self.backend.lock();
        slab.buffers.extend(self.taken.drain(..));
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn check_extent(
    kernel: &'static str,
    buffer: &[u8],
    width: u32,
    height: u32,
) -> Result<usize, ComputeError> {
    let needed = rgba_len(width, height);
    if buffer.len() < needed {
        return Err(ComputeError::Kernel {
            kernel,
            message: format!(
                "buffer of {} bytes is smaller than {}x{} RGBA ({} bytes)",
                buffer.len(),
                width,
                height,
                needed
            ),
        });
    }
    Ok(needed)
}

fn distinct(
    kernel: &'static str,
    input: &DeviceBuffer,
    output: &DeviceBuffer,
) -> Result<(), ComputeError> {
    if input.id() == output.id() {
        return Err(ComputeError::Kernel {
            kernel,
            message: "input and output must be different buffers".to_string(),
        });
    }
    Ok(())
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn alloc(&self, len: usize) -> Result<DeviceBuffer, ComputeError> {
        let mut slab = self.lock();
        if slab.allocated + len > self.memory_limit {
            return Err(ComputeError::Allocation {
                len,
                message: format!(
                    "out of device memory ({} of {} bytes in use)",
                    slab.allocated, self.memory_limit
                ),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slab.buffers.insert(id, vec![0u8; len]);
        slab.allocated += len;
        Ok(DeviceBuffer::new(id, len))
    }

    fn free(&self, buffer: DeviceBuffer) {
        let mut slab = self.lock();
        if let Some(data) = slab.buffers.remove(&buffer.id()) {
            slab.allocated = slab.allocated.saturating_sub(data.len());
        }
    }

    fn upload(&self, dst: &DeviceBuffer, src: &[u8]) -> Result<(), ComputeError> {
        let mut slab = self.lock();
        let data = slab
            .buffers
            .get_mut(&dst.id())
            .ok_or(ComputeError::InvalidBuffer(dst.id()))?;
        if data.len() != src.len() {
            return Err(ComputeError::CopySize {
                device: data.len(),
                host: src.len(),
            });
        }
        data.copy_from_slice(src);
        Ok(())
    }

    fn download(&self, src: &DeviceBuffer, dst: &mut [u8]) -> Result<(), ComputeError> {
        let slab = self.lock();
        let data = slab
            .buffers
            .get(&src.id())
            .ok_or(ComputeError::InvalidBuffer(src.id()))?;
        if data.len() != dst.len() {
            return Err(ComputeError::CopySize {
                device: data.len(),
                host: dst.len(),
            });
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    fn color_correct(
        &self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        width: u32,
        height: u32,
        matrix: Option<&ColorMatrix>,
    ) -> Result<(), ComputeError> {
        distinct("color_correct", input, output)?;
        self.run_unlocked(&[input], output, |srcs, dst| {
            color_correct_rgba(srcs[0], dst, width, height, matrix)
        })
    }

    fn focus_stack(
        &self,
        layers: &[DeviceBuffer],
        weights: &[f32],
        output: &DeviceBuffer,
        width: u32,
        height: u32,
    ) -> Result<(), ComputeError> {
        if layers.is_empty() || layers.len() != weights.len() {
            return Err(ComputeError::Kernel {
                kernel: "focus_stack",
                message: format!(
                    "{} layers with {} weights",
                    layers.len(),
                    weights.len()
                ),
            });
        }
        for layer in layers {
            distinct("focus_stack", layer, output)?;
        }

        let inputs: Vec<&DeviceBuffer> = layers.iter().collect();
        self.run_unlocked(&inputs, output, |srcs, dst| {
            focus_stack_rgba(srcs, weights, dst, width, height)
        })
    }

    fn sharpen(
        &self,
        input: &DeviceBuffer,
        output: &DeviceBuffer,
        width: u32,
        height: u32,
        amount: f32,
    ) -> Result<(), ComputeError> {
        distinct("sharpen", input, output)?;
        self.run_unlocked(&[input], output, |srcs, dst| {
            sharpen_rgba(srcs[0], dst, width, height, amount)
        })
    }
}

// =============================================================================
// Kernels
// =============================================================================

#[inline]
fn clamp_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn color_correct_rgba(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    matrix: Option<&ColorMatrix>,
) -> Result<(), ComputeError> {
    let len = check_extent("color_correct", src, width, height)?;
    check_extent("color_correct", dst, width, height)?;

    let Some(matrix) = matrix else {
        dst[..len].copy_from_slice(&src[..len]);
        return Ok(());
    };

    let m = &matrix.0;
    for (out, px) in dst[..len]
        .chunks_exact_mut(BYTES_PER_PIXEL)
        .zip(src[..len].chunks_exact(BYTES_PER_PIXEL))
    {
        let p = [px[0] as f32, px[1] as f32, px[2] as f32, px[3] as f32];
        for (c, row) in m.iter().enumerate() {
            out[c] = clamp_channel(row[0] * p[0] + row[1] * p[1] + row[2] * p[2] + row[3] * p[3]);
        }
    }
    Ok(())
}

fn focus_stack_rgba(
    layers: &[&[u8]],
    weights: &[f32],
    dst: &mut [u8],
    width: u32,
    height: u32,
) -> Result<(), ComputeError> {
    let len = check_extent("focus_stack", dst, width, height)?;
    for layer in layers {
        check_extent("focus_stack", layer, width, height)?;
    }

    for offset in (0..len).step_by(BYTES_PER_PIXEL) {
        let mut acc = [0.0f32; BYTES_PER_PIXEL];
        let mut weight_sum = 0.0f32;
        for (layer, &w) in layers.iter().zip(weights) {
            weight_sum += w;
            for (c, slot) in acc.iter_mut().enumerate() {
                *slot += w * layer[offset + c] as f32;
            }
        }
        if weight_sum == 0.0 {
            continue;
        }
        for (c, value) in acc.iter().enumerate() {
            dst[offset + c] = clamp_channel(value / weight_sum);
        }
    }
    Ok(())
}

fn sharpen_rgba(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    amount: f32,
) -> Result<(), ComputeError> {
    let len = check_extent("sharpen", src, width, height)?;
    check_extent("sharpen", dst, width, height)?;

    // Borders and alpha pass through; interior RGB is overwritten below.
    dst[..len].copy_from_slice(&src[..len]);
    if width < 3 || height < 3 {
        return Ok(());
    }

    let w = width as usize;
    let h = height as usize;
    let stride = w * BYTES_PER_PIXEL;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = y * stride + x * BYTES_PER_PIXEL;
            for c in 0..3 {
                let mut sum = 0u32;
                for dy in 0..3 {
                    let row = (y + dy - 1) * stride;
                    for dx in 0..3 {
                        sum += src[row + (x + dx - 1) * BYTES_PER_PIXEL + c] as u32;
                    }
                }
                let blur = sum as f32 / 9.0;
                let value = src[center + c] as f32;
                dst[center + c] = clamp_channel(value + amount * (value - blur));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
