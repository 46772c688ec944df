//! Fixed-capacity buffer pool for tile pixel data.
//!
//! The pool owns a fixed number of buffers, each with the same maximum
//! capacity. Checking out a buffer returns a [`PooledBuffer`] handle that
//! gives exclusive access to the bytes and puts the buffer back when dropped,
//! so every exit path of the holder (success, `?` early return, panic unwind,
//! or a cancelled future) returns it.
//!
//! When every buffer is checked out, [`BufferPool::checkout`] waits until one
//! comes back. The pool never grows beyond its configured count.
//!
//! ```text
//! checkout(len) ──► semaphore permit ──► free list pop (or first-use alloc)
//!                                              │
//!        drop(PooledBuffer) ◄── exclusive use ─┘
//!              │
//!              └──► free list push ──► permit released
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::PoolError;

/// Default number of pooled buffers.
pub const DEFAULT_POOL_BUFFERS: usize = 16;

struct PoolInner {
    /// Buffers not currently checked out
    free: Mutex<Vec<Vec<u8>>>,

    /// One permit per buffer; bounds concurrent checkouts
    permits: Arc<Semaphore>,

    /// Byte capacity of every buffer
    buffer_capacity: usize,

    /// Total number of buffers this pool may hold
    total: usize,
}

impl PoolInner {
    fn give_back(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(buf);
    }
}

/// Pool of reusable fixed-capacity byte buffers.
///
/// Cloning the pool is cheap and shares the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buffer_capacity` bytes each.
    ///
    /// Buffers are allocated on first checkout and reused afterwards.
    pub fn new(count: usize, buffer_capacity: usize) -> Self {
        let count = count.max(1);
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(count)),
                permits: Arc::new(Semaphore::new(count)),
                buffer_capacity,
                total: count,
            }),
        }
    }

    /// Check out a buffer holding `len` bytes, waiting if none is free.
    pub async fn checkout(&self, len: usize) -> Result<PooledBuffer, PoolError> {
        self.check_len(len)?;
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(self.take(permit, len))
    }

    /// Check out a buffer without waiting.
    ///
    /// Returns `Ok(None)` when every buffer is in use.
    pub fn try_checkout(&self, len: usize) -> Result<Option<PooledBuffer>, PoolError> {
        self.check_len(len)?;
        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => Ok(Some(self.take(permit, len))),
            Err(tokio::sync::TryAcquireError::NoPermits) => Ok(None),
            Err(tokio::sync::TryAcquireError::Closed) => Err(PoolError::Closed),
        }
    }

    fn check_len(&self, len: usize) -> Result<(), PoolError> {
        if len > self.inner.buffer_capacity {
            return Err(PoolError::TooLarge {
                requested: len,
                capacity: self.inner.buffer_capacity,
            });
        }
        Ok(())
    }

    fn take(&self, permit: OwnedSemaphorePermit, len: usize) -> PooledBuffer {
        let reused = {
            let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };
        let buf = reused.unwrap_or_else(|| vec![0u8; self.inner.buffer_capacity]);

        PooledBuffer {
            buf: Some(buf),
            len,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Byte capacity of each buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    /// Total number of buffers.
    pub fn total(&self) -> usize {
        self.inner.total
    }

    /// Number of buffers that can be checked out right now.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Number of buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.total - self.available()
    }
}

/// Exclusive handle to a pooled buffer.
///
/// Dereferences to the first `len` bytes of the underlying buffer. The
/// buffer goes back to its pool when the handle is dropped.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    len: usize,
    pool: Arc<PoolInner>,
    // Declared last so the buffer is back on the free list before the
    // permit is released.
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    /// Length of the usable region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the usable region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Full capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(Vec::len).unwrap_or(0)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => &mut buf[..self.len],
            None => &mut [],
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
