//! Byte-budgeted LRU cache for encoded tiles.
//!
//! # Cache Key
//!
//! Tiles are cached under the string key produced by
//! [`TileRequest::cache_key`](super::TileRequest::cache_key):
//! `"{slide_id}:{focus_layer}:{tile_x}:{tile_y}:{zoom}"`, with a `|stack:`
//! suffix for focus composites.
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total encoded size of resident tiles and evicts
//! least-recently-used entries until a new entry fits. There is no age-based
//! expiry.
//!
//! An entry larger than the whole capacity is still inserted, after every
//! other entry has been evicted. Resident bytes therefore stay within capacity
//! for all entries no larger than the capacity.
//!
//! # Copies
//!
//! [`TileCache::get`] returns a deep copy of the stored [`TileResult`].
//! Callers may mutate what they get back without affecting the cache.

use std::time::Instant;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;

use super::TileResult;

/// Default cache capacity: 8 GiB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 8192 * 1024 * 1024;

struct CacheEntry {
    result: TileResult,
    size_bytes: usize,
    last_access: Instant,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    resident_bytes: usize,
    hits: u64,
    misses: u64,
}

impl CacheState {
    /// Drop the least-recently-used entry. Returns `false` when empty.
    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((key, old)) => {
                self.resident_bytes -= old.size_bytes;
                tracing::trace!(
                    cache_key = %key,
                    size_bytes = old.size_bytes,
                    idle_ms = old.last_access.elapsed().as_millis() as u64,
                    "Evicted tile"
                );
                true
            }
            None => false,
        }
    }
}

/// Slide id of a cache key, ignoring any composite suffix.
fn key_slide_id(key: &str) -> Option<&str> {
    let identity = key.split_once("|stack:").map_or(key, |(identity, _)| identity);
    let mut parts = identity.rsplitn(5, ':');
    for _ in 0..4 {
        parts.next()?.parse::<u32>().ok()?;
    }
    parts.next()
}

// =============================================================================
// Cache Stats
// =============================================================================

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub resident_bytes: usize,
    pub entry_count: usize,
    pub capacity_bytes: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

/// LRU cache for encoded tiles with a byte-size capacity.
///
/// # Thread Safety
///
/// All state sits behind one mutex. No operation awaits anything but the
/// lock, so the critical section never spans I/O.
///
/// # Example
///
/// ```
/// use cyto_viewer::tile::{TileCache, TileResult};
///
/// #[tokio::main]
/// async fn main() {
///     let cache = TileCache::with_capacity(1024);
///     let tile = TileResult {
///         encoded_bytes: vec![1, 2, 3],
///         width: 512,
///         height: 512,
///         content_type: "image/webp",
///         cache_key: "slide:0:1:2:0".to_string(),
///     };
///
///     cache.set("slide:0:1:2:0", tile.clone()).await;
///     assert_eq!(cache.get("slide:0:1:2:0").await, Some(tile));
/// }
/// ```
pub struct TileCache {
    state: Mutex<CacheState>,

    /// Maximum total size in bytes
    capacity: usize,
}

impl TileCache {
    /// Create a tile cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a tile cache holding at most `capacity` bytes of encoded tiles.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                resident_bytes: 0,
                hits: 0,
                misses: 0,
            }),
            capacity,
        }
    }

    /// Look up a tile, promoting it to most recently used.
    ///
    /// Counts a hit or a miss. Returns a copy that shares no storage with
    /// the cache.
    pub async fn get(&self, key: &str) -> Option<TileResult> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                state.hits += 1;
                Some(entry.result.clone())
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Check whether a tile is cached without touching LRU order or counters.
    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.entries.contains(key)
    }

    /// Store a tile, evicting least-recently-used entries as needed.
    ///
    /// Replacing an existing key adjusts resident bytes by the size delta and
    /// promotes the entry.
    pub async fn set(&self, key: impl Into<String>, result: TileResult) {
        let key = key.into();
        let size_bytes = result.size_bytes();
        let entry = CacheEntry {
            result,
            size_bytes,
            last_access: Instant::now(),
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if let Some(existing) = state.entries.get_mut(&key) {
            state.resident_bytes = state.resident_bytes - existing.size_bytes + size_bytes;
            *existing = entry;

            // The replaced entry is now MRU, so only others are evicted
            while state.resident_bytes > self.capacity && state.entries.len() > 1 {
                if !state.evict_lru() {
                    break;
                }
            }
            return;
        }

        while state.resident_bytes + size_bytes > self.capacity {
            if !state.evict_lru() {
                break;
            }
        }

        state.entries.put(key, entry);
        state.resident_bytes += size_bytes;
    }

    /// Remove a tile, returning it if it was cached.
    pub async fn remove(&self, key: &str) -> Option<TileResult> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let entry = state.entries.pop(key)?;
        state.resident_bytes -= entry.size_bytes;
        Some(entry.result)
    }

    /// Remove every tile of `slide_id`, focus composites included.
    ///
    /// Returns how many entries were dropped. Counters are left alone.
    pub async fn remove_slide(&self, slide_id: &str) -> usize {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let stale: Vec<String> = state
            .entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| key_slide_id(key).is_some_and(|id| id == slide_id))
            .cloned()
            .collect();
        for key in &stale {
            if let Some(entry) = state.entries.pop(key) {
                state.resident_bytes -= entry.size_bytes;
            }
        }
        stale.len()
    }

    /// Drop every entry and reset all counters.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.resident_bytes = 0;
        state.hits = 0;
        state.misses = 0;
    }

    /// Snapshot of the counters.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            resident_bytes: state.resident_bytes,
            entry_count: state.entries.len(),
            capacity_bytes: self.capacity,
        }
    }

    /// Number of cached tiles.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Whether the cache holds no tiles.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Total encoded size of cached tiles in bytes.
    pub async fn size(&self) -> usize {
        self.state.lock().await.resident_bytes
    }

    /// Maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
