//! Pooled allocator for tile bitmap buffers
//!
//! Device pixel buffers are a scarce resource, so freed buffers are retained
//! per size class and handed back on the next acquire of the same size
//! instead of reallocating. Retention is bounded by a byte budget with LRU
//! eviction of whole size classes.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use log::{debug, info};
use lru::LruCache;

/// Default retention budget for released buffers: 32 MB
const DEFAULT_RETAIN_BUDGET: usize = 32 * 1024 * 1024;

/// Number of distinct size classes kept before the least recent is dropped
const RETAINED_SIZE_CLASSES: usize = 16;

/// Errors raised by the pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("bitmap pool exhausted: requested {requested} bytes, {in_use} of {limit} in use")]
    Exhausted {
        requested: usize,
        in_use: usize,
        limit: usize,
    },
}

/// A pooled pixel buffer, 3 bytes per pixel (RGB).
///
/// Acquired from and released back to a [`BitmapPool`]; ownership is always
/// a whole-value move, never a shared copy.
#[derive(Debug)]
pub struct BitmapRef {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl BitmapRef {
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    #[must_use]
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

fn buffer_bytes(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

struct PoolInner {
    retained: LruCache<(u32, u32), Vec<BitmapRef>>,
    retained_bytes: usize,
    outstanding_bytes: usize,
    limit_bytes: usize,
    retain_budget: usize,
}

/// Shared buffer pool for all pages and tiles.
///
/// `release` is safe to call concurrently from any recycle or eviction path;
/// the lock is held only around bookkeeping, never across pixel work.
pub struct BitmapPool {
    inner: Mutex<PoolInner>,
}

impl BitmapPool {
    /// Pool with no outstanding-byte limit and the default retention budget
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(usize::MAX, DEFAULT_RETAIN_BUDGET)
    }

    /// Pool with a hard cap on outstanding bytes, for constrained embedders
    /// and for exhaustion tests
    #[must_use]
    pub fn with_limits(limit_bytes: usize, retain_budget: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                retained: LruCache::new(
                    NonZeroUsize::new(RETAINED_SIZE_CLASSES).expect("nonzero class count"),
                ),
                retained_bytes: 0,
                outstanding_bytes: 0,
                limit_bytes,
                retain_budget,
            }),
        }
    }

    /// Acquires a buffer of the given pixel dimensions, reusing a retained
    /// one when available. Reused buffers keep their stale pixel content;
    /// callers overwrite the full buffer.
    pub fn acquire(&self, width: u32, height: u32) -> Result<BitmapRef, PoolError> {
        let bytes = buffer_bytes(width, height);
        let mut inner = self.lock();

        if inner.outstanding_bytes.saturating_add(bytes) > inner.limit_bytes {
            return Err(PoolError::Exhausted {
                requested: bytes,
                in_use: inner.outstanding_bytes,
                limit: inner.limit_bytes,
            });
        }

        let reused = inner
            .retained
            .get_mut(&(width, height))
            .and_then(Vec::pop);

        let bitmap = match reused {
            Some(bitmap) => {
                inner.retained_bytes -= bytes;
                bitmap
            }
            None => BitmapRef {
                width,
                height,
                pixels: vec![0; bytes],
            },
        };

        inner.outstanding_bytes += bytes;
        Ok(bitmap)
    }

    /// Returns a buffer to the pool, retaining it for reuse while the
    /// retention budget allows
    pub fn release(&self, bitmap: BitmapRef) {
        let bytes = bitmap.byte_len();
        let mut inner = self.lock();

        inner.outstanding_bytes = inner.outstanding_bytes.saturating_sub(bytes);

        if inner.retained_bytes + bytes > inner.retain_budget {
            debug!("pool retention budget full, dropping {bytes} byte buffer");
            return;
        }

        let key = (bitmap.width, bitmap.height);
        if let Some(stack) = inner.retained.get_mut(&key) {
            stack.push(bitmap);
        } else if let Some((_, evicted)) = inner.retained.push(key, vec![bitmap]) {
            let freed: usize = evicted.iter().map(BitmapRef::byte_len).sum();
            inner.retained_bytes -= freed;
        }
        inner.retained_bytes += bytes;
    }

    /// Bulk release, used by batched recycling
    pub fn release_all<I>(&self, bitmaps: I)
    where
        I: IntoIterator<Item = BitmapRef>,
    {
        for bitmap in bitmaps {
            self.release(bitmap);
        }
    }

    /// Drops every retained buffer and returns the number of bytes freed.
    /// The emergency entry point used on memory pressure.
    pub fn clear_retained(&self) -> usize {
        let mut inner = self.lock();
        let freed = inner.retained_bytes;
        inner.retained.clear();
        inner.retained_bytes = 0;

        if freed > 0 {
            info!("pool cleared: {freed} retained bytes released");
        }
        freed
    }

    /// Bytes currently lent out to live bitmap sets
    #[must_use]
    pub fn outstanding_bytes(&self) -> usize {
        self.lock().outstanding_bytes
    }

    /// Bytes currently held for reuse
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.lock().retained_bytes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for BitmapPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_retains_buffer() {
        let pool = BitmapPool::new();

        let bitmap = pool.acquire(64, 64).expect("acquire");
        assert_eq!(pool.outstanding_bytes(), 64 * 64 * 3);

        pool.release(bitmap);
        assert_eq!(pool.outstanding_bytes(), 0);
        assert_eq!(pool.retained_bytes(), 64 * 64 * 3);

        // Same-size acquire consumes the retained buffer.
        let _again = pool.acquire(64, 64).expect("reacquire");
        assert_eq!(pool.retained_bytes(), 0);
    }

    #[test]
    fn acquire_beyond_limit_is_exhausted() {
        let pool = BitmapPool::with_limits(1024, DEFAULT_RETAIN_BUDGET);

        let err = pool.acquire(100, 100).expect_err("must exhaust");
        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert_eq!(pool.outstanding_bytes(), 0);
    }

    #[test]
    fn limit_frees_up_after_release() {
        let bytes = buffer_bytes(16, 16);
        let pool = BitmapPool::with_limits(bytes, DEFAULT_RETAIN_BUDGET);

        let first = pool.acquire(16, 16).expect("first acquire");
        assert!(pool.acquire(16, 16).is_err());

        pool.release(first);
        assert!(pool.acquire(16, 16).is_ok());
    }

    #[test]
    fn retention_budget_drops_excess() {
        let bytes = buffer_bytes(32, 32);
        let pool = BitmapPool::with_limits(usize::MAX, bytes);

        let a = pool.acquire(32, 32).expect("a");
        let b = pool.acquire(32, 32).expect("b");

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.retained_bytes(), bytes);
    }

    #[test]
    fn clear_retained_reports_freed_bytes() {
        let pool = BitmapPool::new();
        let bitmap = pool.acquire(8, 8).expect("acquire");
        pool.release(bitmap);

        assert_eq!(pool.clear_retained(), buffer_bytes(8, 8));
        assert_eq!(pool.retained_bytes(), 0);
        assert_eq!(pool.clear_retained(), 0);
    }
}
