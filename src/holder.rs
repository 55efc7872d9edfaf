//! Single-slot concurrency-safe bitmap cell
//!
//! Each tile owns one [`BitmapHolder`]. Exactly one of draw, reuse, set or
//! recycle observes the slot at a time through a mutex held only across the
//! swap or snapshot instant; drawing and decoding always happen outside it,
//! so the render thread never blocks on decode completion or eviction.

use std::sync::{Arc, Mutex};

use crate::bitmaps::{BitmapSet, DrawSurface, PaintConfig};
use crate::correction::RawBitmap;
use crate::geometry::{PixelRect, PointF, RectF};
use crate::pool::{BitmapPool, BitmapRef, PoolError};
use crate::settings::DecodeOptions;

/// Thread-safe slot holding zero or one decoded bitmap set
#[derive(Debug, Default)]
pub struct BitmapHolder {
    slot: Mutex<Option<Arc<BitmapSet>>>,
}

impl BitmapHolder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders the held set if present. Takes one consistent snapshot of the
    /// slot, then draws outside the slot lock; a recycle racing this call
    /// yields either the prior image in full or nothing.
    pub fn draw(
        &self,
        surface: &mut dyn DrawSurface,
        paint: &PaintConfig,
        view_base: PointF,
        target: RectF,
        clip: RectF,
    ) -> bool {
        match self.snapshot() {
            Some(set) => set.draw(surface, paint, view_base, target, clip),
            None => false,
        }
    }

    /// Builds the bitmap set for a fresh payload, replacing pixels of the
    /// resident set in place when texture reuse allows it.
    ///
    /// The result is not installed; the visible swap is the caller's
    /// separate [`set_bitmap`](Self::set_bitmap) at a safe point on the
    /// render thread.
    pub fn reuse(
        &self,
        id: &str,
        raw: &RawBitmap,
        bounds: PixelRect,
        options: &DecodeOptions,
        pool: &BitmapPool,
    ) -> Result<Arc<BitmapSet>, PoolError> {
        if options.texture_reuse {
            if let Some(set) = self.snapshot() {
                if set.reuse(id, raw, bounds, options.invert) {
                    return Ok(set);
                }
            }
        }

        Ok(Arc::new(BitmapSet::new(
            id,
            raw,
            bounds,
            options.invert,
            pool,
        )?))
    }

    /// Atomically swaps in `new`; a previously held set, if distinct, is
    /// released back to the pool
    pub fn set_bitmap(&self, new: Arc<BitmapSet>, pool: &BitmapPool) {
        let old = {
            let mut slot = self.lock();
            slot.replace(Arc::clone(&new))
        };

        if let Some(old) = old {
            if !Arc::ptr_eq(&old, &new) {
                if let Some(bitmap) = old.take_bitmap() {
                    pool.release(bitmap);
                }
            }
        }
    }

    /// Atomically removes the held set. The freed buffer goes into
    /// `collector` when supplied (for deferred bulk release), otherwise
    /// straight back to the pool. Returns whether anything was present.
    pub fn recycle(&self, collector: Option<&mut Vec<BitmapRef>>, pool: &BitmapPool) -> bool {
        let old = self.lock().take();

        let Some(set) = old else {
            return false;
        };

        if let Some(bitmap) = set.take_bitmap() {
            match collector {
                Some(batch) => batch.push(bitmap),
                None => pool.release(bitmap),
            }
        }
        true
    }

    /// Non-blocking presence check
    #[must_use]
    pub fn has_bitmap(&self) -> bool {
        self.snapshot().is_some_and(|set| set.has_bitmaps())
    }

    fn snapshot(&self) -> Option<Arc<BitmapSet>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<BitmapSet>>> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
