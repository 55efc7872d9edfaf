//! Decoded tile payloads and their drawing
//!
//! A [`BitmapSet`] owns the pooled device buffer backing one tile's visible
//! image. Pixel ownership is serialized by a per-set mutex so that a recycle
//! racing a draw yields either the prior image in full or nothing.

use std::sync::Mutex;

use crate::correction::RawBitmap;
use crate::geometry::{PixelRect, PointF, RectF};
use crate::pool::{BitmapPool, BitmapRef, PoolError};

/// Paint configuration applied when blitting tiles
#[derive(Clone, Copy, Debug)]
pub struct PaintConfig {
    /// Smooth scaling when the target rectangle differs from native size
    pub bilinear_filter: bool,
}

impl Default for PaintConfig {
    fn default() -> Self {
        Self {
            bilinear_filter: true,
        }
    }
}

/// Rendering target implemented by the view layer.
///
/// `pixels` is the full RGB buffer of `width * height` pixels; `target` is
/// the on-screen rectangle already offset by the view origin.
pub trait DrawSurface {
    fn blit(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        target: RectF,
        clip: RectF,
        paint: &PaintConfig,
    );
}

struct Texture {
    id: String,
    bounds: PixelRect,
    invert: bool,
    bitmap: BitmapRef,
}

/// One tile's decoded image: a pooled buffer plus the pixel rectangle it
/// covers and the identity it was decoded for.
pub struct BitmapSet {
    texture: Mutex<Option<Texture>>,
}

impl BitmapSet {
    /// Builds a fresh set by copying the raw payload into a pooled buffer
    pub fn new(
        id: &str,
        raw: &RawBitmap,
        bounds: PixelRect,
        invert: bool,
        pool: &BitmapPool,
    ) -> Result<Self, PoolError> {
        let mut bitmap = pool.acquire(raw.width(), raw.height())?;
        bitmap.pixels_mut().copy_from_slice(raw.pixels());

        Ok(Self {
            texture: Mutex::new(Some(Texture {
                id: id.to_string(),
                bounds,
                invert,
                bitmap,
            })),
        })
    }

    /// Attempts in-place pixel replacement, avoiding a pool round trip.
    ///
    /// Succeeds only when a buffer is resident, the dimensions match, and
    /// the invert flag is unchanged; a night-mode flip always forces a fresh
    /// allocation.
    pub fn reuse(&self, id: &str, raw: &RawBitmap, bounds: PixelRect, invert: bool) -> bool {
        let mut texture = self.lock();
        match texture.as_mut() {
            Some(tex)
                if tex.bitmap.width() == raw.width()
                    && tex.bitmap.height() == raw.height()
                    && tex.invert == invert =>
            {
                tex.bitmap.pixels_mut().copy_from_slice(raw.pixels());
                tex.id.clear();
                tex.id.push_str(id);
                tex.bounds = bounds;
                true
            }
            _ => false,
        }
    }

    /// Draws the held image mapped to `target`, offset by the view origin
    /// and clipped to `clip`. Returns whether anything was drawn.
    pub fn draw(
        &self,
        surface: &mut dyn DrawSurface,
        paint: &PaintConfig,
        view_base: PointF,
        target: RectF,
        clip: RectF,
    ) -> bool {
        let texture = self.lock();
        let Some(tex) = texture.as_ref() else {
            return false;
        };

        let target = target.translated(-view_base.x, -view_base.y);
        if !target.intersects(&clip) {
            return false;
        }

        surface.blit(
            tex.bitmap.pixels(),
            tex.bitmap.width(),
            tex.bitmap.height(),
            target,
            clip,
            paint,
        );
        true
    }

    /// Takes the device buffer out of the set, ending its visible life.
    /// Subsequent draws render nothing.
    pub fn take_bitmap(&self) -> Option<BitmapRef> {
        self.lock().take().map(|tex| tex.bitmap)
    }

    #[must_use]
    pub fn has_bitmaps(&self) -> bool {
        self.lock().is_some()
    }

    /// Pixel rectangle of the held image, if any
    #[must_use]
    pub fn pixel_bounds(&self) -> Option<PixelRect> {
        self.lock().as_ref().map(|tex| tex.bounds)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Texture>> {
        self.texture
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BitmapSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let texture = self.lock();
        let mut s = f.debug_struct("BitmapSet");
        match texture.as_ref() {
            Some(tex) => s
                .field("id", &tex.id)
                .field("bounds", &tex.bounds)
                .field("invert", &tex.invert)
                .finish(),
            None => s.field("recycled", &true).finish(),
        }
    }
}
