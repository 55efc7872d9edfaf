//! In-place pixel correction for decoded payloads
//!
//! All transforms operate on the raw RGB payload before it is shared with
//! the render thread, so they need no synchronization. Rows are processed in
//! parallel for large tiles; the invert inner loop is vectorized.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::settings::{DecodeOptions, DEFAULT_CONTRAST, DEFAULT_EXPOSURE};

/// Row-pixel threshold above which correction runs row-parallel
const PARALLEL_PIXEL_THRESHOLD: usize = 200_000;

const LUMA_R: u32 = 54;
const LUMA_G: u32 = 183;
const LUMA_B: u32 = 19;

static PAYLOADS_PRODUCED: AtomicUsize = AtomicUsize::new(0);
static PAYLOADS_RELEASED: AtomicUsize = AtomicUsize::new(0);

/// Total raw payloads constructed since process start
#[must_use]
pub fn payloads_produced() -> usize {
    PAYLOADS_PRODUCED.load(Ordering::Relaxed)
}

/// Total raw payloads released since process start
#[must_use]
pub fn payloads_released() -> usize {
    PAYLOADS_RELEASED.load(Ordering::Relaxed)
}

/// A decoded pixel buffer, 3 bytes per pixel (RGB), owned until released.
///
/// Construction and drop feed a process-wide audit so leak checks can assert
/// that every payload a codec produced was released exactly once, whichever
/// exit path the completion handler took.
#[derive(Debug)]
pub struct RawBitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    #[cfg(test)]
    probe: Option<std::sync::Arc<()>>,
}

impl RawBitmap {
    #[must_use]
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), (width * height * 3) as usize);
        PAYLOADS_PRODUCED.fetch_add(1, Ordering::Relaxed);
        Self {
            width,
            height,
            pixels,
            #[cfg(test)]
            probe: None,
        }
    }

    /// Attaches a release probe; tests watch the matching `Weak` to prove a
    /// payload was dropped on a given path
    #[cfg(test)]
    pub(crate) fn set_probe(&mut self, probe: std::sync::Arc<()>) {
        self.probe = Some(probe);
    }

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

    fn row_stride(&self) -> usize {
        self.width as usize * 3
    }

    fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Drop for RawBitmap {
    fn drop(&mut self) {
        PAYLOADS_RELEASED.fetch_add(1, Ordering::Relaxed);
    }
}

/// Applies every correction the options ask for, in place
pub fn apply(raw: &mut RawBitmap, options: &DecodeOptions) {
    if options.contrast != DEFAULT_CONTRAST {
        contrast(raw, options.contrast);
    }
    if options.exposure != DEFAULT_EXPOSURE {
        exposure(raw, options.exposure - DEFAULT_EXPOSURE);
    }
    if options.auto_levels {
        auto_levels(raw);
    }
    if options.invert {
        invert(raw);
    }
}

/// Contrast in percent around mid-gray; 100 leaves pixels unchanged
pub fn contrast(raw: &mut RawBitmap, level: i32) {
    let mut lut = [0u8; 256];
    for (v, entry) in lut.iter_mut().enumerate() {
        let adjusted = (v as i32 - 128) * level / 100 + 128;
        *entry = adjusted.clamp(0, 255) as u8;
    }
    apply_lut(raw, &lut);
}

/// Adds a brightness delta to every channel, saturating at the byte range
pub fn exposure(raw: &mut RawBitmap, delta: i32) {
    let mut lut = [0u8; 256];
    for (v, entry) in lut.iter_mut().enumerate() {
        *entry = (v as i32 + delta).clamp(0, 255) as u8;
    }
    apply_lut(raw, &lut);
}

/// Stretches the observed luminance range to the full byte range
pub fn auto_levels(raw: &mut RawBitmap) {
    let mut min = 255u32;
    let mut max = 0u32;

    for px in raw.pixels.chunks_exact(3) {
        let luma =
            (u32::from(px[0]) * LUMA_R + u32::from(px[1]) * LUMA_G + u32::from(px[2]) * LUMA_B)
                >> 8;
        min = min.min(luma);
        max = max.max(luma);
    }

    if max <= min {
        return;
    }

    let range = max - min;
    let mut lut = [0u8; 256];
    for (v, entry) in lut.iter_mut().enumerate() {
        let stretched = (v as u32).saturating_sub(min) * 255 / range;
        *entry = stretched.min(255) as u8;
    }
    apply_lut(raw, &lut);
}

/// Inverts every channel for night reading
pub fn invert(raw: &mut RawBitmap) {
    let stride = raw.row_stride();
    if raw.pixel_count() >= PARALLEL_PIXEL_THRESHOLD && raw.height >= 4 {
        raw.pixels
            .par_chunks_mut(stride)
            .for_each(|row| simd_px::invert_row(row));
    } else {
        for row in raw.pixels.chunks_mut(stride) {
            simd_px::invert_row(row);
        }
    }
}

fn apply_lut(raw: &mut RawBitmap, lut: &[u8; 256]) {
    let stride = raw.row_stride();
    if raw.pixel_count() >= PARALLEL_PIXEL_THRESHOLD && raw.height >= 4 {
        raw.pixels.par_chunks_mut(stride).for_each(|row| {
            for b in row {
                *b = lut[usize::from(*b)];
            }
        });
    } else {
        for b in &mut raw.pixels {
            *b = lut[usize::from(*b)];
        }
    }
}

mod simd_px {
    use wide::u16x8;

    #[inline]
    pub fn invert_row(row: &mut [u8]) {
        let chunks = row.len() / 8;
        let simd_end = chunks * 8;
        let (simd_part, remainder) = row.split_at_mut(simd_end);

        for chunk in simd_part.chunks_exact_mut(8) {
            let v = u16x8::new([
                u16::from(chunk[0]),
                u16::from(chunk[1]),
                u16::from(chunk[2]),
                u16::from(chunk[3]),
                u16::from(chunk[4]),
                u16::from(chunk[5]),
                u16::from(chunk[6]),
                u16::from(chunk[7]),
            ]);

            let inverted = u16x8::splat(255) - v;
            let arr = inverted.to_array();
            for (dst, src) in chunk.iter_mut().zip(arr.iter()) {
                *dst = *src as u8;
            }
        }

        for b in remainder {
            *b = 255 - *b;
        }
    }
}
