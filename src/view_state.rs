//! View snapshot carried with decode submissions
//!
//! A `ViewState` is an immutable copy of the viewing parameters at the moment
//! tiles are requested. Decode workers and the render thread both read it
//! without touching live view-layer state.

use crate::geometry::{PixelRect, PointF, RectF};

/// Snapshot of the current view
#[derive(Clone, Copy, Debug)]
pub struct ViewState {
    /// Current zoom factor (1.0 = page fits the view at native scale)
    pub zoom: f32,

    /// Scroll origin of the view window, in view pixels
    pub view_base: PointF,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            view_base: PointF::new(0.0, 0.0),
        }
    }
}

impl ViewState {
    #[must_use]
    pub const fn new(zoom: f32, view_base: PointF) -> Self {
        Self { zoom, view_base }
    }

    /// Pixel rectangle a tile must be decoded at: its slice bounds scaled by
    /// the page's intrinsic pixel dimensions and the current zoom.
    #[must_use]
    pub fn tile_target_rect(&self, slice: &RectF, page_width: f32, page_height: f32) -> PixelRect {
        let w = page_width * self.zoom;
        let h = page_height * self.zoom;
        PixelRect::new(
            (slice.left * w).floor() as u32,
            (slice.top * h).floor() as u32,
            (slice.right * w).ceil() as u32,
            (slice.bottom * h).ceil() as u32,
        )
    }
}
