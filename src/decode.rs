//! Decode-service boundary types
//!
//! Everything the coordinator exchanges with decode workers and with the
//! external page codec lives here, along with the error taxonomy absorbed at
//! the tile boundary.

use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use crate::correction::RawBitmap;
use crate::geometry::{PixelRect, RectF};
use crate::node::TileNode;
use crate::pool::PoolError;
use crate::settings::DecodeOptions;

/// Full identity of a tile: page index plus sibling-local node id.
/// Node id 0 is reserved for the root of a page's tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileId {
    pub page: usize,
    pub node: u32,
}

impl TileId {
    #[must_use]
    pub const fn new(page: usize, node: u32) -> Self {
        Self { page, node }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page, self.node)
    }
}

/// Payload produced by a successful decode
#[derive(Debug)]
pub struct DecodedPixels {
    /// Raw RGB pixels, owned until released
    pub raw: RawBitmap,

    /// Pixel rectangle the payload covers in page device space
    pub bounds: PixelRect,

    /// Content region detected by the codec's crop heuristics, in
    /// normalized page space
    pub detected_crop: Option<RectF>,
}

/// The external page codec: turns a page plus device rectangle into pixels.
///
/// Implementations are driven concurrently from multiple worker threads.
pub trait PageCodec: Send + Sync {
    fn decode(&self, page: usize, target: PixelRect, zoom: f32)
        -> Result<DecodedPixels, CodecError>;
}

/// Errors from the external codec
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{detail}")]
    Generic { detail: String },

    #[error("page {page} out of range")]
    PageOutOfRange { page: usize },
}

impl CodecError {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic { detail: msg.into() }
    }
}

/// Failures absorbed at the tile boundary; nothing here propagates above the
/// tile tree
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The codec returned no payload; the tile stays blank until the view
    /// requests it again
    #[error("decode produced no payload")]
    Failed,

    /// Building or installing the bitmap ran out of pooled memory
    #[error(transparent)]
    AllocationExhausted(#[from] PoolError),

    /// A completion arrived for a tile that is no longer waiting for it
    #[error("stale completion for tile {0}")]
    Stale(TileId),
}

/// Requests consumed by decode workers
pub enum DecodeRequest {
    Tile {
        node: Arc<TileNode>,
        target: PixelRect,
        zoom: f32,
        generation: u64,
        options: DecodeOptions,
    },
    Shutdown,
}

/// Count of decodes currently in flight, shared between the coordinator and
/// every tile; observable by the embedder for a progress indicator
#[derive(Clone, Debug, Default)]
pub struct DecodeProgress {
    count: Arc<AtomicIsize>,
}

impl DecodeProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increase(&self, n: usize) {
        self.count.fetch_add(n as isize, Ordering::Relaxed);
    }

    pub fn decrease(&self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current(&self) -> isize {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_id_display_is_page_colon_node() {
        assert_eq!(TileId::new(10, 0).to_string(), "10:0");
        assert_eq!(TileId::new(3, 14).to_string(), "3:14");
    }

    #[test]
    fn progress_counts_up_and_down() {
        let progress = DecodeProgress::new();
        progress.increase(3);
        assert_eq!(progress.current(), 3);

        progress.decrease();
        progress.decrease();
        assert_eq!(progress.current(), 1);

        let clone = progress.clone();
        clone.decrease();
        assert_eq!(progress.current(), 0);
    }
}
