//! Tile cache and decode coordination for very large document pages
//!
//! Pages are split into a lazily materialized quadtree of tiles, decoded
//! asynchronously at the resolution the view needs, with decoded bitmaps
//! cached in pooled buffers and reclaimed deterministically under memory
//! pressure. The actual page codec and the view layer are supplied by the
//! embedding application.

pub mod bitmaps;
pub mod context;
pub mod coordinator;
pub mod correction;
pub mod decode;
pub mod events;
pub mod geometry;
pub mod holder;
pub mod memory;
pub mod node;
pub mod pool;
pub mod settings;
pub mod tree;
pub mod view_state;

#[cfg(test)]
mod testkit;

pub use bitmaps::{BitmapSet, DrawSurface, PaintConfig};
pub use context::RenderContext;
pub use coordinator::{DecodeCoordinator, DecoderHandle, DEFAULT_WORKERS};
pub use correction::RawBitmap;
pub use decode::{
    CodecError, DecodeError, DecodeProgress, DecodedPixels, PageCodec, TileId,
};
pub use events::{
    event_channel, render_channel, RenderInbox, RenderQueue, RenderTask, TileEvent,
};
pub use geometry::{PixelRect, PointF, RectF};
pub use holder::BitmapHolder;
pub use memory::MemoryGuard;
pub use node::TileNode;
pub use pool::{BitmapPool, BitmapRef, PoolError};
pub use settings::{BookSettings, DecodeOptions, PageCropStore, PageInfo, RenderConfig};
pub use tree::{Page, TileTree};
pub use view_state::ViewState;
