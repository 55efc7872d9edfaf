//! Page identity and the per-page tile tree
//!
//! The tree owns one root tile per page and materializes children on demand
//! as the view zooms in; nothing below the root is pre-allocated. Recycling
//! walks the materialized tree and batches freed buffers for one bulk
//! release.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::context::RenderContext;
use crate::decode::TileId;
use crate::events::TileEvent;
use crate::geometry::RectF;
use crate::node::TileNode;
use crate::view_state::ViewState;

/// One document page: index and intrinsic pixel dimensions, immutable for
/// the lifetime of its tile tree. The effective aspect ratio changes when a
/// committed root crop is applied.
pub struct Page {
    index: usize,
    width: f32,
    height: f32,
    aspect: Mutex<(f32, f32)>,
    crop_generation: AtomicU64,
}

impl Page {
    #[must_use]
    pub fn new(index: usize, width: f32, height: f32) -> Arc<Self> {
        Arc::new(Self {
            index,
            width,
            height,
            aspect: Mutex::new((width, height)),
            crop_generation: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Intrinsic page width in device pixels at zoom 1.0
    #[must_use]
    pub fn width(&self) -> f32 {
        self.width
    }

    /// Intrinsic page height in device pixels at zoom 1.0
    #[must_use]
    pub fn height(&self) -> f32 {
        self.height
    }

    /// Effective dimensions after any committed crop
    #[must_use]
    pub fn aspect_ratio(&self) -> (f32, f32) {
        *self
            .aspect
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set_aspect_ratio(&self, width: f32, height: f32, ctx: &RenderContext) {
        {
            let mut aspect = self
                .aspect
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *aspect == (width, height) {
                return;
            }
            *aspect = (width, height);
        }

        ctx.emit_event(TileEvent::AspectRatioChanged {
            page: self.index,
            width,
            height,
        });
    }

    /// Generation bumped on every root crop change; derived crops compare
    /// against it to decide whether to re-resolve
    pub(crate) fn crop_generation(&self) -> u64 {
        self.crop_generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_crop_generation(&self) {
        self.crop_generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// Quadtree of tiles for one page
pub struct TileTree {
    ctx: Arc<RenderContext>,
    root: Arc<TileNode>,
}

impl TileTree {
    /// Builds the tree with its root tile, seeding the root crop from the
    /// persisted page info
    #[must_use]
    pub fn new(ctx: Arc<RenderContext>, page: Arc<Page>) -> Arc<Self> {
        let root = TileNode::new_root(Arc::clone(&ctx), Arc::clone(&page));

        let info = ctx.with_store(|store| store.get(page.index()).cloned());
        root.set_initial_cropping(info.as_ref());

        Arc::new(Self { ctx, root })
    }

    #[must_use]
    pub fn root(&self) -> Arc<TileNode> {
        Arc::clone(&self.root)
    }

    /// Splits a tile into its four quadrant children on first demand;
    /// subsequent calls return the already-materialized children.
    ///
    /// Child ids follow the dense quadtree numbering `parent * 4 + quadrant
    /// + 1`, which keeps ids unique per page at every depth.
    pub fn materialize_children(&self, node: &Arc<TileNode>) -> Vec<Arc<TileNode>> {
        let existing = node.children();
        if !existing.is_empty() {
            return existing;
        }

        const QUADRANTS: [RectF; 4] = [
            RectF::new(0.0, 0.0, 0.5, 0.5),
            RectF::new(0.5, 0.0, 1.0, 0.5),
            RectF::new(0.0, 0.5, 0.5, 1.0),
            RectF::new(0.5, 0.5, 1.0, 1.0),
        ];

        let base = node.id().node * 4;
        let children: Vec<_> = QUADRANTS
            .iter()
            .enumerate()
            .map(|(i, local)| TileNode::new_child(node, base + i as u32 + 1, *local))
            .collect();

        debug!(
            "page {}: materialized children of tile {}",
            self.root.page().index(),
            node.id()
        );
        node.set_children(children.clone());
        children
    }

    /// Requests a decode for every tile the view needs, collecting the
    /// newly marked ones into a single batch submission so the coordinator
    /// can prioritize and coalesce.
    pub fn decode_tiles(&self, required: &[Arc<TileNode>], view_state: &ViewState) {
        let mut batch = Vec::new();
        for node in required {
            node.request_decode(&mut batch, view_state);
        }

        if batch.is_empty() {
            return;
        }

        let options = self.ctx.decode_options();
        self.ctx.decoder().submit_batch(&batch, view_state, options);
    }

    /// Recycles every materialized tile holding a bitmap that the view no
    /// longer needs, releasing all freed buffers in one bulk call
    pub fn recycle_unused(&self, keep: &HashSet<TileId>) {
        let mut batch = Vec::new();
        Self::recycle_walk(&self.root, keep, &mut batch);

        if !batch.is_empty() {
            debug!(
                "page {}: recycled {} tile bitmaps",
                self.root.page().index(),
                batch.len()
            );
            self.ctx.pool().release_all(batch);
        }
    }

    /// Emergency eviction of every bitmap in the tree
    pub fn purge(&self) -> usize {
        let mut batch = Vec::new();
        Self::purge_walk(&self.root, &mut batch);

        let count = batch.len();
        self.ctx.pool().release_all(batch);
        count
    }

    fn recycle_walk(
        node: &Arc<TileNode>,
        keep: &HashSet<TileId>,
        batch: &mut Vec<crate::pool::BitmapRef>,
    ) {
        if node.has_bitmap() && !keep.contains(&node.id()) {
            node.recycle(Some(&mut *batch));
        }
        for child in node.children() {
            Self::recycle_walk(&child, keep, batch);
        }
    }

    fn purge_walk(node: &Arc<TileNode>, batch: &mut Vec<crate::pool::BitmapRef>) {
        node.recycle(Some(&mut *batch));
        for child in node.children() {
            Self::purge_walk(&child, batch);
        }
    }
}
