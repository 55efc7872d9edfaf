//! One quadtree cell: geometry, decode state and bitmap ownership
//!
//! A tile is shared between the render thread (drawing, crop and geometry
//! reads, visible swaps) and decode workers (completion callbacks). The
//! in-flight flag is the only coordination point for decode lifecycle: it is
//! set by `request_decode`, and whoever clears it owns the transition.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, warn};

use crate::bitmaps::{BitmapSet, DrawSurface, PaintConfig};
use crate::context::RenderContext;
use crate::correction;
use crate::decode::{DecodeError, DecodedPixels, TileId};
use crate::events::{RenderTask, TileEvent};
use crate::geometry::{PixelRect, RectF};
use crate::holder::BitmapHolder;
use crate::pool::BitmapRef;
use crate::settings::{DecodeOptions, PageInfo};
use crate::tree::Page;
use crate::view_state::ViewState;

#[derive(Debug, Default)]
struct CropState {
    auto: Option<RectF>,
    manual: Option<RectF>,
    /// Page crop generation this node's derived crop was resolved against;
    /// 0 means never resolved. Unused for the root, whose crop is the
    /// source of truth.
    generation: u64,
}

pub struct TileNode {
    ctx: Arc<RenderContext>,
    page: Arc<Page>,
    parent: Weak<TileNode>,
    /// Back-reference to the owning `Arc`, for handing this node to batches
    /// and render tasks from `&self` methods
    self_ref: Weak<TileNode>,
    children: Mutex<Vec<Arc<TileNode>>>,
    id: TileId,
    level: u32,
    full_id: String,
    slice_bounds: RectF,
    decoding: AtomicBool,
    holder: BitmapHolder,
    crop: Mutex<CropState>,
    /// f32 bits of the zoom the held bitmap was decoded at
    bitmap_zoom: AtomicU32,
}

impl TileNode {
    pub(crate) fn new_root(ctx: Arc<RenderContext>, page: Arc<Page>) -> Arc<Self> {
        let id = TileId::new(page.index(), 0);
        Arc::new_cyclic(|self_ref| Self {
            ctx,
            page,
            parent: Weak::new(),
            self_ref: self_ref.clone(),
            children: Mutex::new(Vec::new()),
            id,
            level: 0,
            full_id: id.to_string(),
            slice_bounds: RectF::UNIT,
            decoding: AtomicBool::new(false),
            holder: BitmapHolder::new(),
            crop: Mutex::new(CropState::default()),
            bitmap_zoom: AtomicU32::new(1.0f32.to_bits()),
        })
    }

    pub(crate) fn new_child(parent: &Arc<Self>, id: u32, local_bounds: RectF) -> Arc<Self> {
        assert!(id != 0, "node id 0 is reserved for the root");
        debug_assert!(
            local_bounds.within_unit(),
            "child local bounds {local_bounds:?} outside parent space"
        );

        let slice_bounds = local_bounds.mapped_through(&parent.slice_bounds);
        let tile_id = TileId::new(parent.id.page, id);

        let node = Arc::new_cyclic(|self_ref| Self {
            ctx: Arc::clone(&parent.ctx),
            page: Arc::clone(&parent.page),
            parent: Arc::downgrade(parent),
            self_ref: self_ref.clone(),
            children: Mutex::new(Vec::new()),
            id: tile_id,
            level: parent.level + 1,
            full_id: tile_id.to_string(),
            slice_bounds,
            decoding: AtomicBool::new(false),
            holder: BitmapHolder::new(),
            crop: Mutex::new(CropState::default()),
            bitmap_zoom: AtomicU32::new(1.0f32.to_bits()),
        });

        node.evaluate_cropped_slice_bounds();
        node
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("a live tile always upgrades its own reference")
    }

    #[must_use]
    pub fn id(&self) -> TileId {
        self.id
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.id.node == 0
    }

    #[must_use]
    pub fn slice_bounds(&self) -> RectF {
        self.slice_bounds
    }

    #[must_use]
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    #[must_use]
    pub fn has_bitmap(&self) -> bool {
        self.holder.has_bitmap()
    }

    #[must_use]
    pub fn is_decoding(&self) -> bool {
        self.decoding.load(Ordering::Acquire)
    }

    /// Zoom factor of the currently held bitmap, for staleness decisions
    #[must_use]
    pub fn zoom_at_last_decode(&self) -> f32 {
        f32::from_bits(self.bitmap_zoom.load(Ordering::Acquire))
    }

    pub(crate) fn children(&self) -> Vec<Arc<TileNode>> {
        self.lock_children().clone()
    }

    pub(crate) fn set_children(&self, children: Vec<Arc<TileNode>>) {
        *self.lock_children() = children;
    }

    /// Marks this tile as decoding and appends it to the submission batch.
    /// A no-op while a decode is already in flight: at most one decode may
    /// be outstanding per tile.
    pub fn request_decode(&self, batch: &mut Vec<Arc<TileNode>>, view_state: &ViewState) {
        if self
            .decoding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.bitmap_zoom
                .store(view_state.zoom.to_bits(), Ordering::Release);
            batch.push(self.self_arc());
        }
    }

    /// Clears the in-flight flag. With a reason, also asks the coordinator
    /// to cancel the outstanding request. Idempotent.
    pub fn cancel_decode(&self, reason: Option<&str>) {
        if self
            .decoding
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.ctx.progress().decrease();
            if let Some(reason) = reason {
                self.ctx.decoder().stop_decoding(self.id, reason);
            }
        }
    }

    /// Completion callback, invoked from a decode worker thread.
    ///
    /// Correction runs here on the still-private payload; the visible swap
    /// and the flag clear are posted to the render thread. The raw payload
    /// is released exactly once on every exit path.
    pub fn on_decoded(&self, payload: Option<DecodedPixels>, options: &DecodeOptions) {
        let Some(payload) = payload else {
            debug!("tile {}: {}", self.id, DecodeError::Failed);
            self.ctx.tasks().post(RenderTask::ClearDecoding {
                node: self.self_arc(),
            });
            return;
        };

        let DecodedPixels {
            mut raw,
            bounds,
            detected_crop,
        } = payload;

        if options.needs_correction() {
            correction::apply(&mut raw, options);
        }

        match self
            .holder
            .reuse(&self.full_id, &raw, bounds, options, self.ctx.pool())
        {
            Ok(set) => {
                self.ctx.tasks().post(RenderTask::Install {
                    node: self.self_arc(),
                    set,
                    bounds,
                    detected_crop,
                });
            }
            Err(err) => {
                error!("tile {}: {}", self.id, DecodeError::AllocationExhausted(err));
                if let Some(guard) = self.ctx.memory_guard() {
                    guard.on_exhausted();
                }
                self.ctx.tasks().post(RenderTask::ClearDecoding {
                    node: self.self_arc(),
                });
            }
        }
        // `raw` drops here: the payload is released whichever path ran.
    }

    /// Render-thread half of a successful decode. Clearing the in-flight
    /// flag is the commit point; if the flag is already clear the tile was
    /// cancelled or recycled in the interim and the payload is discarded.
    pub(crate) fn install_bitmap(
        &self,
        set: Arc<BitmapSet>,
        bounds: PixelRect,
        detected_crop: Option<RectF>,
    ) {
        if self
            .decoding
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("{}", DecodeError::Stale(self.id));
            if let Some(bitmap) = set.take_bitmap() {
                self.ctx.pool().release(bitmap);
            }
            return;
        }
        self.ctx.progress().decrease();

        if self.is_root() {
            if let Some(crop) = detected_crop {
                self.set_auto_cropping(Some(crop), true);
                self.ctx.emit_event(TileEvent::CropDetected {
                    page: self.id.page,
                    crop,
                });
            }
        }

        self.holder.set_bitmap(set, self.ctx.pool());
        self.ctx
            .emit_event(TileEvent::ChildLoaded { id: self.id, bounds });
    }

    /// Render-thread half of a failed or empty decode
    pub(crate) fn finish_decode(&self) {
        if self
            .decoding
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.ctx.progress().decrease();
        }
    }

    /// Cancels any in-flight decode and empties the bitmap slot, routing the
    /// freed buffer into `batch` when supplied. Returns whether a bitmap was
    /// present.
    pub fn recycle(&self, batch: Option<&mut Vec<BitmapRef>>) -> bool {
        self.cancel_decode(Some("node recycling"));
        self.holder.recycle(batch, self.ctx.pool())
    }

    /// Manual override if present, else the detected crop; resolves derived
    /// crops lazily for non-root tiles
    #[must_use]
    pub fn get_cropping(&self) -> Option<RectF> {
        if !self.is_root() {
            self.ensure_crop_resolved();
        }
        let crop = self.lock_crop();
        crop.manual.or(crop.auto)
    }

    /// Seeds the root's crop from persisted page info at tree construction
    pub(crate) fn set_initial_cropping(&self, info: Option<&PageInfo>) {
        if !self.is_root() {
            return;
        }

        {
            let mut crop = self.lock_crop();
            crop.auto = info.and_then(|pi| pi.auto_cropping);
            crop.manual = info.and_then(|pi| pi.manual_cropping);
        }

        self.page.bump_crop_generation();
        self.update_aspect_ratio();
    }

    /// Updates the detected crop. Only root edits are accepted; non-root
    /// crops are derived. Committing persists the crop and recomputes the
    /// page aspect ratio.
    pub fn set_auto_cropping(&self, crop: Option<RectF>, commit: bool) {
        if !self.is_root() {
            debug!("tile {}: ignoring crop edit on non-root tile", self.id);
            return;
        }

        self.lock_crop().auto = crop;
        self.page.bump_crop_generation();

        if commit {
            if let Err(err) = self
                .ctx
                .with_store(|store| store.update_auto(self.id.page, crop))
            {
                warn!("tile {}: failed to persist auto crop: {err:#}", self.id);
            }
            self.update_aspect_ratio();
        }
    }

    /// Updates the user's crop override; same rules as `set_auto_cropping`
    pub fn set_manual_cropping(&self, crop: Option<RectF>, commit: bool) {
        if !self.is_root() {
            debug!("tile {}: ignoring crop edit on non-root tile", self.id);
            return;
        }

        self.lock_crop().manual = crop;
        self.page.bump_crop_generation();

        if commit {
            if let Err(err) = self
                .ctx
                .with_store(|store| store.update_manual(self.id.page, crop))
            {
                warn!("tile {}: failed to persist manual crop: {err:#}", self.id);
            }
            self.update_aspect_ratio();
        }
    }

    /// Applies the resolved crop to the page's intrinsic dimensions when
    /// page cropping is enabled
    pub(crate) fn update_aspect_ratio(&self) {
        if !self.ctx.book_settings().crop_pages {
            return;
        }
        let Some(cropping) = self.get_cropping() else {
            return;
        };

        let width = self.page.width() * cropping.width();
        let height = self.page.height() * cropping.height();
        self.page.set_aspect_ratio(width, height, &self.ctx);
    }

    /// Recomputes this tile's derived crop from its parent, ancestor-first.
    /// One pass per crop-settings change, not one per frame.
    pub fn evaluate_cropped_slice_bounds(&self) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };

        let page_generation = self.page.crop_generation();
        if !parent.is_root() && parent.crop_generation() != page_generation {
            parent.evaluate_cropped_slice_bounds();
        }

        let (parent_auto, parent_manual) = parent.crop_pair();
        let mut crop = self.lock_crop();
        crop.auto = parent_auto.map(|c| self.slice_bounds.mapped_through(&c));
        crop.manual = parent_manual.map(|c| self.slice_bounds.mapped_through(&c));
        crop.generation = page_generation;
    }

    /// Maps this tile into on-screen space given the page's view bounds
    #[must_use]
    pub fn get_target_rect(&self, page_bounds: RectF) -> RectF {
        self.slice_bounds.mapped_through(&page_bounds)
    }

    /// Device rectangle this tile must be decoded at for the given view
    #[must_use]
    pub fn target_pixel_rect(&self, view_state: &ViewState) -> PixelRect {
        view_state.tile_target_rect(&self.slice_bounds, self.page.width(), self.page.height())
    }

    /// Draws the held bitmap into its on-screen rectangle. Render thread
    /// only.
    pub fn draw(
        &self,
        surface: &mut dyn DrawSurface,
        paint: &PaintConfig,
        view_state: &ViewState,
        page_bounds: RectF,
        clip: RectF,
    ) -> bool {
        let target = self.get_target_rect(page_bounds);
        self.holder
            .draw(surface, paint, view_state.view_base, target, clip)
    }

    fn ensure_crop_resolved(&self) {
        let page_generation = self.page.crop_generation();
        if self.lock_crop().generation != page_generation {
            self.evaluate_cropped_slice_bounds();
        }
    }

    fn crop_generation(&self) -> u64 {
        if self.is_root() {
            self.page.crop_generation()
        } else {
            self.lock_crop().generation
        }
    }

    fn crop_pair(&self) -> (Option<RectF>, Option<RectF>) {
        let crop = self.lock_crop();
        (crop.auto, crop.manual)
    }

    fn lock_crop(&self) -> std::sync::MutexGuard<'_, CropState> {
        self.crop
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, Vec<Arc<TileNode>>> {
        self.children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PartialEq for TileNode {
    fn eq(&self, other: &Self) -> bool {
        self.id.page == other.id.page && self.slice_bounds == other.slice_bounds
    }
}

impl Eq for TileNode {}

impl Hash for TileNode {
    /// Coarse bucket by page index; collisions are resolved by the slice
    /// bounds comparison in `eq`
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.page.hash(state);
    }
}

impl fmt::Debug for TileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileNode")
            .field("id", &self.full_id)
            .field("rect", &self.slice_bounds)
            .field("hasBitmap", &self.has_bitmap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::RawBitmap;
    use crate::settings::BookSettings;
    use crate::testkit;

    fn payload(width: u32, height: u32) -> DecodedPixels {
        DecodedPixels {
            raw: RawBitmap::new(width, height, vec![128; (width * height * 3) as usize]),
            bounds: PixelRect::new(0, 0, width, height),
            detected_crop: None,
        }
    }

    #[test]
    fn request_decode_submits_once_while_in_flight() {
        let h = testkit::harness();
        let root = h.tree.root();
        let vs = ViewState::default();

        let mut batch = Vec::new();
        root.request_decode(&mut batch, &vs);
        root.request_decode(&mut batch, &vs);

        assert_eq!(batch.len(), 1);
        assert!(root.is_decoding());
    }

    #[test]
    fn request_decode_records_view_zoom() {
        let h = testkit::harness();
        let root = h.tree.root();
        let vs = ViewState {
            zoom: 2.5,
            ..ViewState::default()
        };

        let mut batch = Vec::new();
        root.request_decode(&mut batch, &vs);
        assert!((root.zoom_at_last_decode() - 2.5).abs() < f32::EPSILON);
    }

    #[test]
    fn populated_completion_installs_then_stale_one_is_discarded() {
        let h = testkit::harness();
        let root = h.tree.root();
        assert_eq!(root.id(), TileId::new(10, 0));
        assert_eq!(root.slice_bounds(), RectF::UNIT);

        let mut batch = Vec::new();
        root.request_decode(&mut batch, &ViewState::default());
        assert_eq!(batch.len(), 1);

        let options = h.ctx.decode_options();
        let (first, first_probe) = testkit::probed_payload(8, 8);
        root.on_decoded(Some(first), &options);
        assert_eq!(h.inbox.run_pending(), 1);
        assert!(root.has_bitmap());
        assert!(!root.is_decoding());
        assert!(first_probe.upgrade().is_none(), "first payload released");

        // Recycle, then a second completion for the old submission arrives.
        assert!(root.recycle(None));
        assert!(!root.has_bitmap());

        let (stale, stale_probe) = testkit::probed_payload(8, 8);
        root.on_decoded(Some(stale), &options);
        assert_eq!(h.inbox.run_pending(), 1);
        assert!(!root.has_bitmap());
        assert!(!root.is_decoding());
        assert!(stale_probe.upgrade().is_none(), "stale payload released");
        assert_eq!(h.ctx.pool().outstanding_bytes(), 0);
    }

    #[test]
    fn completion_after_cancel_does_not_install_or_leak() {
        let h = testkit::harness();
        let root = h.tree.root();

        let mut batch = Vec::new();
        root.request_decode(&mut batch, &ViewState::default());
        root.cancel_decode(Some("view moved away"));
        assert!(!root.is_decoding());

        let options = h.ctx.decode_options();
        let (payload, probe) = testkit::probed_payload(4, 4);
        root.on_decoded(Some(payload), &options);
        h.inbox.run_pending();

        assert!(!root.has_bitmap());
        assert!(probe.upgrade().is_none(), "payload released");
        assert_eq!(h.ctx.pool().outstanding_bytes(), 0);
    }

    #[test]
    fn empty_completion_clears_flag_without_cache_mutation() {
        let h = testkit::harness();
        let root = h.tree.root();

        let mut batch = Vec::new();
        root.request_decode(&mut batch, &ViewState::default());
        h.ctx.progress().increase(batch.len());

        let options = h.ctx.decode_options();
        root.on_decoded(None, &options);
        assert_eq!(h.inbox.run_pending(), 1);

        assert!(!root.is_decoding());
        assert!(!root.has_bitmap());
        assert_eq!(h.ctx.progress().current(), 0);
    }

    #[test]
    fn exhaustion_purges_once_and_clears_flag() {
        let h = testkit::harness_with_pool(Arc::new(crate::pool::BitmapPool::with_limits(
            16, 1024,
        )));
        let root = h.tree.root();

        let mut batch = Vec::new();
        root.request_decode(&mut batch, &ViewState::default());
        h.ctx.progress().increase(batch.len());

        let options = h.ctx.decode_options();
        root.on_decoded(Some(payload(32, 32)), &options);
        assert_eq!(h.inbox.run_pending(), 1);

        assert!(!root.is_decoding());
        assert!(!root.has_bitmap());
        assert_eq!(h.guard.purge_count(), 1);
        assert_eq!(h.ctx.progress().current(), 0);
    }

    #[test]
    fn child_slice_bounds_compose_through_parent() {
        let h = testkit::harness();
        let root = h.tree.root();

        let parent = TileNode::new_child(&root, 2, RectF::new(0.5, 0.0, 1.0, 0.5));
        let child = TileNode::new_child(&parent, 9, RectF::new(0.0, 0.0, 0.5, 0.5));

        let bounds = child.slice_bounds();
        assert!((bounds.left - 0.5).abs() < 1e-6);
        assert!((bounds.top - 0.0).abs() < 1e-6);
        assert!((bounds.right - 0.75).abs() < 1e-6);
        assert!((bounds.bottom - 0.25).abs() < 1e-6);
        assert_eq!(child.level(), 2);
    }

    #[test]
    #[should_panic(expected = "reserved for the root")]
    fn child_with_root_id_is_rejected() {
        let h = testkit::harness();
        let root = h.tree.root();
        let _ = TileNode::new_child(&root, 0, RectF::new(0.0, 0.0, 0.5, 0.5));
    }

    #[test]
    fn committed_manual_crop_recomputes_aspect_ratio() {
        let h = testkit::harness();
        h.ctx.set_book_settings(BookSettings {
            crop_pages: true,
            ..BookSettings::default()
        });
        let root = h.tree.root();

        root.set_manual_cropping(Some(RectF::new(0.1, 0.1, 0.9, 0.9)), true);

        let (width, height) = h.page.aspect_ratio();
        assert!((width - 600.0 * 0.8).abs() < 1e-3);
        assert!((height - 800.0 * 0.8).abs() < 1e-3);

        // The committed crop reached the store.
        let stored = h
            .ctx
            .with_store(|store| store.get(10).and_then(|pi| pi.manual_cropping));
        assert!(stored.is_some());
    }

    #[test]
    fn manual_crop_takes_precedence_over_auto() {
        let h = testkit::harness();
        let root = h.tree.root();

        root.set_auto_cropping(Some(RectF::new(0.0, 0.0, 0.5, 0.5)), false);
        root.set_manual_cropping(Some(RectF::new(0.2, 0.2, 0.8, 0.8)), false);

        let crop = root.get_cropping().expect("crop present");
        assert!((crop.left - 0.2).abs() < 1e-6);
    }

    #[test]
    fn derived_crop_follows_root_edits_lazily() {
        let h = testkit::harness();
        let root = h.tree.root();
        let child = TileNode::new_child(&root, 1, RectF::new(0.0, 0.0, 0.5, 0.5));

        // No crop anywhere yet.
        assert!(child.get_cropping().is_none());

        root.set_manual_cropping(Some(RectF::new(0.1, 0.1, 0.9, 0.9)), false);

        // The child re-resolves against the new root crop on next access.
        let crop = child.get_cropping().expect("derived crop");
        let expected = child
            .slice_bounds()
            .mapped_through(&RectF::new(0.1, 0.1, 0.9, 0.9));
        assert!((crop.left - expected.left).abs() < 1e-6);
        assert!((crop.bottom - expected.bottom).abs() < 1e-6);
    }

    #[test]
    fn crop_edits_on_non_root_tiles_are_ignored() {
        let h = testkit::harness();
        let root = h.tree.root();
        let child = TileNode::new_child(&root, 1, RectF::new(0.0, 0.0, 0.5, 0.5));

        child.set_manual_cropping(Some(RectF::new(0.3, 0.3, 0.7, 0.7)), true);
        assert!(child.get_cropping().is_none());
        assert!(h.ctx.with_store(|store| store.get(10).is_none()));
    }

    #[test]
    fn nodes_compare_by_page_and_slice_bounds() {
        let h = testkit::harness();
        let root = h.tree.root();

        let a = TileNode::new_child(&root, 1, RectF::new(0.0, 0.0, 0.5, 0.5));
        let b = TileNode::new_child(&root, 2, RectF::new(0.0, 0.0, 0.5, 0.5));
        let c = TileNode::new_child(&root, 3, RectF::new(0.5, 0.0, 1.0, 0.5));

        // Same page and bounds: equal even with different sibling ids.
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn target_rect_maps_into_view_space() {
        let h = testkit::harness();
        let root = h.tree.root();
        let child = TileNode::new_child(&root, 1, RectF::new(0.5, 0.5, 1.0, 1.0));

        let page_bounds = RectF::new(100.0, 200.0, 300.0, 600.0);
        let target = child.get_target_rect(page_bounds);
        assert!((target.left - 200.0).abs() < 1e-3);
        assert!((target.top - 400.0).abs() < 1e-3);
        assert!((target.right - 300.0).abs() < 1e-3);
        assert!((target.bottom - 600.0).abs() < 1e-3);
    }
}
