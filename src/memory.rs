//! Emergency eviction on memory pressure
//!
//! When any cache-affecting operation hits allocation exhaustion it asks the
//! guard for a purge: every registered tree drops its cached bitmaps and the
//! pool drops its retained buffers. The failing operation then degrades to
//! an empty decode result instead of crashing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::warn;

use crate::pool::BitmapPool;
use crate::tree::TileTree;

pub struct MemoryGuard {
    pool: Arc<BitmapPool>,
    trees: Mutex<Vec<Weak<TileTree>>>,
    purging: AtomicBool,
    purges: AtomicUsize,
}

impl MemoryGuard {
    #[must_use]
    pub fn new(pool: Arc<BitmapPool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            trees: Mutex::new(Vec::new()),
            purging: AtomicBool::new(false),
            purges: AtomicUsize::new(0),
        })
    }

    /// Registers a tree for emergency purging. Dead registrations are
    /// pruned on the next purge.
    pub fn register(&self, tree: &Arc<TileTree>) {
        self.lock_trees().push(Arc::downgrade(tree));
    }

    /// Purges every registered tree and the pool's retained buffers.
    /// Overlapping calls coalesce into the purge already in progress.
    pub fn on_exhausted(&self) {
        if self.purging.swap(true, Ordering::AcqRel) {
            return;
        }

        let trees: Vec<_> = {
            let mut registered = self.lock_trees();
            registered.retain(|weak| weak.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };

        let mut evicted = 0;
        for tree in &trees {
            evicted += tree.purge();
        }
        let retained_freed = self.pool.clear_retained();

        self.purges.fetch_add(1, Ordering::Relaxed);
        self.purging.store(false, Ordering::Release);

        warn!(
            "emergency purge: {evicted} tile bitmaps evicted across {} pages, \
             {retained_freed} retained bytes freed",
            trees.len()
        );
    }

    /// Completed purges since construction
    #[must_use]
    pub fn purge_count(&self) -> usize {
        self.purges.load(Ordering::Relaxed)
    }

    fn lock_trees(&self) -> std::sync::MutexGuard<'_, Vec<Weak<TileTree>>> {
        self.trees
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::RawBitmap;
    use crate::decode::DecodedPixels;
    use crate::geometry::PixelRect;
    use crate::testkit;
    use crate::view_state::ViewState;

    fn payload(width: u32, height: u32) -> DecodedPixels {
        DecodedPixels {
            raw: RawBitmap::new(width, height, vec![50; (width * height * 3) as usize]),
            bounds: PixelRect::new(0, 0, width, height),
            detected_crop: None,
        }
    }

    #[test]
    fn purge_evicts_registered_trees_and_retained_buffers() {
        let h = testkit::harness();
        let root = h.tree.root();
        let options = h.ctx.decode_options();

        let mut batch = Vec::new();
        root.request_decode(&mut batch, &ViewState::default());
        h.ctx.progress().increase(batch.len());
        root.on_decoded(Some(payload(8, 8)), &options);
        h.inbox.run_pending();
        assert!(root.has_bitmap());

        // Park something in the pool's retention cache as well.
        let spare = h.ctx.pool().acquire(4, 4).expect("spare");
        h.ctx.pool().release(spare);
        assert!(h.ctx.pool().retained_bytes() > 0);

        h.guard.on_exhausted();

        assert!(!root.has_bitmap());
        assert_eq!(h.ctx.pool().outstanding_bytes(), 0);
        assert_eq!(h.ctx.pool().retained_bytes(), 0);
        assert_eq!(h.guard.purge_count(), 1);
    }

    #[test]
    fn sequential_purges_each_complete() {
        let h = testkit::harness();
        h.guard.on_exhausted();
        h.guard.on_exhausted();
        assert_eq!(h.guard.purge_count(), 2);
    }

    #[test]
    fn dropped_trees_are_pruned() {
        let h = testkit::harness();

        {
            let page = crate::tree::Page::new(42, 100.0, 100.0);
            let tree = crate::tree::TileTree::new(Arc::clone(&h.ctx), page);
            h.guard.register(&tree);
        }

        // The dead registration must not break or hang the purge.
        h.guard.on_exhausted();
        assert_eq!(h.guard.purge_count(), 1);
    }
}
