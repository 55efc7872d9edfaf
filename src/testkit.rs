//! Shared fixtures for the crate's tests

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use flume::Receiver;

use crate::context::RenderContext;
use crate::coordinator::DecodeCoordinator;
use crate::correction::RawBitmap;
use crate::decode::{CodecError, DecodedPixels, PageCodec, TileId};
use crate::events::{event_channel, render_channel, RenderInbox, TileEvent};
use crate::geometry::PixelRect;
use crate::memory::MemoryGuard;
use crate::pool::BitmapPool;
use crate::settings::{BookSettings, PageCropStore, RenderConfig};
use crate::tree::{Page, TileTree};

/// Fully wired single-page fixture: page 10, 600x800 px, one decode worker
pub(crate) struct Harness {
    pub ctx: Arc<RenderContext>,
    pub inbox: RenderInbox,
    pub events: Receiver<TileEvent>,
    pub page: Arc<Page>,
    pub tree: Arc<TileTree>,
    pub guard: Arc<MemoryGuard>,
    _coordinator: DecodeCoordinator,
}

pub(crate) fn harness() -> Harness {
    harness_with(Arc::new(BitmapPool::new()), Arc::new(MockCodec::new()))
}

pub(crate) fn harness_with_pool(pool: Arc<BitmapPool>) -> Harness {
    harness_with(pool, Arc::new(MockCodec::new()))
}

pub(crate) fn harness_with_codec(codec: Arc<dyn PageCodec>) -> Harness {
    harness_with(Arc::new(BitmapPool::new()), codec)
}

pub(crate) fn harness_failing() -> Harness {
    let codec = MockCodec::new();
    codec.fail_page(10);
    harness_with(Arc::new(BitmapPool::new()), Arc::new(codec))
}

fn harness_with(pool: Arc<BitmapPool>, codec: Arc<dyn PageCodec>) -> Harness {
    let coordinator = DecodeCoordinator::new(codec, 1);
    let (tasks, inbox) = render_channel();
    let (event_tx, events) = event_channel();

    let ctx = RenderContext::new(
        Arc::clone(&pool),
        coordinator.handle(),
        tasks,
        event_tx,
        BookSettings::default(),
        RenderConfig::default(),
        PageCropStore::in_memory(),
    );

    let guard = MemoryGuard::new(pool);
    ctx.attach_memory_guard(Arc::clone(&guard));

    let page = Page::new(10, 600.0, 800.0);
    let tree = TileTree::new(Arc::clone(&ctx), Arc::clone(&page));
    guard.register(&tree);

    Harness {
        ctx,
        inbox,
        events,
        page,
        tree,
        guard,
        _coordinator: coordinator,
    }
}

pub(crate) fn gray_payload(target: PixelRect) -> DecodedPixels {
    let (width, height) = (target.width().max(1), target.height().max(1));
    DecodedPixels {
        raw: RawBitmap::new(width, height, vec![128; (width * height * 3) as usize]),
        bounds: target,
        detected_crop: None,
    }
}

/// Payload plus a watcher that reports, deterministically, whether the raw
/// pixels were released
pub(crate) fn probed_payload(width: u32, height: u32) -> (DecodedPixels, std::sync::Weak<()>) {
    let probe = Arc::new(());
    let watcher = Arc::downgrade(&probe);

    let mut payload = gray_payload(PixelRect::new(0, 0, width, height));
    payload.raw.set_probe(probe);
    (payload, watcher)
}

/// Immediate codec producing gray tiles; individual pages can be failed
pub(crate) struct MockCodec {
    fail_pages: Mutex<HashSet<usize>>,
}

impl MockCodec {
    pub fn new() -> Self {
        Self {
            fail_pages: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_page(&self, page: usize) {
        self.fail_pages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(page);
    }
}

impl PageCodec for MockCodec {
    fn decode(
        &self,
        page: usize,
        target: PixelRect,
        _zoom: f32,
    ) -> Result<DecodedPixels, CodecError> {
        let failing = self
            .fail_pages
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&page);
        if failing {
            return Err(CodecError::generic(format!("mock failure on page {page}")));
        }

        Ok(gray_payload(target))
    }
}

/// Codec that blocks inside `decode` until a permit is released, for tests
/// that need to race cancellation against an in-progress decode. Every
/// produced payload carries a probe so tests can prove none leaked.
pub(crate) struct GateCodec {
    started: flume::Sender<TileId>,
    permits: Mutex<usize>,
    released: Condvar,
    probes: Mutex<Vec<std::sync::Weak<()>>>,
}

impl GateCodec {
    pub fn new() -> (Arc<Self>, Receiver<TileId>) {
        let (started, started_rx) = flume::unbounded();
        (
            Arc::new(Self {
                started,
                permits: Mutex::new(0),
                released: Condvar::new(),
                probes: Mutex::new(Vec::new()),
            }),
            started_rx,
        )
    }

    /// Lets `n` blocked or future decodes proceed
    pub fn release(&self, n: usize) {
        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *permits += n;
        self.released.notify_all();
    }

    /// Whether every payload this codec produced has been dropped
    pub fn all_payloads_released(&self) -> bool {
        self.probes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .all(|probe| probe.upgrade().is_none())
    }
}

impl PageCodec for GateCodec {
    fn decode(
        &self,
        page: usize,
        target: PixelRect,
        _zoom: f32,
    ) -> Result<DecodedPixels, CodecError> {
        let _ = self.started.send(TileId::new(page, 0));

        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while *permits == 0 {
            permits = self
                .released
                .wait(permits)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *permits -= 1;
        drop(permits);

        let probe = Arc::new(());
        self.probes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::downgrade(&probe));

        let mut payload = gray_payload(target);
        payload.raw.set_probe(probe);
        Ok(payload)
    }
}
