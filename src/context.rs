//! Shared per-document plumbing
//!
//! One [`RenderContext`] is wired up per open document and handed to every
//! page tree. It bundles the bitmap pool, the decode-coordinator handle, the
//! render-thread queue, the event channel, settings and the crop store, so
//! tiles reach all of them through a single `Arc`.

use std::sync::{Arc, Mutex, OnceLock};

use flume::Sender;

use crate::coordinator::DecoderHandle;
use crate::decode::DecodeProgress;
use crate::events::{RenderQueue, TileEvent};
use crate::memory::MemoryGuard;
use crate::pool::BitmapPool;
use crate::settings::{BookSettings, DecodeOptions, PageCropStore, RenderConfig};

pub struct RenderContext {
    pool: Arc<BitmapPool>,
    tasks: RenderQueue,
    events: Sender<TileEvent>,
    progress: DecodeProgress,
    decoder: DecoderHandle,
    book: Mutex<BookSettings>,
    config: Mutex<RenderConfig>,
    store: Mutex<PageCropStore>,
    guard: OnceLock<Arc<MemoryGuard>>,
}

impl RenderContext {
    #[must_use]
    pub fn new(
        pool: Arc<BitmapPool>,
        decoder: DecoderHandle,
        tasks: RenderQueue,
        events: Sender<TileEvent>,
        book: BookSettings,
        config: RenderConfig,
        store: PageCropStore,
    ) -> Arc<Self> {
        let progress = decoder.progress().clone();
        Arc::new(Self {
            pool,
            tasks,
            events,
            progress,
            decoder,
            book: Mutex::new(book),
            config: Mutex::new(config),
            store: Mutex::new(store),
            guard: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BitmapPool> {
        &self.pool
    }

    #[must_use]
    pub fn tasks(&self) -> &RenderQueue {
        &self.tasks
    }

    #[must_use]
    pub fn progress(&self) -> &DecodeProgress {
        &self.progress
    }

    #[must_use]
    pub fn decoder(&self) -> &DecoderHandle {
        &self.decoder
    }

    pub fn emit_event(&self, event: TileEvent) {
        let _ = self.events.send(event);
    }

    /// Snapshot of the current book settings
    #[must_use]
    pub fn book_settings(&self) -> BookSettings {
        self.lock_book().clone()
    }

    pub fn set_book_settings(&self, settings: BookSettings) {
        *self.lock_book() = settings;
    }

    pub fn set_render_config(&self, config: RenderConfig) {
        *self
            .config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config;
    }

    /// Immutable correction/reuse snapshot for one decode submission
    #[must_use]
    pub fn decode_options(&self) -> DecodeOptions {
        let book = self.lock_book();
        let config = self
            .config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        DecodeOptions::snapshot(&book, &config)
    }

    /// Runs `f` with exclusive access to the crop store
    pub fn with_store<R>(&self, f: impl FnOnce(&mut PageCropStore) -> R) -> R {
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut store)
    }

    /// Attaches the memory guard after construction; wiring is two-phase
    /// because the guard registers trees that in turn hold this context
    pub fn attach_memory_guard(&self, guard: Arc<MemoryGuard>) {
        let _ = self.guard.set(guard);
    }

    #[must_use]
    pub fn memory_guard(&self) -> Option<&Arc<MemoryGuard>> {
        self.guard.get()
    }

    fn lock_book(&self) -> std::sync::MutexGuard<'_, BookSettings> {
        self.book
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
