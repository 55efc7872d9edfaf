//! Decode coordination: worker pool, per-tile dedup, cancellation
//!
//! The coordinator is the only component that talks to the external page
//! codec. Requests fan out over a shared MPMC channel to worker threads;
//! completions are routed back to the owning tile, which marshals the
//! visible part onto the render thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flume::{Receiver, Sender};
use log::{debug, warn};

use crate::decode::{DecodeProgress, DecodeRequest, PageCodec, TileId};
use crate::geometry::PixelRect;
use crate::node::TileNode;
use crate::settings::DecodeOptions;
use crate::view_state::ViewState;

/// Default number of decode worker threads
pub const DEFAULT_WORKERS: usize = 2;

type PendingMap = Arc<Mutex<HashMap<TileId, u64>>>;

/// Why a finished decode was or was not delivered to its tile
enum Outcome {
    /// This submission is still the current one for its identity
    Current,
    /// A newer submission for the same identity replaced this one; the
    /// newer completion owns the tile's in-flight flag
    Superseded,
    /// The submission was cancelled; deliver an empty completion so the
    /// tile is never left stuck decoding
    Cancelled,
}

/// Clonable submission/cancellation handle shared through the render context
#[derive(Clone)]
pub struct DecoderHandle {
    tx: Sender<DecodeRequest>,
    pending: PendingMap,
    next_generation: Arc<AtomicU64>,
    progress: DecodeProgress,
}

impl DecoderHandle {
    /// Submits one batch of freshly marked tiles. Each request is tagged
    /// with the tile's full identity and target rectangle; a request for an
    /// identity that is already pending replaces it rather than queueing a
    /// second decode.
    pub fn submit_batch(
        &self,
        batch: &[Arc<TileNode>],
        view_state: &ViewState,
        options: DecodeOptions,
    ) {
        for node in batch {
            let id = node.id();
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
            let target = node.target_pixel_rect(view_state);

            self.lock_pending().insert(id, generation);
            let _ = self.tx.send(DecodeRequest::Tile {
                node: Arc::clone(node),
                target,
                zoom: view_state.zoom,
                generation,
                options,
            });
        }

        self.progress.increase(batch.len());
        debug!("submitted {} decode requests", batch.len());
    }

    /// Best-effort cancellation: forgets the pending submission so workers
    /// drop its result. A decode that already completed is unaffected; its
    /// late completion is discarded by the tile's in-flight check.
    pub fn stop_decoding(&self, id: TileId, reason: &str) {
        if self.lock_pending().remove(&id).is_some() {
            debug!("tile {id}: decode cancelled ({reason})");
        }
    }

    #[must_use]
    pub fn progress(&self) -> &DecodeProgress {
        &self.progress
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<TileId, u64>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Owns the decode worker threads; dropping it shuts them down and waits
/// for the request in progress on each to finish
pub struct DecodeCoordinator {
    handle: DecoderHandle,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl DecodeCoordinator {
    #[must_use]
    pub fn new(codec: Arc<dyn PageCodec>, num_workers: usize) -> Self {
        // Flume gives us the MPMC fan-out: every worker clones the receiver
        // and pulls from one shared request queue.
        let (tx, rx) = flume::unbounded();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..num_workers.max(1))
            .map(|_| {
                let codec = Arc::clone(&codec);
                let rx = rx.clone();
                let pending = Arc::clone(&pending);

                std::thread::spawn(move || {
                    decode_worker(codec.as_ref(), &rx, &pending);
                })
            })
            .collect();

        Self {
            handle: DecoderHandle {
                tx,
                pending,
                next_generation: Arc::new(AtomicU64::new(0)),
                progress: DecodeProgress::new(),
            },
            workers,
        }
    }

    #[must_use]
    pub fn handle(&self) -> DecoderHandle {
        self.handle.clone()
    }

    /// Asks every worker to exit after finishing its current request
    pub fn shutdown(&self) {
        for _ in 0..self.workers.len() {
            let _ = self.handle.tx.send(DecodeRequest::Shutdown);
        }
    }
}

impl Drop for DecodeCoordinator {
    fn drop(&mut self) {
        self.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Main worker loop, one per thread
fn decode_worker(codec: &dyn PageCodec, requests: &Receiver<DecodeRequest>, pending: &PendingMap) {
    for request in requests.iter() {
        match request {
            DecodeRequest::Tile {
                node,
                target,
                zoom,
                generation,
                options,
            } => handle_tile_request(codec, &node, target, zoom, generation, &options, pending),

            DecodeRequest::Shutdown => break,
        }
    }
}

fn handle_tile_request(
    codec: &dyn PageCodec,
    node: &Arc<TileNode>,
    target: PixelRect,
    zoom: f32,
    generation: u64,
    options: &DecodeOptions,
    pending: &PendingMap,
) {
    let id = node.id();

    // Skip work that was cancelled or replaced while queued.
    match check_pending(pending, id, generation, false) {
        Outcome::Current => {}
        Outcome::Superseded => {
            debug!("tile {id}: queued request superseded");
            return;
        }
        Outcome::Cancelled => {
            node.on_decoded(None, options);
            return;
        }
    }

    let result = codec.decode(id.page, target, zoom);

    // The completion is delivered at most once, and only if this submission
    // is still the current one for its identity.
    match check_pending(pending, id, generation, true) {
        Outcome::Current => match result {
            Ok(payload) => node.on_decoded(Some(payload), options),
            Err(err) => {
                warn!("tile {id}: decode failed: {err}");
                node.on_decoded(None, options);
            }
        },
        Outcome::Superseded => {
            debug!("tile {id}: completed result superseded, dropped");
        }
        Outcome::Cancelled => {
            debug!("tile {id}: completed after cancellation, dropped");
            node.on_decoded(None, options);
        }
    }
}

fn check_pending(pending: &PendingMap, id: TileId, generation: u64, remove: bool) -> Outcome {
    let mut pending = pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    match pending.get(&id) {
        Some(&current) if current == generation => {
            if remove {
                pending.remove(&id);
            }
            Outcome::Current
        }
        Some(_) => Outcome::Superseded,
        None => Outcome::Cancelled,
    }
}
