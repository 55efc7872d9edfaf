//! Render-thread task queue and view-layer notifications
//!
//! Decode workers never mutate shared tile state directly; they post a
//! [`RenderTask`] that the designated render thread executes when it drains
//! its inbox. The view layer subscribes to [`TileEvent`]s to schedule
//! repaints.

use std::sync::Arc;

use flume::{Receiver, Sender};

use crate::bitmaps::BitmapSet;
use crate::decode::TileId;
use crate::geometry::{PixelRect, RectF};
use crate::node::TileNode;

/// Notifications emitted to the view layer
#[derive(Clone, Debug)]
pub enum TileEvent {
    /// A tile's bitmap became visible after a successful swap; the view
    /// should schedule a repaint of the affected region
    ChildLoaded { id: TileId, bounds: PixelRect },

    /// A committed root crop changed the page's effective dimensions
    AspectRatioChanged {
        page: usize,
        width: f32,
        height: f32,
    },

    /// The codec reported a detected content region for a page
    CropDetected { page: usize, crop: RectF },
}

/// State mutation deferred to the render thread
pub enum RenderTask {
    /// Make a decoded bitmap visible and clear the tile's in-flight flag
    Install {
        node: Arc<TileNode>,
        set: Arc<BitmapSet>,
        bounds: PixelRect,
        detected_crop: Option<RectF>,
    },

    /// Clear the in-flight flag without installing anything (failed or
    /// empty decode)
    ClearDecoding { node: Arc<TileNode> },
}

impl RenderTask {
    /// Runs this task. Must only be called from the render thread.
    pub fn execute(self) {
        match self {
            Self::Install {
                node,
                set,
                bounds,
                detected_crop,
            } => node.install_bitmap(set, bounds, detected_crop),
            Self::ClearDecoding { node } => node.finish_decode(),
        }
    }
}

/// Producer half of the render-thread queue; cloned into every worker path
#[derive(Clone)]
pub struct RenderQueue {
    tx: Sender<RenderTask>,
}

impl RenderQueue {
    pub fn post(&self, task: RenderTask) {
        // A closed inbox means the render thread is gone; tasks are then
        // dropped, which releases their payloads through the usual paths.
        let _ = self.tx.send(task);
    }
}

/// Consumer half of the render-thread queue, drained by exactly one thread
pub struct RenderInbox {
    rx: Receiver<RenderTask>,
}

impl RenderInbox {
    /// Executes every queued task; returns how many ran
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        for task in self.rx.try_iter() {
            task.execute();
            ran += 1;
        }
        ran
    }

    /// Blocks up to `timeout` for one task and executes it; returns whether
    /// a task ran. For embedders that park the render thread between frames.
    pub fn run_one(&self, timeout: std::time::Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task.execute();
                true
            }
            Err(_) => false,
        }
    }

    /// Whether tasks are waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Creates the render-thread queue pair
#[must_use]
pub fn render_channel() -> (RenderQueue, RenderInbox) {
    let (tx, rx) = flume::unbounded();
    (RenderQueue { tx }, RenderInbox { rx })
}

/// Creates the view-layer event channel
#[must_use]
pub fn event_channel() -> (Sender<TileEvent>, Receiver<TileEvent>) {
    flume::unbounded()
}
