use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use presence_cam_common::frame::Frame;
use tokio::sync::watch;

/// Single-writer, many-reader holder of the most recent annotated frame.
///
/// Publishing swaps in a new `Arc<Frame>`; readers only clone the `Arc`
/// under the channel's lock, so neither side ever waits on JPEG encoding
/// or a slow connection, and a reader can never see a half-written frame.
pub struct FrameBroadcaster {
    tx: watch::Sender<Option<Arc<Frame>>>,
    published: AtomicU64,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Replace the visible frame. Succeeds whether or not anyone is reading.
    pub fn publish(&self, frame: Frame) {
        self.tx.send_replace(Some(Arc::new(frame)));
        self.published.fetch_add(1, Ordering::Release);
    }

    /// Most recently published frame, `None` until the first publish.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.tx.borrow().clone()
    }

    /// Number of frames published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Receiver notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.tx.subscribe()
    }
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
