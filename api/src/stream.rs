use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use presence_cam_capture::FrameBroadcaster;
use presence_cam_common::frame::Frame;
use presence_cam_common::mjpeg::encode_part;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Decrements the shared viewer count when the stream goes away.
struct ViewerGuard(Arc<AtomicUsize>);

impl ViewerGuard {
    fn register(viewers: &Arc<AtomicUsize>) -> Self {
        let now = viewers.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(viewers = now, "viewer connected");
        Self(Arc::clone(viewers))
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(viewers = now, "viewer disconnected");
    }
}

/// Per-viewer MJPEG producer.
///
/// Samples the broadcaster on its own ticker and turns the latest frame
/// into a multipart part. A viewer that stops reading only stalls its own
/// stream; the capture side never waits on it.
pub struct StreamEncoder {
    frames: Arc<FrameBroadcaster>,
    shutdown: watch::Receiver<bool>,
    ticker: Interval,
    quality: u8,
    /// Last encoded part and the seq it was encoded from.
    cached: Option<(u64, Bytes)>,
    _viewer: ViewerGuard,
}

impl StreamEncoder {
    pub fn new(
        frames: Arc<FrameBroadcaster>,
        shutdown: watch::Receiver<bool>,
        fps: f64,
        quality: u8,
        viewers: &Arc<AtomicUsize>,
    ) -> Self {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            frames,
            shutdown,
            ticker,
            quality,
            cached: None,
            _viewer: ViewerGuard::register(viewers),
        }
    }

    /// Next multipart part, or `None` once shutdown is signalled.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return None;
                    }
                    continue;
                }
                _ = self.ticker.tick() => {}
            }

            let frame = match self.frames.latest() {
                Some(frame) => frame,
                None => match self.wait_for_first_frame().await {
                    Some(frame) => frame,
                    None => return None,
                },
            };

            if let Some(part) = self.encode(frame).await {
                return Some(part);
            }
        }
    }

    /// Block until something is published, without polling.
    async fn wait_for_first_frame(&mut self) -> Option<Arc<Frame>> {
        let mut published = self.frames.subscribe();
        tokio::select! {
            result = published.wait_for(Option::is_some) => {
                result.ok().and_then(|frame| frame.clone())
            }
            _ = self.shutdown.wait_for(|stop| *stop) => None,
        }
    }

    async fn encode(&mut self, frame: Arc<Frame>) -> Option<Bytes> {
        if let Some((seq, part)) = &self.cached {
            if *seq == frame.seq {
                return Some(part.clone());
            }
        }

        let seq = frame.seq;
        let quality = self.quality;
        match tokio::task::spawn_blocking(move || frame.encode_jpeg(quality)).await {
            Ok(Ok(jpeg)) => {
                let part = encode_part(&jpeg);
                self.cached = Some((seq, part.clone()));
                Some(part)
            }
            Ok(Err(e)) => {
                warn!(seq, error = %e, "failed to encode frame, skipping");
                None
            }
            Err(e) => {
                warn!(seq, error = %e, "encode task failed, skipping");
                None
            }
        }
    }

    /// Body stream for `axum::body::Body::from_stream`. Ends on shutdown;
    /// dropping it (client gone) releases the viewer slot.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
        futures_util::stream::unfold(self, |mut encoder| async move {
            let part = encoder.next_part().await?;
            Some((Ok(part), encoder))
        })
    }
}
