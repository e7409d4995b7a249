use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use presence_cam_common::config::CaptureConfig;
use presence_cam_common::frame::{Frame, Identity};
use presence_cam_presence::{PresenceChange, PresenceDb, PresenceError, PresenceTracker};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broadcaster::FrameBroadcaster;
use crate::camera::{resize_to_width, CameraError, CameraSource};
use crate::recognition::{annotate, Recognizer};

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub frame_width: u32,
    /// Pause after a failed camera read before trying again.
    pub retry_delay: Duration,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            frame_width: config.frame_width,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// What one capture cycle did.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub seq: u64,
    pub identities: Vec<Identity>,
    pub changes: Vec<PresenceChange>,
    /// Identities the tracker did not know.
    pub rejected: usize,
}

/// Drives camera → recognition → presence → broadcast, one frame per cycle.
///
/// Runs on its own thread; nothing downstream of `publish` can slow it.
pub struct CaptureLoop<C: CameraSource> {
    camera: C,
    recognizer: Arc<Recognizer>,
    tracker: Arc<PresenceTracker>,
    store: Option<PresenceDb>,
    frames: Arc<FrameBroadcaster>,
    settings: CaptureSettings,
    next_seq: u64,
}

impl<C: CameraSource> CaptureLoop<C> {
    pub fn new(
        camera: C,
        recognizer: Arc<Recognizer>,
        tracker: Arc<PresenceTracker>,
        store: Option<PresenceDb>,
        frames: Arc<FrameBroadcaster>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            camera,
            recognizer,
            tracker,
            store,
            frames,
            settings,
            next_seq: 1,
        }
    }

    /// Run a single cycle. Errors are scoped to the camera read; everything
    /// after it degrades and logs instead of failing.
    pub fn run_once(&mut self) -> Result<CycleOutcome, CameraError> {
        let image = self.camera.read_frame()?;
        let image = resize_to_width(image, self.settings.frame_width);
        let seq = self.next_seq;
        self.next_seq += 1;
        let frame = Frame::new(image, Utc::now(), seq);

        let (mut annotated, identities) = self.recognizer.recognize(&frame);
        annotate::stamp_time(&mut annotated.image, annotated.captured_at);

        let mut changes = Vec::new();
        let mut rejected = 0;
        for identity in &identities {
            match self.tracker.record(&identity.name, frame.captured_at) {
                Ok(applied) => changes.extend(applied),
                Err(PresenceError::UnknownIdentity(name)) => {
                    warn!(seq, person = name, "dropping detection of unregistered person");
                    rejected += 1;
                }
            }
        }
        self.persist(&changes);
        changes.extend(self.sweep_idle(frame.captured_at));

        self.frames.publish(annotated);
        debug!(
            seq,
            faces = identities.len(),
            changes = changes.len(),
            "capture cycle complete"
        );

        Ok(CycleOutcome {
            seq,
            identities,
            changes,
            rejected,
        })
    }

    /// Close intervals idle past the session timeout at `now` and mirror the
    /// closes to the store. Runs whether or not the camera delivered.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<PresenceChange> {
        let closed = self.tracker.close_idle(now);
        self.persist(&closed);
        closed
    }

    fn persist(&self, changes: &[PresenceChange]) {
        let Some(store) = &self.store else {
            return;
        };
        for change in changes {
            if let Err(e) = store.apply(change) {
                error!(person = change.person(), error = %e, "failed to persist presence change");
            }
        }
    }

    /// Loop until `shutdown` flips to true. A failed camera read is logged
    /// and retried after `retry_delay`; idle intervals keep closing while the
    /// camera is down.
    pub fn run(mut self, shutdown: watch::Receiver<bool>) {
        info!(
            frame_width = self.settings.frame_width,
            fps = self.camera.nominal_fps(),
            "capture loop started"
        );
        let mut failures: u64 = 0;
        while !*shutdown.borrow() {
            match self.run_once() {
                Ok(_) => {
                    if failures > 0 {
                        info!(failures, "camera recovered");
                        failures = 0;
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 || failures % 50 == 0 {
                        warn!(error = %e, failures, "camera read failed");
                    }
                    self.sweep_idle(Utc::now());
                    std::thread::sleep(self.settings.retry_delay);
                }
            }
        }
        info!(last_seq = self.next_seq - 1, "capture loop stopped");
    }
}

impl<C: CameraSource + 'static> CaptureLoop<C> {
    /// Start the loop on a dedicated thread named `capture`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run(shutdown))
    }
}
