use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use image::{ImageFormat, RgbImage};
use presence_cam_common::mjpeg::{MjpegError, MultipartParser};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraError, CameraSource};

/// Largest multipart part accepted from the camera.
const MAX_PART_BYTES: usize = 8 * 1024 * 1024;

type JpegSlot = Option<Arc<[u8]>>;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("malformed MJPEG stream: {0}")]
    Multipart(#[from] MjpegError),
    #[error("frame receiver dropped")]
    Closed,
}

/// Camera reached over HTTP as an MJPEG (`multipart/x-mixed-replace`)
/// stream.
///
/// A tokio task keeps the connection alive, reconnecting with exponential
/// backoff, and overwrites a single latest-part slot. Parts the capture
/// thread did not get to are replaced, never queued, so `read_frame` always
/// decodes the newest part the camera sent.
///
/// `read_frame` blocks on `runtime`; call it from a plain thread (or
/// `spawn_blocking`) on a multi-threaded runtime.
pub struct MjpegCamera {
    latest: watch::Receiver<JpegSlot>,
    runtime: Handle,
    read_timeout: Duration,
    fps: f64,
    reader: JoinHandle<()>,
}

impl MjpegCamera {
    pub fn connect(runtime: &Handle, url: String, fps: f64, read_timeout: Duration) -> Self {
        let (tx, rx) = watch::channel(None);
        let reader = runtime.spawn(async move {
            run_reader(&url, tx).await;
        });
        Self {
            latest: rx,
            runtime: runtime.clone(),
            read_timeout,
            fps,
            reader,
        }
    }
}

impl CameraSource for MjpegCamera {
    /// Wait for a part newer than the last one returned, then decode it.
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        let timeout = self.read_timeout;
        let latest = &mut self.latest;
        let changed = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, latest.changed()).await });
        match changed {
            Err(_) => return Err(CameraError::Timeout(timeout)),
            Ok(Err(_)) => return Err(CameraError::Disconnected),
            Ok(Ok(())) => {}
        }
        let jpeg = self.latest.borrow_and_update().clone();
        match jpeg {
            Some(jpeg) => decode_jpeg(&jpeg),
            None => Err(CameraError::Disconnected),
        }
    }

    fn nominal_fps(&self) -> Option<f64> {
        Some(self.fps)
    }
}

impl Drop for MjpegCamera {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub fn decode_jpeg(jpeg: &[u8]) -> Result<RgbImage, CameraError> {
    image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| CameraError::Decode(e.to_string()))
}

/// Keep the MJPEG stream connected until the camera handle is dropped.
async fn run_reader(stream_url: &str, tx: watch::Sender<JpegSlot>) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, &tx).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(StreamError::Closed) => {
                debug!("camera handle dropped, stopping MJPEG reader");
                return;
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(url: &str, tx: &watch::Sender<JpegSlot>) -> Result<(), StreamError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(StreamError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(StreamError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(StreamError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new(MAX_PART_BYTES);
    let mut received: u64 = 0;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(StreamError::HttpStream)?;
        let parts = match parser.push(&chunk) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "discarding malformed MJPEG data");
                continue;
            }
        };
        if tx.is_closed() {
            return Err(StreamError::Closed);
        }
        // Only the last part of a chunk can be the newest.
        if let Some(jpeg) = parts.into_iter().last() {
            received += 1;
            if received % 500 == 1 {
                debug!(received, bytes = jpeg.len(), "camera part received");
            }
            tx.send_replace(Some(jpeg.into()));
        }
    }

    Ok(())
}
