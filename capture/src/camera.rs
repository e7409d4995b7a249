use std::time::Duration;

use image::imageops::FilterType;
use image::RgbImage;

/// A capture device yielding frames one at a time.
///
/// `read_frame` blocks until a frame is available or the attempt fails;
/// every failure is scoped to that single attempt.
pub trait CameraSource: Send {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;

    /// Frame rate the device advertises, if it advertises one.
    fn nominal_fps(&self) -> Option<f64> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("camera stream disconnected")]
    Disconnected,
    #[error("no frame from camera within {0:?}")]
    Timeout(Duration),
    #[error("camera source exhausted")]
    Exhausted,
    #[error("failed to decode camera frame: {0}")]
    Decode(String),
}

/// Resize to `width` keeping the aspect ratio. Images already at `width`
/// are returned untouched.
pub fn resize_to_width(image: RgbImage, width: u32) -> RgbImage {
    if image.width() == width || image.width() == 0 {
        return image;
    }
    let height = ((image.height() as u64 * width as u64) / image.width() as u64).max(1) as u32;
    image::imageops::resize(&image, width, height, FilterType::Triangle)
}
