use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;

/// A captured camera frame with timestamp metadata.
///
/// Frames are shared as `Arc<Frame>` once published and are never mutated
/// afterwards; annotation produces a new frame with the same `seq` and
/// `captured_at`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
    pub seq: u64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: DateTime<Utc>, seq: u64) -> Self {
        Self {
            image,
            captured_at,
            seq,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Same capture metadata, different pixels.
    pub fn with_image(&self, image: RgbImage) -> Self {
        Self {
            image,
            captured_at: self.captured_at,
            seq: self.seq,
        }
    }

    /// Encode the pixel buffer as a baseline JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        if self.image.width() == 0 || self.image.height() == 0 {
            return Err(FrameError::Empty);
        }
        let mut buf = Vec::with_capacity((self.image.width() * self.image.height()) as usize / 4);
        JpegEncoder::new_with_quality(&mut buf, quality)
            .encode_image(&self.image)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(buf)
    }
}

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clip the box to a `frame_width` x `frame_height` image. Returns `None`
    /// when nothing of the box lies inside the frame.
    pub fn clip(&self, frame_width: u32, frame_height: u32) -> Option<Self> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self::new(self.x, self.y, width, height))
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A recognised person in one frame: stable key plus classifier confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub name: String,
    pub confidence: f32,
}

impl Identity {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has no pixels")]
    Empty,
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
}
