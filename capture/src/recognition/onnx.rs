//! ONNX Runtime backends: an UltraFace-style detector and an ArcFace-style
//! embedder.

use std::fmt::Display;
use std::path::Path;
use std::sync::Mutex;

use image::imageops::FilterType;
use image::RgbImage;
use presence_cam_common::frame::BoundingBox;
use tracing::info;

use super::classifier::l2_normalize;
use super::{Detection, FaceDetector, FaceEmbedder, RecognitionError};

const DETECTOR_WIDTH: u32 = 320;
const DETECTOR_HEIGHT: u32 = 240;
const DETECTOR_MEAN: f32 = 127.0;
const DETECTOR_STD: f32 = 128.0;
const NMS_IOU_THRESH: f32 = 0.3;
/// Candidates below this never reach NMS; the recognizer applies the
/// configured threshold afterwards.
const CANDIDATE_THRESH: f32 = 0.3;

const EMBEDDER_SIZE: u32 = 112;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;

fn load_session(path: &Path) -> Result<ort::session::Session, RecognitionError> {
    let load_err = |e: &dyn Display| RecognitionError::ModelLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    if !path.exists() {
        return Err(load_err(&"file not found"));
    }
    let intra_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let session = ort::session::Session::builder()
        .map_err(|e| load_err(&e))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| load_err(&e))?
        .with_intra_threads(intra_threads)
        .map_err(|e| load_err(&e))?
        .commit_from_file(path)
        .map_err(|e| load_err(&e))?;
    info!(model = path.display().to_string(), "ONNX model loaded");
    Ok(session)
}

fn inference_err(e: impl Display) -> RecognitionError {
    RecognitionError::Inference(e.to_string())
}

/// Resize to `width` x `height` and lay out as NCHW float32 with
/// `(v - mean) / std` normalisation.
fn to_tensor(image: &RgbImage, width: u32, height: u32, mean: f32, std: f32) -> ndarray::Array4<f32> {
    let resized = image::imageops::resize(image, width, height, FilterType::Triangle);
    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - mean) / std;
        }
    }
    tensor
}

pub struct OnnxFaceDetector {
    session: Mutex<ort::session::Session>,
}

impl OnnxFaceDetector {
    pub fn load(path: &Path) -> Result<Self, RecognitionError> {
        Ok(Self {
            session: Mutex::new(load_session(path)?),
        })
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, RecognitionError> {
        let (fw, fh) = (image.width() as f32, image.height() as f32);
        let input = to_tensor(image, DETECTOR_WIDTH, DETECTOR_HEIGHT, DETECTOR_MEAN, DETECTOR_STD);
        let input = ort::value::Tensor::from_array(input).map_err(inference_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| RecognitionError::Inference(format!("lock poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![input]).map_err(inference_err)?;
        if outputs.len() < 2 {
            return Err(RecognitionError::Inference(
                "detector must output scores and boxes".into(),
            ));
        }
        let scores = outputs[0].try_extract_array::<f32>().map_err(inference_err)?;
        let boxes = outputs[1].try_extract_array::<f32>().map_err(inference_err)?;
        let scores = scores
            .as_slice()
            .ok_or_else(|| inference_err("non-contiguous scores tensor"))?;
        let boxes = boxes
            .as_slice()
            .ok_or_else(|| inference_err("non-contiguous boxes tensor"))?;

        // scores: [1, N, 2] (background, face); boxes: [1, N, 4] normalised corners.
        let candidates = (scores.len() / 2).min(boxes.len() / 4);
        let mut raw: Vec<RawBox> = (0..candidates)
            .filter(|&i| scores[i * 2 + 1] > CANDIDATE_THRESH)
            .map(|i| RawBox {
                x1: boxes[i * 4] * fw,
                y1: boxes[i * 4 + 1] * fh,
                x2: boxes[i * 4 + 2] * fw,
                y2: boxes[i * 4 + 3] * fh,
                score: scores[i * 2 + 1],
            })
            .collect();

        Ok(nms(&mut raw, NMS_IOU_THRESH)
            .into_iter()
            .filter_map(|b| b.to_detection())
            .collect())
    }
}

pub struct OnnxFaceEmbedder {
    session: Mutex<ort::session::Session>,
}

impl OnnxFaceEmbedder {
    pub fn load(path: &Path) -> Result<Self, RecognitionError> {
        Ok(Self {
            session: Mutex::new(load_session(path)?),
        })
    }
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn embed(&self, face: &RgbImage) -> Result<Vec<f32>, RecognitionError> {
        let input = to_tensor(face, EMBEDDER_SIZE, EMBEDDER_SIZE, EMBEDDER_MEAN, EMBEDDER_STD);
        let input = ort::value::Tensor::from_array(input).map_err(inference_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| RecognitionError::Inference(format!("lock poisoned: {e}")))?;
        let outputs = session.run(ort::inputs![input]).map_err(inference_err)?;
        if outputs.len() == 0 {
            return Err(inference_err("embedder produced no outputs"));
        }
        let embedding = outputs[0].try_extract_array::<f32>().map_err(inference_err)?;
        let mut embedding: Vec<f32> = embedding.iter().copied().collect();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

#[derive(Debug, Clone, Copy)]
struct RawBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl RawBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &RawBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    fn to_detection(self) -> Option<Detection> {
        let x1 = self.x1.max(0.0);
        let y1 = self.y1.max(0.0);
        let width = (self.x2 - x1).round();
        let height = (self.y2 - y1).round();
        if width < 1.0 || height < 1.0 {
            return None;
        }
        Some(Detection {
            bbox: BoundingBox::new(x1 as u32, y1 as u32, width as u32, height as u32),
            confidence: self.score,
        })
    }
}

fn nms(boxes: &mut [RawBox], iou_thresh: f32) -> Vec<RawBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && boxes[i].iou(&boxes[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> RawBox {
        RawBox { x1, y1, x2, y2, score }
    }

    #[test]
    fn nms_keeps_best_of_overlapping_boxes() {
        let mut boxes = vec![
            raw(0.0, 0.0, 10.0, 10.0, 0.6),
            raw(1.0, 1.0, 11.0, 11.0, 0.9),
            raw(50.0, 50.0, 60.0, 60.0, 0.7),
        ];
        let kept = nms(&mut boxes, NMS_IOU_THRESH);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn detection_is_clamped_to_origin() {
        let det = raw(-5.0, -2.0, 30.0, 40.0, 0.8).to_detection().unwrap();
        assert_eq!(det.bbox, BoundingBox::new(0, 0, 30, 40));
        assert!(raw(5.0, 5.0, 5.2, 9.0, 0.8).to_detection().is_none());
    }

    #[test]
    fn tensor_layout_and_normalisation() {
        let image = RgbImage::from_pixel(8, 4, image::Rgb([255, 127, 0]));
        let tensor = to_tensor(&image, 4, 2, EMBEDDER_MEAN, EMBEDDER_STD);
        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        assert!((tensor[[0, 0, 1, 3]] - 1.0).abs() < 1e-3);
        assert!((tensor[[0, 2, 0, 0]] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn missing_model_is_load_error() {
        assert!(matches!(
            OnnxFaceDetector::load(Path::new("/nonexistent/detector.onnx")),
            Err(RecognitionError::ModelLoad { .. })
        ));
    }
}
