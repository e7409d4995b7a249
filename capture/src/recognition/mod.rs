//! Face recognition adapter.
//!
//! Detection and embedding are external models behind [`FaceDetector`] and
//! [`FaceEmbedder`]; classification is a labelled embedding gallery
//! ([`FaceClassifier`]) that can be rebuilt at runtime by [`train`].

pub mod annotate;
pub mod classifier;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod train;

use std::sync::{Arc, RwLock};

use image::RgbImage;
use presence_cam_common::config::RecognitionConfig;
use presence_cam_common::frame::{BoundingBox, Frame, Identity};
use tracing::{debug, warn};

pub use classifier::FaceClassifier;

/// One face box reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Localises faces in an image.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, RecognitionError>;
}

/// Maps a face crop to a fixed-length embedding vector.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, face: &RgbImage) -> Result<Vec<f32>, RecognitionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },
    #[error("no recognition backend compiled in (rebuild with `--features onnx`)")]
    BackendUnavailable,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("embedding has {got} dimensions, classifier expects {expected}")]
    DimensionMismatch { got: usize, expected: usize },
}

/// Thresholds a detection must pass before it is classified.
#[derive(Debug, Clone, Copy)]
pub struct RecognitionSettings {
    pub min_confidence: f32,
    pub min_face_size: u32,
}

impl From<&RecognitionConfig> for RecognitionSettings {
    fn from(config: &RecognitionConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            min_face_size: config.min_face_size,
        }
    }
}

/// A face that passed the thresholds, with the classifier's verdict.
#[derive(Debug, Clone)]
pub struct RecognizedFace {
    pub bbox: BoundingBox,
    pub identity: Identity,
}

pub struct Recognizer {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    classifier: RwLock<Arc<FaceClassifier>>,
    settings: RecognitionSettings,
}

impl Recognizer {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        classifier: FaceClassifier,
        settings: RecognitionSettings,
    ) -> Self {
        Self {
            detector,
            embedder,
            classifier: RwLock::new(Arc::new(classifier)),
            settings,
        }
    }

    /// Annotate `frame` (a box and a `name: probability%` label per face)
    /// and list the identities found in it.
    ///
    /// Never fails: a recognition error yields the unannotated frame and no
    /// identities. Duplicate names within one frame are passed through.
    pub fn recognize(&self, frame: &Frame) -> (Frame, Vec<Identity>) {
        match self.recognize_faces(&frame.image) {
            Ok(faces) if faces.is_empty() => (frame.clone(), Vec::new()),
            Ok(faces) => {
                let mut image = frame.image.clone();
                for face in &faces {
                    annotate::draw_box(&mut image, face.bbox, annotate::BOX_COLOR, 2);
                    let label = format!(
                        "{}: {:.2}%",
                        face.identity.name,
                        face.identity.confidence * 100.0
                    );
                    annotate::label_face(&mut image, face.bbox, &label, annotate::BOX_COLOR);
                }
                let identities = faces.into_iter().map(|f| f.identity).collect();
                (frame.with_image(image), identities)
            }
            Err(e) => {
                warn!(seq = frame.seq, error = %e, "recognition failed, publishing frame unannotated");
                (frame.clone(), Vec::new())
            }
        }
    }

    /// Detect, filter, embed and classify every face in `image`.
    pub fn recognize_faces(&self, image: &RgbImage) -> Result<Vec<RecognizedFace>, RecognitionError> {
        // One classifier snapshot per call, even if a retrain swaps it meanwhile.
        let classifier = self.classifier();
        let mut faces = Vec::new();
        for bbox in self.accepted_faces(image)? {
            let embedding = self.embed_region(image, bbox)?;
            let Some((name, confidence)) = classifier.predict(&embedding)? else {
                continue;
            };
            debug!(name, confidence, x = bbox.x, y = bbox.y, "face classified");
            faces.push(RecognizedFace {
                bbox,
                identity: Identity::new(name, confidence),
            });
        }
        Ok(faces)
    }

    /// Boxes of detections above the confidence threshold and at least
    /// `min_face_size` pixels in both dimensions, clipped to the image.
    pub fn accepted_faces(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, RecognitionError> {
        let detections = self.detector.detect(image)?;
        Ok(detections
            .into_iter()
            .filter(|d| d.confidence > self.settings.min_confidence)
            .filter_map(|d| d.bbox.clip(image.width(), image.height()))
            .filter(|b| {
                b.width >= self.settings.min_face_size && b.height >= self.settings.min_face_size
            })
            .collect())
    }

    pub fn embed_region(&self, image: &RgbImage, bbox: BoundingBox) -> Result<Vec<f32>, RecognitionError> {
        let face = image::imageops::crop_imm(image, bbox.x, bbox.y, bbox.width, bbox.height).to_image();
        self.embedder.embed(&face)
    }

    pub fn classifier(&self) -> Arc<FaceClassifier> {
        Arc::clone(&self.classifier.read().expect("classifier lock poisoned"))
    }

    /// Replace the classifier. In-flight calls finish on the old snapshot.
    pub fn swap_classifier(&self, classifier: FaceClassifier) {
        let classifier = Arc::new(classifier);
        *self.classifier.write().expect("classifier lock poisoned") = classifier;
    }
}

/// Load the detector and embedder named in the config.
#[cfg(feature = "onnx")]
pub fn load_backends(
    config: &RecognitionConfig,
) -> Result<(Arc<dyn FaceDetector>, Arc<dyn FaceEmbedder>), RecognitionError> {
    let detector = onnx::OnnxFaceDetector::load(&config.detector_model)?;
    let embedder = onnx::OnnxFaceEmbedder::load(&config.embedder_model)?;
    Ok((Arc::new(detector), Arc::new(embedder)))
}

#[cfg(not(feature = "onnx"))]
pub fn load_backends(
    _config: &RecognitionConfig,
) -> Result<(Arc<dyn FaceDetector>, Arc<dyn FaceEmbedder>), RecognitionError> {
    Err(RecognitionError::BackendUnavailable)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Detector returning a fixed list of detections.
    pub struct FixedDetector(Result<Vec<Detection>, String>);

    impl FixedDetector {
        pub fn new(detections: Vec<Detection>) -> Self {
            Self(Ok(detections))
        }

        pub fn failing(reason: &str) -> Self {
            Self(Err(reason.to_string()))
        }
    }

    impl FaceDetector for FixedDetector {
        fn detect(&self, _image: &RgbImage) -> Result<Vec<Detection>, RecognitionError> {
            self.0.clone().map_err(RecognitionError::Inference)
        }
    }

    /// Embeds a crop as its mean colour, so tests steer identities by
    /// painting face regions.
    pub struct MeanColorEmbedder;

    impl FaceEmbedder for MeanColorEmbedder {
        fn embed(&self, face: &RgbImage) -> Result<Vec<f32>, RecognitionError> {
            let n = (face.width() * face.height()).max(1) as f32;
            let mut sum = [0f32; 3];
            for p in face.pixels() {
                for c in 0..3 {
                    sum[c] += p.0[c] as f32;
                }
            }
            Ok(sum.iter().map(|s| s / n).collect())
        }
    }

    pub fn detection(x: u32, y: u32, size: u32, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x, y, size, size),
            confidence,
        }
    }

    /// Classifier that knows "alice" as red and "bob" as blue.
    pub fn red_blue_classifier() -> FaceClassifier {
        use classifier::LabelledEmbedding;
        FaceClassifier::from_samples(&[
            LabelledEmbedding::new("alice", vec![255.0, 0.0, 0.0]),
            LabelledEmbedding::new("bob", vec![0.0, 0.0, 255.0]),
        ])
        .unwrap()
    }

    pub fn recognizer(detector: FixedDetector) -> Recognizer {
        Recognizer::new(
            Arc::new(detector),
            Arc::new(MeanColorEmbedder),
            red_blue_classifier(),
            RecognitionSettings {
                min_confidence: 0.5,
                min_face_size: 20,
            },
        )
    }

    /// 200x200 grey canvas with a red square at (10,10) and a blue one at (100,100).
    pub fn two_face_image() -> RgbImage {
        let mut image = RgbImage::from_pixel(200, 200, image::Rgb([128, 128, 128]));
        for (x0, color) in [(10u32, [255u8, 0, 0]), (100, [0, 0, 255])] {
            for y in x0..x0 + 40 {
                for x in x0..x0 + 40 {
                    image.put_pixel(x, y, image::Rgb(color));
                }
            }
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::Utc;

    fn frame(image: RgbImage) -> Frame {
        Frame::new(image, Utc::now(), 1)
    }

    #[test]
    fn identifies_each_accepted_face() {
        let recognizer = recognizer(FixedDetector::new(vec![
            detection(10, 10, 40, 0.9),
            detection(100, 100, 40, 0.8),
        ]));
        let input = frame(two_face_image());
        let (annotated, identities) = recognizer.recognize(&input);

        let names: Vec<_> = identities.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert!(identities.iter().all(|i| i.confidence > 0.5));
        assert_ne!(annotated.image, input.image, "boxes should be drawn");
        assert_eq!(annotated.seq, input.seq);
    }

    #[test]
    fn faces_are_labelled_with_name_and_probability() {
        let recognizer = recognizer(FixedDetector::new(vec![detection(100, 100, 40, 0.9)]));
        let input = frame(two_face_image());
        let (annotated, _) = recognizer.recognize(&input);

        // The label strip sits above bob's box, which starts at y=100.
        let changed = (80..98)
            .flat_map(|y| (100..200).map(move |x| (x, y)))
            .filter(|&(x, y)| annotated.image.get_pixel(x, y) != input.image.get_pixel(x, y))
            .count();
        assert!(changed > 0, "label should be drawn above the box");

        // Same box, different classifier verdict: a different label.
        recognizer.swap_classifier(
            FaceClassifier::from_samples(&[classifier::LabelledEmbedding::new(
                "carol",
                vec![0.0, 0.0, 250.0],
            )])
            .unwrap(),
        );
        let (relabelled, _) = recognizer.recognize(&input);
        assert_ne!(relabelled.image, annotated.image);
    }

    #[test]
    fn small_boxes_are_dropped_even_when_confident() {
        // 10x10 box squarely on the red region: classifier would say alice.
        let recognizer = recognizer(FixedDetector::new(vec![detection(15, 15, 10, 0.99)]));
        let input = frame(two_face_image());
        let (annotated, identities) = recognizer.recognize(&input);
        assert!(identities.is_empty());
        assert_eq!(annotated.image, input.image);
    }

    #[test]
    fn weak_detections_are_dropped() {
        let recognizer = recognizer(FixedDetector::new(vec![detection(10, 10, 40, 0.5)]));
        let (_, identities) = recognizer.recognize(&frame(two_face_image()));
        assert!(identities.is_empty());
    }

    #[test]
    fn box_clipped_below_minimum_is_dropped() {
        // Only 15 px of the box lies inside the 200 px frame.
        let recognizer = recognizer(FixedDetector::new(vec![detection(185, 185, 40, 0.9)]));
        let (_, identities) = recognizer.recognize(&frame(two_face_image()));
        assert!(identities.is_empty());
    }

    #[test]
    fn duplicate_names_pass_through() {
        let recognizer = recognizer(FixedDetector::new(vec![
            detection(10, 10, 40, 0.9),
            detection(12, 12, 30, 0.9),
        ]));
        let (_, identities) = recognizer.recognize(&frame(two_face_image()));
        assert_eq!(identities.len(), 2);
        assert!(identities.iter().all(|i| i.name == "alice"));
    }

    #[test]
    fn detector_failure_degrades_to_no_identities() {
        let recognizer = recognizer(FixedDetector::failing("bad tensor"));
        let input = frame(two_face_image());
        let (annotated, identities) = recognizer.recognize(&input);
        assert!(identities.is_empty());
        assert_eq!(annotated.image, input.image);
    }

    #[test]
    fn swapped_classifier_is_used_by_later_calls() {
        use classifier::LabelledEmbedding;
        let recognizer = recognizer(FixedDetector::new(vec![detection(10, 10, 40, 0.9)]));
        let before = recognizer.classifier();

        recognizer.swap_classifier(
            FaceClassifier::from_samples(&[LabelledEmbedding::new("carol", vec![250.0, 5.0, 5.0])])
                .unwrap(),
        );
        let (_, identities) = recognizer.recognize(&frame(two_face_image()));
        assert_eq!(identities[0].name, "carol");
        // The old snapshot is still usable by whoever held it.
        assert_eq!(before.labels(), &["alice".to_string(), "bob".to_string()]);
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn no_backend_without_onnx_feature() {
        let config = RecognitionConfig {
            detector_model: "d.onnx".into(),
            embedder_model: "e.onnx".into(),
            classifier_path: "c.json".into(),
            corpus_dir: "dataset".into(),
            min_confidence: 0.5,
            min_face_size: 20,
        };
        let err = load_backends(&config).err().unwrap();
        assert!(matches!(err, RecognitionError::BackendUnavailable));
        assert!(err.to_string().contains("--features onnx"));
    }
}
