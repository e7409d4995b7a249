use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::RecognitionError;

/// Sharpness of the softmax over cosine similarities. Similarities live in
/// [-1, 1], so without scaling every class would get a similar probability.
const SOFTMAX_SCALE: f32 = 10.0;

/// One training sample as persisted in the gallery file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelledEmbedding {
    pub label: String,
    pub embedding: Vec<f32>,
}

impl LabelledEmbedding {
    pub fn new(label: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            label: label.into(),
            embedding,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GalleryFile {
    samples: Vec<LabelledEmbedding>,
}

/// Nearest-centroid classifier over L2-normalised face embeddings.
#[derive(Debug, Clone, Default)]
pub struct FaceClassifier {
    labels: Vec<String>,
    centroids: Vec<Vec<f32>>,
}

impl FaceClassifier {
    /// Build one centroid per label. All embeddings must share a dimension.
    pub fn from_samples(samples: &[LabelledEmbedding]) -> Result<Self, RecognitionError> {
        let mut sums: BTreeMap<&str, Vec<f32>> = BTreeMap::new();
        let mut dim = None;
        for sample in samples {
            let expected = *dim.get_or_insert(sample.embedding.len());
            if sample.embedding.len() != expected || expected == 0 {
                return Err(RecognitionError::DimensionMismatch {
                    got: sample.embedding.len(),
                    expected,
                });
            }
            let mut normalized = sample.embedding.clone();
            l2_normalize(&mut normalized);
            let sum = sums
                .entry(sample.label.as_str())
                .or_insert_with(|| vec![0.0; expected]);
            for (acc, v) in sum.iter_mut().zip(&normalized) {
                *acc += v;
            }
        }

        let (labels, centroids) = sums
            .into_iter()
            .map(|(label, mut centroid)| {
                l2_normalize(&mut centroid);
                (label.to_string(), centroid)
            })
            .unzip();
        Ok(Self { labels, centroids })
    }

    /// Load a gallery written by [`save_gallery`].
    pub fn load(path: &Path) -> Result<Self, RecognitionError> {
        let load_err = |reason: String| RecognitionError::ModelLoad {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let gallery: GalleryFile =
            serde_json::from_str(&content).map_err(|e| load_err(e.to_string()))?;
        let classifier = Self::from_samples(&gallery.samples).map_err(|e| load_err(e.to_string()))?;
        info!(
            path = path.display().to_string(),
            samples = gallery.samples.len(),
            persons = classifier.labels.len(),
            "classifier gallery loaded"
        );
        Ok(classifier)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Most likely label and its probability, or `None` for an empty gallery.
    pub fn predict(&self, embedding: &[f32]) -> Result<Option<(&str, f32)>, RecognitionError> {
        let Some(expected) = self.centroids.first().map(Vec::len) else {
            return Ok(None);
        };
        if embedding.len() != expected {
            return Err(RecognitionError::DimensionMismatch {
                got: embedding.len(),
                expected,
            });
        }

        let mut query = embedding.to_vec();
        l2_normalize(&mut query);
        let scores: Vec<f32> = self
            .centroids
            .iter()
            .map(|c| dot(c, &query) * SOFTMAX_SCALE)
            .collect();

        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f32 = exp.iter().sum();
        let (best, best_exp) = exp
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, e)| (i, *e))
            .unwrap_or((0, 0.0));
        Ok(Some((self.labels[best].as_str(), best_exp / total)))
    }
}

/// Write the gallery to `path` atomically (temp file + rename).
pub fn save_gallery(path: &Path, samples: &[LabelledEmbedding]) -> std::io::Result<()> {
    let gallery = GalleryFile {
        samples: samples.to_vec(),
    };
    let json = serde_json::to_vec(&gallery).map_err(std::io::Error::other)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
