use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use presence_cam_presence::PresenceTracker;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::classifier::{save_gallery, LabelledEmbedding};
use super::{FaceClassifier, RecognitionError, Recognizer};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("cannot read corpus at {path}: {source}")]
    Corpus {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no usable face found in the corpus")]
    NoSamples,
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error("failed to write classifier gallery: {0}")]
    Save(std::io::Error),
}

/// Outcome of a retrain: accepted samples per person and images skipped.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingReport {
    pub persons: BTreeMap<String, usize>,
    pub skipped: usize,
}

/// Embed the largest accepted face of every image under
/// `corpus_dir/<person>/`. Images that fail to decode or hold no face are
/// counted as skipped.
pub fn collect_samples(
    recognizer: &Recognizer,
    corpus_dir: &Path,
) -> Result<(Vec<LabelledEmbedding>, TrainingReport), TrainError> {
    let mut samples = Vec::new();
    let mut report = TrainingReport::default();

    for (person, dir) in read_sorted(corpus_dir)?
        .into_iter()
        .filter(|p| p.is_dir())
        .filter_map(|p| Some((p.file_name()?.to_str()?.to_string(), p)))
    {
        for path in read_sorted(&dir)?.into_iter().filter(|p| is_image(p)) {
            let image = match image::open(&path) {
                Ok(image) => image.to_rgb8(),
                Err(e) => {
                    warn!(path = path.display().to_string(), error = %e, "skipping unreadable image");
                    report.skipped += 1;
                    continue;
                }
            };
            let Some(bbox) = recognizer
                .accepted_faces(&image)?
                .into_iter()
                .max_by_key(|b| b.area())
            else {
                debug!(path = path.display().to_string(), "no face in training image");
                report.skipped += 1;
                continue;
            };
            let embedding = recognizer.embed_region(&image, bbox)?;
            samples.push(LabelledEmbedding::new(person.as_str(), embedding));
            *report.persons.entry(person.clone()).or_default() += 1;
        }
    }

    if samples.is_empty() {
        return Err(TrainError::NoSamples);
    }
    Ok((samples, report))
}

/// Rebuild the classifier from `corpus_dir`, persist it at `gallery_path`
/// and swap it into `recognizer`.
///
/// Every trained person is registered with `tracker` before the swap, so
/// the first frame classified by the new model never names someone the
/// tracker would reject.
pub fn retrain(
    recognizer: &Recognizer,
    tracker: &PresenceTracker,
    corpus_dir: &Path,
    gallery_path: &Path,
) -> Result<TrainingReport, TrainError> {
    info!(corpus = corpus_dir.display().to_string(), "retraining classifier");
    let (samples, report) = collect_samples(recognizer, corpus_dir)?;
    let classifier = FaceClassifier::from_samples(&samples)?;
    save_gallery(gallery_path, &samples).map_err(TrainError::Save)?;

    let added = tracker.register(classifier.labels().iter().cloned());
    recognizer.swap_classifier(classifier);
    info!(
        persons = report.persons.len(),
        added,
        samples = samples.len(),
        skipped = report.skipped,
        "classifier retrained"
    );
    Ok(report)
}

fn read_sorted(dir: &Path) -> Result<Vec<PathBuf>, TrainError> {
    let corpus_err = |source| TrainError::Corpus {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = std::fs::read_dir(dir)
        .map_err(corpus_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(corpus_err)?;
    paths.sort();
    Ok(paths)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::testing::*;
    use image::{Rgb, RgbImage};

    /// 100x100 image filled with `color`; the fixed detector reports one
    /// 40 px face at (10,10).
    fn write_face(dir: &Path, name: &str, color: [u8; 3]) {
        std::fs::create_dir_all(dir).unwrap();
        RgbImage::from_pixel(100, 100, Rgb(color))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn retrain_builds_and_swaps_classifier() {
        let corpus = tempfile::tempdir().unwrap();
        write_face(&corpus.path().join("carol"), "1.png", [0, 255, 0]);
        write_face(&corpus.path().join("carol"), "2.png", [10, 250, 10]);
        write_face(&corpus.path().join("dave"), "1.png", [255, 255, 0]);
        std::fs::write(corpus.path().join("carol").join("notes.txt"), "x").unwrap();
        std::fs::write(corpus.path().join("stray.png"), "not a dir").unwrap();

        let out = tempfile::tempdir().unwrap();
        let gallery = out.path().join("classifier.json");
        let recognizer = recognizer(FixedDetector::new(vec![detection(10, 10, 40, 0.9)]));

        let tracker = PresenceTracker::new(["alice"], std::time::Duration::from_secs(600));

        let report = retrain(&recognizer, &tracker, corpus.path(), &gallery).unwrap();
        assert_eq!(report.persons.get("carol"), Some(&2));
        assert_eq!(report.persons.get("dave"), Some(&1));
        assert_eq!(report.skipped, 0);

        assert_eq!(
            recognizer.classifier().labels(),
            &["carol".to_string(), "dave".to_string()]
        );
        let reloaded = FaceClassifier::load(&gallery).unwrap();
        assert_eq!(reloaded.labels().len(), 2);
        assert_eq!(tracker.known_persons(), vec!["alice", "carol", "dave"]);
    }

    #[test]
    fn new_persons_are_known_before_they_can_be_recognised() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        let corpus = tempfile::tempdir().unwrap();
        write_face(&corpus.path().join("carol"), "1.png", [0, 255, 0]);
        let out = tempfile::tempdir().unwrap();

        let recognizer = Arc::new(recognizer(FixedDetector::new(vec![detection(10, 10, 40, 0.9)])));
        let tracker = Arc::new(PresenceTracker::new(["alice", "bob"], Duration::from_secs(600)));
        let done = Arc::new(AtomicBool::new(false));

        // Mimics the capture thread: classify a green face and record it.
        let watcher = {
            let recognizer = Arc::clone(&recognizer);
            let tracker = Arc::clone(&tracker);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let face = RgbImage::from_pixel(100, 100, Rgb([0, 255, 0]));
                let mut saw_carol = false;
                loop {
                    let finished = done.load(Ordering::Acquire);
                    for face in recognizer.recognize_faces(&face).unwrap() {
                        tracker
                            .record(&face.identity.name, chrono::Utc::now())
                            .unwrap_or_else(|e| panic!("recognised but untracked: {e}"));
                        saw_carol |= face.identity.name == "carol";
                    }
                    if finished {
                        return saw_carol;
                    }
                }
            })
        };

        retrain(&recognizer, &tracker, corpus.path(), &out.path().join("c.json")).unwrap();
        done.store(true, Ordering::Release);
        assert!(watcher.join().unwrap(), "carol recognised after the swap");
    }

    #[test]
    fn corrupt_images_are_skipped() {
        let corpus = tempfile::tempdir().unwrap();
        write_face(&corpus.path().join("carol"), "ok.png", [0, 255, 0]);
        std::fs::write(corpus.path().join("carol").join("bad.jpg"), b"garbage").unwrap();

        let recognizer = recognizer(FixedDetector::new(vec![detection(10, 10, 40, 0.9)]));
        let (samples, report) = collect_samples(&recognizer, corpus.path()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn corpus_without_faces_keeps_old_classifier() {
        let corpus = tempfile::tempdir().unwrap();
        write_face(&corpus.path().join("carol"), "1.png", [0, 255, 0]);
        let out = tempfile::tempdir().unwrap();

        let recognizer = recognizer(FixedDetector::new(Vec::new()));
        let tracker = PresenceTracker::new(["alice", "bob"], std::time::Duration::from_secs(600));
        let result = retrain(&recognizer, &tracker, corpus.path(), &out.path().join("c.json"));
        assert!(matches!(result, Err(TrainError::NoSamples)));
        assert_eq!(recognizer.classifier().labels().len(), 2);
        assert_eq!(tracker.known_persons().len(), 2);
        assert!(!out.path().join("c.json").exists());
    }

    #[test]
    fn missing_corpus_is_error() {
        let recognizer = recognizer(FixedDetector::new(Vec::new()));
        let result = collect_samples(&recognizer, Path::new("/nonexistent/corpus"));
        assert!(matches!(result, Err(TrainError::Corpus { .. })));
    }
}
