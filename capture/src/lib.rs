//! Capture side of presence-cam: camera input, face recognition and the
//! loop that feeds the presence tracker and the frame broadcaster.
//!
//! Real detection and embedding models need the `onnx` feature
//! (`cargo build --features onnx`, forwarded by the `presence-cam-api`
//! crate). Without it [`recognition::load_backends`] returns
//! [`RecognitionError::BackendUnavailable`] and the server refuses to start;
//! everything else, tests included, builds and runs on the default features.

pub mod broadcaster;
pub mod camera;
pub mod capture_loop;
pub mod mjpeg;
pub mod recognition;

pub use broadcaster::FrameBroadcaster;
pub use camera::{CameraError, CameraSource};
pub use capture_loop::{CaptureLoop, CaptureSettings, CycleOutcome};
pub use mjpeg::MjpegCamera;
pub use recognition::{RecognitionError, RecognitionSettings, Recognizer};
