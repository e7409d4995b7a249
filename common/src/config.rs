use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// MJPEG endpoint of the camera, e.g. `http://10.0.0.12:8080/stream`.
    pub url: String,
    /// Nominal frame rate advertised by the camera.
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Frames are resized to this width before recognition (aspect ratio kept).
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    pub detector_model: PathBuf,
    pub embedder_model: PathBuf,
    pub classifier_path: PathBuf,
    /// Labelled images used by the retrain trigger: `<corpus_dir>/<person>/*.jpg`.
    pub corpus_dir: PathBuf,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_min_face_size")]
    pub min_face_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Idle gap after which an open interval is closed. 0 keeps intervals open forever.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_width: default_frame_width(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            jpeg_quality: default_quality(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.camera.fps > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "camera.fps must be positive, got {}",
                self.camera.fps
            )));
        }
        if self.capture.frame_width == 0 {
            return Err(ConfigError::Invalid("capture.frame_width must be non-zero".into()));
        }
        if !(1..=100).contains(&self.api.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "api.jpeg_quality must be between 1 and 100, got {}",
                self.api.jpeg_quality
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_fps() -> f64 {
    10.0
}
fn default_read_timeout_ms() -> u64 {
    2000
}
fn default_frame_width() -> u32 {
    600
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_min_confidence() -> f32 {
    0.5
}
fn default_min_face_size() -> u32 {
    20
}
fn default_session_timeout() -> u64 {
    600
}
fn default_db_path() -> String {
    "data/presence.db".into()
}
fn default_bind() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    5000
}
fn default_quality() -> u8 {
    80
}
fn default_log_level() -> String {
    "info".into()
}
