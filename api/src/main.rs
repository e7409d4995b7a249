mod stream;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use presence_cam_capture::recognition::train::{self, TrainError};
use presence_cam_capture::recognition::{self, FaceClassifier};
use presence_cam_capture::{
    CaptureLoop, CaptureSettings, FrameBroadcaster, MjpegCamera, RecognitionError,
    RecognitionSettings, Recognizer,
};
use presence_cam_common::config::{Config, RecognitionConfig};
use presence_cam_common::mjpeg;
use presence_cam_presence::db::{get_interval, open_connection, query_intervals};
use presence_cam_presence::{PresenceDb, PresenceTracker, StoredInterval};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::stream::StreamEncoder;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    tracker: Arc<PresenceTracker>,
    frames: Arc<FrameBroadcaster>,
    recognizer: Arc<Recognizer>,
    db_path: PathBuf,
    corpus_dir: PathBuf,
    classifier_path: PathBuf,
    fps: f64,
    jpeg_quality: u8,
    viewers: Arc<AtomicUsize>,
    retraining: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

/// Held for the duration of one retrain; frees the slot when dropped.
struct RetrainSlot(Arc<AppState>);

impl RetrainSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        state
            .retraining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(state)))
    }
}

impl Drop for RetrainSlot {
    fn drop(&mut self) {
        self.0.retraining.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    person: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Health {
    frames_published: u64,
    last_seq: Option<u64>,
    last_frame_at: Option<DateTime<Utc>>,
    viewers: usize,
    known_persons: usize,
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error("initial classifier training failed: {0}")]
    Train(#[from] TrainError),
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
  <head><title>presence-cam</title></head>
  <body>
    <h1>presence-cam</h1>
    <img src="/video_feed" alt="live feed">
    <p><a href="/presence">who is here</a> | <a href="/presence/history">history</a></p>
  </body>
</html>
"#;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /
///
/// Page embedding the live feed.
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /video_feed
///
/// Multipart MJPEG, one part per tick until the client goes away or the
/// server shuts down.
async fn video_feed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = StreamEncoder::new(
        Arc::clone(&state.frames),
        state.shutdown.clone(),
        state.fps,
        state.jpeg_quality,
        &state.viewers,
    );
    (
        [
            (header::CONTENT_TYPE, mjpeg::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, private"),
        ],
        Body::from_stream(encoder.into_stream()),
    )
}

/// GET /presence: current tracker snapshot
async fn presence(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.tracker.snapshot())
}

/// GET /presence/history?person=&limit=
async fn presence_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    let db_path = state.db_path.clone();
    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<Vec<StoredInterval>> {
        let conn = open_connection(&db_path)?;
        query_intervals(&conn, q.person.as_deref(), q.limit.unwrap_or(100))
    })
    .await;

    match result {
        Ok(Ok(rows)) => Json(rows).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "SQLite query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /presence/history/:id
async fn presence_interval(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> impl IntoResponse {
    let db_path = state.db_path.clone();
    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<Option<StoredInterval>> {
        let conn = open_connection(&db_path)?;
        get_interval(&conn, id)
    })
    .await;

    match result {
        Ok(Ok(Some(row))) => Json(row).into_response(),
        Ok(Ok(None)) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "SQLite query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// POST /retrain
///
/// Rebuild the classifier from the corpus. New persons are registered with
/// the tracker before the new classifier goes live.
async fn retrain(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(slot) = RetrainSlot::acquire(&state) else {
        return (StatusCode::CONFLICT, "retrain already running").into_response();
    };

    let result = tokio::task::spawn_blocking(move || {
        let state = &slot.0;
        train::retrain(
            &state.recognizer,
            &state.tracker,
            &state.corpus_dir,
            &state.classifier_path,
        )
    })
    .await;

    match result {
        Ok(Ok(report)) => Json(report).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "retrain failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let latest = state.frames.latest();
    Json(Health {
        frames_published: state.frames.published(),
        last_seq: latest.as_ref().map(|f| f.seq),
        last_frame_at: latest.as_ref().map(|f| f.captured_at),
        viewers: state.viewers.load(Ordering::Relaxed),
        known_persons: state.tracker.known_persons().len(),
    })
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/presence", get(presence))
        .route("/presence/history", get(presence_history))
        .route("/presence/history/:id", get(presence_interval))
        .route("/retrain", post(retrain))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Load the models and the classifier gallery, registering its persons with
/// `tracker`. A missing gallery is built from the corpus before the first
/// frame is processed.
fn load_recognizer(
    config: &RecognitionConfig,
    tracker: &PresenceTracker,
) -> Result<Recognizer, StartupError> {
    let (detector, embedder) = recognition::load_backends(config)?;
    let settings = RecognitionSettings::from(config);

    if config.classifier_path.exists() {
        let classifier = FaceClassifier::load(&config.classifier_path)?;
        tracker.register(classifier.labels().iter().cloned());
        return Ok(Recognizer::new(detector, embedder, classifier, settings));
    }

    warn!(
        path = config.classifier_path.display().to_string(),
        "no classifier gallery found, training from corpus"
    );
    let recognizer = Recognizer::new(detector, embedder, FaceClassifier::default(), settings);
    train::retrain(&recognizer, tracker, &config.corpus_dir, &config.classifier_path)?;
    Ok(recognizer)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera = config.camera.url,
        fps = config.camera.fps,
        session_timeout_secs = config.presence.session_timeout_secs,
        "starting presence-cam"
    );

    let tracker = Arc::new(PresenceTracker::new(
        Vec::<String>::new(),
        Duration::from_secs(config.presence.session_timeout_secs),
    ));

    let recognizer = match load_recognizer(&config.recognition, &tracker) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "failed to initialise face recognition");
            std::process::exit(1);
        }
    };

    let db_path = PathBuf::from(&config.database.path);
    let store = match PresenceDb::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, path = config.database.path, "failed to open presence database");
            std::process::exit(1);
        }
    };

    let frames = Arc::new(FrameBroadcaster::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let camera = MjpegCamera::connect(
        &tokio::runtime::Handle::current(),
        config.camera.url.clone(),
        config.camera.fps,
        Duration::from_millis(config.camera.read_timeout_ms),
    );
    let capture = CaptureLoop::new(
        camera,
        Arc::clone(&recognizer),
        Arc::clone(&tracker),
        Some(store),
        Arc::clone(&frames),
        CaptureSettings::from(&config.capture),
    );
    let capture_thread = match capture.spawn(shutdown_rx.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start capture thread");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        tracker,
        frames,
        recognizer,
        db_path,
        corpus_dir: config.recognition.corpus_dir.clone(),
        classifier_path: config.recognition.classifier_path.clone(),
        fps: config.camera.fps,
        jpeg_quality: config.api.jpeg_quality,
        viewers: Arc::new(AtomicUsize::new(0)),
        retraining: AtomicBool::new(false),
        shutdown: shutdown_rx,
    });

    let addr = format!("{}:{}", config.api.bind, config.api.port);
    info!(addr, "presence-cam HTTP server starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    let signal_tx = Arc::clone(&shutdown_tx);
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
            signal_tx.send_replace(true);
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "HTTP server failed");
    }

    shutdown_tx.send_replace(true);
    match tokio::task::spawn_blocking(move || capture_thread.join()).await {
        Ok(Ok(())) => info!("capture thread stopped"),
        _ => error!("capture thread panicked"),
    }
}
