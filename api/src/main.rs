use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use camdrop_capture::session::{CaptureMode, CaptureSession, ControlError, SessionController};
use camdrop_capture::storage::{FrameStore, StorageError};
use camdrop_common::config::{Config, Sensitivity};
use camdrop_common::frame::FrameId;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    store: FrameStore,
    controller: SessionController,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct FrameEntry {
    id: FrameId,
    /// Unix seconds.
    timestamp: i64,
    /// RFC 3339, UTC.
    captured_at: Option<String>,
}

impl From<FrameId> for FrameEntry {
    fn from(id: FrameId) -> Self {
        Self {
            id,
            timestamp: id.captured_at,
            captured_at: id.captured_at_utc().map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FrameQuery {
    start: Option<i64>,
    end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    download: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct ManualRequest {
    shots: u32,
}

#[derive(Debug, Deserialize)]
struct ContinuousRequest {
    sensitivity: Sensitivity,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn storage_error(e: StorageError) -> Response {
    match e {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND.into_response(),
        e => {
            error!(error = %e, "frame store failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn control_response(result: Result<(), ControlError>, success: StatusCode) -> Response {
    match result {
        Ok(()) => success.into_response(),
        Err(e @ ControlError::InvalidRequest(_)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e @ ControlError::Closed) => {
            error!(error = %e, "capture worker is gone");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

fn content_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /frames?start=&end= (inclusive unix-second range)
async fn list_frames(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FrameQuery>,
) -> Response {
    match state.store.list().await {
        Ok(ids) => {
            let frames: Vec<FrameEntry> = ids
                .into_iter()
                .filter(|id| q.start.map_or(true, |start| id.captured_at >= start))
                .filter(|id| q.end.map_or(true, |end| id.captured_at <= end))
                .map(FrameEntry::from)
                .collect();
            Json(frames).into_response()
        }
        Err(e) => storage_error(e),
    }
}

/// GET /frames/stats
async fn frame_stats(State(state): State<Arc<AppState>>) -> Response {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => storage_error(e),
    }
}

/// GET /frames/:id, with `?download=1` served as an attachment
async fn get_frame(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(q): Query<DownloadQuery>,
) -> Response {
    let id: FrameId = match id.parse() {
        Ok(id) => id,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}")).into_response(),
    };

    match state.store.read(&id).await {
        Ok(data) => {
            let extension = state.store.extension();
            let mut response = (
                [(header::CONTENT_TYPE, content_type(extension))],
                data,
            )
                .into_response();
            if q.download.unwrap_or(0) != 0 {
                let disposition = format!("attachment; filename=\"{}\"", id.file_name(extension));
                match disposition.parse::<header::HeaderValue>() {
                    Ok(value) => {
                        response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
                    }
                    Err(e) => warn!(error = %e, %id, "invalid content-disposition"),
                }
            }
            response
        }
        Err(e) => storage_error(e),
    }
}

/// GET /capture
async fn capture_state(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "state": state.controller.state(),
        "running": state.controller.is_running().await,
    }))
    .into_response()
}

/// POST /capture/manual  Body: { "shots": 3 }
async fn start_manual(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ManualRequest>,
) -> Response {
    let mode = CaptureMode::Manual { shots: body.shots };
    control_response(state.controller.start(mode).await, StatusCode::ACCEPTED)
}

/// POST /capture/continuous  Body: { "sensitivity": "medium" }
async fn start_continuous(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContinuousRequest>,
) -> Response {
    let mode = CaptureMode::Continuous {
        sensitivity: body.sensitivity,
    };
    control_response(state.controller.start(mode).await, StatusCode::ACCEPTED)
}

/// POST /capture/stop
async fn stop_capture(State(state): State<Arc<AppState>>) -> Response {
    if state.controller.stop().await {
        StatusCode::ACCEPTED.into_response()
    } else {
        (StatusCode::CONFLICT, "no capture is running").into_response()
    }
}

/// POST /capture/acknowledge
async fn acknowledge_error(State(state): State<Arc<AppState>>) -> Response {
    control_response(
        state.controller.acknowledge_error().await,
        StatusCode::NO_CONTENT,
    )
}

/// POST /capture/retry
async fn retry_capture(State(state): State<Arc<AppState>>) -> Response {
    control_response(state.controller.retry().await, StatusCode::ACCEPTED)
}

/// GET /capture/events: one JSON `CaptureEvent` per server-sent event
async fn capture_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.controller.subscribe()).filter_map(|item| match item {
        Ok(event) => match Event::default().json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!(error = %e, "failed to encode capture event");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "event subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/frames", get(list_frames))
        .route("/frames/stats", get(frame_stats))
        .route("/frames/:id", get(get_frame))
        .route("/capture", get(capture_state))
        .route("/capture/manual", post(start_manual))
        .route("/capture/continuous", post(start_continuous))
        .route("/capture/stop", post(stop_capture))
        .route("/capture/acknowledge", post(acknowledge_error))
        .route("/capture/retry", post(retry_capture))
        .route("/capture/events", get(capture_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
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

    let store = match FrameStore::open(&config.storage).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open frame store {}: {e}", config.storage.dir);
            std::process::exit(1);
        }
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let session = CaptureSession::from_config(&config, store.clone(), event_tx);
    let controller = SessionController::spawn(session, event_rx);

    let state = Arc::new(AppState { store, controller });
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.api.port);
    info!(
        addr,
        camera_port = config.receiver.port,
        dir = config.storage.dir,
        "camdrop API server starting"
    );

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "API server stopped");
        std::process::exit(1);
    }
}
