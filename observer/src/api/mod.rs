//! HTTP control surface for the observer.
//!
//! Start, stop, inspect, clean, save and download batches. All handlers share
//! one `OrchestratorController` through `AppState`.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared_types::{ArchiveQuery, SaveRequest, StartRequest, StatusMessage, DEFAULT_ARCHIVE_NAME};
use tracing::{error, warn};

use crate::archive::{self, ArchiveError};
use crate::orchestrator::{session_queue, ControlError};
use crate::AppState;

/// Configure all control routes
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/start", post(start_batch))
        .route("/stop", post(stop_batch))
        .route("/status", get(batch_status))
        .route("/sessions", get(list_sessions))
        .route("/clean", post(clean_logs))
        .route("/save", post(save_logs))
        .route("/get", get(download_saved))
}

fn status(message: impl Into<String>) -> Json<StatusMessage> {
    Json(StatusMessage::new(message))
}

fn control_error_response(op: &str, e: ControlError) -> Response {
    match e {
        ControlError::AlreadyRunning => {
            (StatusCode::CONFLICT, status("already running")).into_response()
        }
        ControlError::Busy(_) => {
            warn!(op, "{e}");
            (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))).into_response()
        }
        ControlError::InvalidRequest(_) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
        ControlError::Archive(inner) => archive_error_response(op, inner),
        ControlError::Io { .. } => {
            error!(op, "{e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn archive_error_response(op: &str, e: ArchiveError) -> Response {
    let code = match &e {
        ArchiveError::InvalidName(_) => StatusCode::BAD_REQUEST,
        ArchiveError::NotFound(_) => StatusCode::NOT_FOUND,
        ArchiveError::Io { .. } | ArchiveError::Zip(_) | ArchiveError::Task(_) => {
            error!(op, "{e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (code, Json(json!({ "error": e.to_string() }))).into_response()
}

/// GET /health
async fn health_check() -> impl IntoResponse {
    status("ok")
}

/// POST /start — begin a batch; rejected while one is running
async fn start_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Response {
    let session_ids = match session_queue(&req) {
        Ok(ids) => ids,
        Err(e) => return control_error_response("start", e),
    };
    match state.controller.start(session_ids).await {
        Ok(()) => status("started").into_response(),
        Err(e) => control_error_response("start", e),
    }
}

/// POST /stop — blocks until the worker has observed the stop
async fn stop_batch(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.controller.stop().await;
    status("stopped")
}

/// GET /status
async fn batch_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

/// GET /sessions — every record of the current batch, in processing order
async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.records().await)
}

/// POST /clean — delete the log directory's files and clear the ledger
async fn clean_logs(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.clean().await {
        Ok(()) => status("cleaned").into_response(),
        Err(e) => control_error_response("clean", e),
    }
}

/// POST /save — move the current logs into a named sibling directory
async fn save_logs(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveRequest>,
) -> Response {
    let name = archive_name(req.name.as_deref());
    match state.controller.save(name).await {
        Ok(_) => status(format!("session saved as {name}")).into_response(),
        Err(e) => control_error_response("save", e),
    }
}

fn archive_name(requested: Option<&str>) -> &str {
    requested.map(str::trim).unwrap_or(DEFAULT_ARCHIVE_NAME)
}

/// GET /get?name= — zip a saved directory and return it as an attachment
async fn download_saved(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ArchiveQuery>,
) -> Response {
    let name = archive_name(query.name.as_deref());
    match archive::archive_saved(state.controller.log_dir(), name).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/zip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{name}.zip\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => archive_error_response("get", e),
    }
}
