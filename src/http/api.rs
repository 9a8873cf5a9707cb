use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::errors::QueueError;
use crate::job::models::{BuildRequest, JobStatus};
use crate::job::queue::BuildQueue;
use crate::modules::registry::ModuleRegistry;
use crate::parser::parse_nginx_v;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub queue: BuildQueue,
    pub registry: Arc<ModuleRegistry>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ParseRequest {
    pub output: String,
}

#[derive(Serialize)]
pub struct BuildAccepted {
    pub id: String,
}

// ── Error type ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("invalid request body: {}", rejection.body_text()))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/modules", get(list_modules))
        .route("/api/parse", post(parse_output))
        .route("/api/build", post(submit_build))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/download", get(download_job_artifact))
        .route("/api/history", get(list_history))
        .route("/api/history/{id}/download", get(download_history_artifact))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_modules(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn parse_output(
    payload: Result<Json<ParseRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let result = parse_nginx_v(&req.output).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(result))
}

async fn submit_build(
    State(state): State<SharedState>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    state
        .queue
        .validate(&req)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let job = state.queue.submit(req).await.map_err(|e| match e {
        QueueError::Closed => ApiError::Unavailable(e.to_string()),
    })?;
    info!(job_id = %job.id, "build accepted");
    Ok(Json(BuildAccepted { id: job.id }))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .queue
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))?;
    Ok(Json(job))
}

async fn download_job_artifact(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .queue
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))?;

    let artifact = match (&job.status, &job.artifact_path) {
        (JobStatus::Success, Some(path)) => path.clone(),
        _ => return Err(ApiError::BadRequest(format!("job {} has no artifact yet", id))),
    };
    let version = job.result.as_ref().map(|r| r.version.as_str());
    send_artifact(&artifact, version).await
}

async fn list_history(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .queue
        .list_history()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(entries))
}

async fn download_history_artifact(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let entry = state
        .queue
        .find_history(&id)
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("history entry {} not found", id)))?;

    let artifact = entry
        .artifact
        .ok_or_else(|| ApiError::BadRequest(format!("build {} produced no artifact", id)))?;
    send_artifact(&artifact, Some(entry.version.as_str())).await
}

async fn send_artifact(path: &FsPath, version: Option<&str>) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::NotFound(format!("artifact {} no longer exists", path.display()))
        } else {
            error!(path = %path.display(), error = %e, "failed to open artifact");
            ApiError::Internal(format!("failed to open artifact: {}", e))
        }
    })?;

    let filename = match version.filter(|v| !v.is_empty()) {
        Some(v) => format!("nginx-{}", v),
        None => "nginx".to_string(),
    };
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response())
}
