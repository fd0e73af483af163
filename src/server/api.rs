use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::engine::models::{Checkpoint, RunStatus};
use crate::errors::EngineError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Engine,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub project_id: String,
    pub user_id: String,
    /// Initial input for the first phase; stored under `input` in the
    /// run's state snapshot.
    pub input: serde_json::Value,
}

#[derive(Serialize)]
pub struct CreateRunResponse {
    pub run_id: String,
    pub status: RunStatus,
}

#[derive(Deserialize)]
pub struct ResumeRequest {
    pub run_id: String,
    pub checkpoint_name: String,
    pub decision: String,
    pub feedback: Option<String>,
    pub decided_by: String,
}

#[derive(Serialize)]
pub struct ResumeResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_status: Option<RunStatus>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: RunStatus,
    pub current_phase: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_checkpoint: Option<Checkpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::RunNotFound { .. } | EngineError::CheckpointNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            EngineError::AlreadyDecided { .. } | EngineError::CheckpointExpired { .. } => {
                ApiError::Conflict(err.to_string())
            }
            EngineError::DuplicateCheckpoint { .. } => {
                tracing::error!(error = %err, "duplicate checkpoint reached the API layer");
                ApiError::Internal(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/events", get(get_run_events))
        .route("/api/status/{id}", get(get_status))
        .route("/api/resume", post(resume_run))
        // Unprefixed aliases for callers wired to the bare trigger paths.
        .route("/resume", post(resume_run))
        .route("/status/{id}", get(get_status))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let initial = serde_json::json!({"input": req.input});
    let run = state
        .engine
        .controller()
        .start(&req.project_id, &req.user_id, initial)
        .await?;

    // Phase execution can take minutes; drive it on a background task and
    // return the id immediately.
    let controller = Arc::clone(state.engine.controller());
    let run_id = run.id.clone();
    tokio::spawn(async move {
        if let Err(e) = controller.advance(&run_id).await {
            tracing::warn!(%run_id, error = %e, "background advance failed");
        }
    });

    Ok((
        StatusCode::CREATED,
        Json(CreateRunResponse {
            run_id: run.id,
            status: run.status,
        }),
    ))
}

async fn resume_run(
    State(state): State<SharedState>,
    Json(req): Json<ResumeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .engine
        .dispatcher()
        .resume(
            &req.run_id,
            &req.checkpoint_name,
            &req.decision,
            req.feedback,
            &req.decided_by,
        )
        .await;

    match result {
        Ok(run_status) => Ok(Json(ResumeResponse {
            status: "resumed",
            run_status: Some(run_status),
        })),
        // A stale retry of a decided checkpoint is expected and safe; report
        // it as success so notification callbacks stop retrying.
        Err(EngineError::AlreadyDecided { .. }) => Ok(Json(ResumeResponse {
            status: "already_decided",
            run_status: None,
        })),
        Err(e) => Err(e.into()),
    }
}

async fn get_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.engine.controller().load(&id).await?;
    Ok(Json(StatusResponse {
        status: run.status,
        current_phase: run.current_phase,
        pending_checkpoint: run.pending_checkpoint,
        error: run.error,
    }))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.engine.controller().load(&id).await?;
    Ok(Json(run))
}

async fn get_run_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // 404 for unknown runs rather than an empty list.
    state.engine.controller().load(&id).await?;
    let events = state
        .engine
        .store()
        .call(move |db| db.list_events(&id))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(events))
}
