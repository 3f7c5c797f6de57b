//! Route handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::SafetyError;
use crate::executor::{ExecutionRequest, FileAccess};
use crate::safety::{ChatType, CommandVerdict, PatternSummary};
use crate::sandbox::manager::{ExecutionResult, SandboxStats, validate_user_id};
use crate::server::AppState;

/// Body of `POST /v1/exec`.
#[derive(Debug, Deserialize)]
pub struct ExecBody {
    pub user_id: String,
    pub command: String,
    #[serde(default)]
    pub chat_type: ChatType,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Body of `POST /v1/classify`.
#[derive(Debug, Deserialize)]
pub struct ClassifyBody {
    pub command: String,
    #[serde(default)]
    pub chat_type: ChatType,
}

/// Body of `POST /v1/files/check`.
#[derive(Debug, Deserialize)]
pub struct FileCheckBody {
    pub user_id: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sandbox_available: bool,
    pub pattern_generation: u64,
}

/// Errors surfaced as JSON `{"error": ...}` bodies.
pub enum ApiError {
    BadRequest(String),
    Safety(SafetyError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Safety(SafetyError::NoPatternFile) => {
                (StatusCode::CONFLICT, SafetyError::NoPatternFile.to_string())
            }
            ApiError::Safety(e) => {
                tracing::warn!(error = %e, "Pattern rescan failed");
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sandbox_available: state.executor.sandbox().is_available(),
        pattern_generation: state.executor.gate().patterns().snapshot().generation(),
    })
}

pub async fn exec(
    State(state): State<AppState>,
    Json(body): Json<ExecBody>,
) -> Json<ExecutionResult> {
    let request = ExecutionRequest {
        user_id: body.user_id,
        command: body.command,
        working_dir: body.cwd,
    };
    Json(state.executor.run_command(&request, body.chat_type).await)
}

pub async fn classify(
    State(state): State<AppState>,
    Json(body): Json<ClassifyBody>,
) -> Json<CommandVerdict> {
    Json(state.executor.gate().classify(&body.command, body.chat_type))
}

pub async fn check_file(
    State(state): State<AppState>,
    Json(body): Json<FileCheckBody>,
) -> Json<FileAccess> {
    Json(state.executor.check_file_access(&body.user_id, &body.path))
}

pub async fn sandbox_stats(State(state): State<AppState>) -> Json<SandboxStats> {
    Json(state.executor.sandbox().stats().await)
}

pub async fn stop_sandbox(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    validate_user_id(&user_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.executor.sandbox().stop(&user_id).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rescan_patterns(
    State(state): State<AppState>,
) -> Result<Json<PatternSummary>, ApiError> {
    state
        .executor
        .gate()
        .rescan()
        .map(Json)
        .map_err(ApiError::Safety)
}
