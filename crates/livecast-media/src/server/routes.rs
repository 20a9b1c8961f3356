use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::AppState;
use crate::session::SessionSnapshot;
use crate::streams::{StreamDescriptor, StreamStoreError};

/// Error returned by API handlers, rendered as `{ "error": "..." }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<StreamStoreError> for ApiError {
    fn from(e: StreamStoreError) -> Self {
        match e {
            StreamStoreError::MissingUserId => Self::BadRequest(e.to_string()),
            StreamStoreError::NotFound { .. } => Self::NotFound(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    client_type: Option<String>,
}

/// `GET /`
pub async fn index() -> impl IntoResponse {
    Json(json!({ "message": "Media Server API" }))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let active_sessions = state.manager.registry().len().await;
    Json(json!({
        "status": "healthy",
        "active_sessions": active_sessions,
        "running_processes": state.manager.running_processes(),
    }))
}

/// `POST /api/streams/start`
pub async fn start_stream(
    State(state): State<AppState>,
    Json(req): Json<StartStreamRequest>,
) -> Result<Json<StreamDescriptor>, ApiError> {
    let user_id = req.user_id.unwrap_or_default();
    let descriptor = state
        .streams
        .start(&user_id, req.client_type.as_deref())
        .await?;
    Ok(Json(descriptor))
}

/// `POST /api/streams/{stream_id}/end`
pub async fn end_stream(
    Path(stream_id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.streams.end(&stream_id).await?;
    state.manager.stop_session(&record.stream_key).await;
    Ok(Json(json!({ "message": "Stream ended successfully" })))
}

/// `GET /api/streams/verify/{stream_key}`
pub async fn verify_stream(
    Path(stream_key): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    if state.streams.verify(&stream_key).await {
        Ok(Json(json!({ "allowed": true })))
    } else {
        Err(ApiError::Forbidden("Invalid stream key".to_string()))
    }
}

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.manager.sessions().await)
}

/// `DELETE /api/sessions/{session_id}`: always accepted, teardown is async.
pub async fn stop_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> StatusCode {
    info!(session_id = %session_id, "Stop requested via API");
    state.manager.stop_session(&session_id).await;
    StatusCode::ACCEPTED
}
