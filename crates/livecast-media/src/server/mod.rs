//! HTTP control API and WebSocket ingest endpoint.

mod routes;
mod ws;

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;

use crate::session::SessionManager;
use crate::streams::StreamStore;

pub use routes::ApiError;
pub use ws::{WebSocketConnection, close_code_for};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub streams: StreamStore,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_bytes: usize,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/health", get(routes::health))
        .route("/api/streams/start", post(routes::start_stream))
        .route("/api/streams/{stream_id}/end", post(routes::end_stream))
        .route("/api/streams/verify/{stream_key}", get(routes::verify_stream))
        .route("/api/sessions", get(routes::list_sessions))
        .route("/api/sessions/{session_id}", delete(routes::stop_session))
        .route("/ws/{session_id}", get(ws::ingest))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
