//! Router assembly: HTTP endpoints, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;

/// Build the application router with:
/// - REST API under `/api/v1/...` mapping 1:1 onto the engine operations
/// - CORS (allow any origin/method/headers) – adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::http_health))
        // Quiz definition registry
        .route("/api/v1/quiz/definitions", post(http::http_upsert_definition))
        .route("/api/v1/quiz/definitions", get(http::http_list_definitions))
        .route("/api/v1/quiz/definitions/:quiz_id", get(http::http_get_definition))
        .route("/api/v1/quiz/definitions/:quiz_id", delete(http::http_delete_definition))
        // Session lifecycle
        .route("/api/v1/quiz/session/start", post(http::http_start_session))
        .route("/api/v1/quiz/session/:session_id/next", get(http::http_next_question))
        .route("/api/v1/quiz/session/:session_id/answer", post(http::http_submit_answer))
        .route("/api/v1/quiz/session/:session_id/end", post(http::http_end_session))
        // Review / history / deletion
        .route("/api/v1/quiz/:quiz_id/sessions", get(http::http_session_history))
        .route("/api/v1/quiz/session/:session_id/review", get(http::http_session_review))
        .route("/api/v1/quiz/session/:session_id", delete(http::http_delete_preview_session))
        .route("/api/v1/quiz/session/:session_id/record", delete(http::http_delete_session_record))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}
