//! Engine error taxonomy and its HTTP mapping.
//!
//! Every variant maps to a distinct status code and always carries a message;
//! the engine never hides a determinable root cause behind a generic error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::domain::SessionStatus;

#[derive(Debug, Error)]
pub enum QuizError {
    /// Definition, session, or question missing.
    #[error("{0}")]
    NotFound(String),

    /// Starting a session id that is already in progress, or deleting a
    /// session through a path that does not apply to it.
    #[error("{0}")]
    Conflict(String),

    /// Operating on a terminal session; carries the terminal status.
    #[error("quiz session is no longer active ({})", status.as_str())]
    Closed { status: SessionStatus },

    /// Bad mode, missing required assessment parameters, duplicate answers.
    #[error("{0}")]
    Validation(String),

    /// Accessing or deleting a session owned by a different learner.
    #[error("{0}")]
    Forbidden(String),

    /// The generator failed or returned unusable output after all fallbacks.
    #[error("question generation is currently unavailable: {0}")]
    GenerationUnavailable(String),
}

impl IntoResponse for QuizError {
    fn into_response(self) -> Response {
        let status = match &self {
            QuizError::NotFound(_) => StatusCode::NOT_FOUND,
            QuizError::Conflict(_) => StatusCode::CONFLICT,
            QuizError::Closed { .. } => StatusCode::GONE,
            QuizError::Validation(_) => StatusCode::BAD_REQUEST,
            QuizError::Forbidden(_) => StatusCode::FORBIDDEN,
            QuizError::GenerationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = match &self {
            QuizError::Closed { status } => Json(json!({
                "error": self.to_string(),
                "session_status": status.as_str(),
            })),
            _ => Json(json!({ "error": self.to_string() })),
        };

        (status, body).into_response()
    }
}
