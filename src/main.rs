//! Quizcoach · Adaptive Quiz Engine Backend
//!
//! - Axum HTTP API (definition registry, session state machine, summaries)
//! - Optional OpenAI-backed question generation (via environment variables)
//! - Optional vector-search grounding for generated questions
//!
//! Important env variables:
//!   PORT             : u16 (default 3000)
//!   OPENAI_API_KEY    : enables LLM question generation if present
//!   OPENAI_BASE_URL    : default "https://api.openai.com/v1"
//!   OPENAI_QUESTION_MODEL : default "gpt-4o-mini"
//!   VECTOR_SEARCH_URL  : enables grounded generation if present
//!   VECTOR_SEARCH_API_KEY : optional bearer token for the vector service
//!   QUIZ_CONFIG_PATH   : path to TOML config (prompt overrides)
//!   QUIZ_PRACTICE_INCREASE_STREAK / QUIZ_PRACTICE_DECREASE_STREAK
//!   QUIZ_REVIEW_GAP / QUIZ_COVERAGE_RESET_THRESHOLD / QUIZ_CONTEXT_SAMPLE_SIZE
//!   LOG_LEVEL    : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT      : "pretty" (default) or "json"

mod telemetry;
mod util;
mod domain;
mod config;
mod error;
mod store;
mod generator;
mod retriever;
mod summary;
mod engine;
mod protocol;
mod state;
mod routes;

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Build shared application state (store, engine, generator, retriever).
  let state = Arc::new(AppState::new());

  // Build the HTTP router with routes, CORS and tracing layers.
  let app = build_router(state.clone());

  // Read port from env or default to 3000.
  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "quizcoach_backend", %addr, "HTTP server listening");
  axum::serve(listener, app).await?;
  Ok(())
}
