//! HTTP endpoint handlers. These are thin wrappers that forward to the
//! engine; each handler is instrumented and logs basic result info.

use std::sync::Arc;

use axum::{
  extract::{Path, Query, State},
  Json,
};
use tracing::{info, instrument};

use crate::domain::Difficulty;
use crate::engine::{AnswerOutcome, SessionReview, StartSession, UpsertDefinition};
use crate::error::QuizError;
use crate::protocol::*;
use crate::state::AppState;
use crate::summary::SessionSummary;

#[instrument(level = "info")]
pub async fn http_health() -> Json<HealthOut> {
  Json(HealthOut { ok: true })
}

#[instrument(level = "info", skip(state, body), fields(name = %body.name))]
pub async fn http_upsert_definition(
  State(state): State<Arc<AppState>>,
  Json(body): Json<UpsertDefinitionIn>,
) -> Result<Json<crate::domain::QuizDefinition>, QuizError> {
  let definition = state
    .engine
    .upsert_definition(UpsertDefinition {
      quiz_id: body.quiz_id,
      name: body.name,
      topics: body.topics,
      default_mode: body.default_mode,
      initial_difficulty: body.initial_difficulty,
      assessment_num_questions: body.assessment_num_questions,
      assessment_time_limit_minutes: body.assessment_time_limit_minutes,
      assessment_max_attempts: body.assessment_max_attempts,
      embedding_document_id: body.embedding_document_id,
      source_filename: body.source_filename,
      is_published: body.is_published,
      metadata: body.metadata,
    })
    .await?;
  Ok(Json(definition))
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_definitions(
  State(state): State<Arc<AppState>>,
) -> Json<Vec<crate::domain::QuizDefinition>> {
  Json(state.engine.list_definitions().await)
}

#[instrument(level = "info", skip(state), fields(%quiz_id))]
pub async fn http_get_definition(
  State(state): State<Arc<AppState>>,
  Path(quiz_id): Path<String>,
) -> Result<Json<crate::domain::QuizDefinition>, QuizError> {
  Ok(Json(state.engine.get_definition(&quiz_id).await?))
}

#[instrument(level = "info", skip(state), fields(%quiz_id))]
pub async fn http_delete_definition(
  State(state): State<Arc<AppState>>,
  Path(quiz_id): Path<String>,
) -> Result<Json<DeletedDefinitionOut>, QuizError> {
  state.engine.delete_definition(&quiz_id).await?;
  Ok(Json(DeletedDefinitionOut { status: "deleted", quiz_id }))
}

#[instrument(level = "info", skip(state, body), fields(session_id = %body.session_id, quiz_id = %body.quiz_id))]
pub async fn http_start_session(
  State(state): State<Arc<AppState>>,
  Json(body): Json<StartSessionIn>,
) -> Result<Json<SessionOut>, QuizError> {
  let session = state
    .engine
    .start_session(StartSession {
      session_id: body.session_id,
      quiz_id: body.quiz_id,
      user_id: body.user_id,
      mode: body.mode,
      initial_difficulty: body.initial_difficulty,
      is_preview: body.is_preview,
    })
    .await?;
  Ok(Json(to_session_out(&session)))
}

#[instrument(level = "info", skip(state, q), fields(%session_id))]
pub async fn http_next_question(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
  Query(q): Query<NextQuestionQuery>,
) -> Result<Json<QuestionOut>, QuizError> {
  let difficulty = match q.difficulty.as_deref() {
    Some(raw) => Some(
      Difficulty::parse(raw)
        .ok_or_else(|| QuizError::Validation(format!("unsupported difficulty '{}'", raw)))?,
    ),
    None => None,
  };
  let question = state
    .engine
    .get_next_question(&session_id, q.topic.as_deref(), difficulty)
    .await?;
  info!(target: "quiz", %session_id, question_id = %question.question_id, "HTTP question served");
  Ok(Json(to_question_out(&question)))
}

#[instrument(level = "info", skip(state, body), fields(%session_id, question_id = %body.question_id))]
pub async fn http_submit_answer(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
  Json(body): Json<AnswerIn>,
) -> Result<Json<AnswerOutcome>, QuizError> {
  let outcome = state
    .engine
    .submit_answer(&session_id, &body.question_id, &body.selected_answer)
    .await?;
  info!(target: "quiz", %session_id, correct = outcome.is_correct, completed = outcome.session_completed, "HTTP answer graded");
  Ok(Json(outcome))
}

#[instrument(level = "info", skip(state), fields(%session_id))]
pub async fn http_end_session(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, QuizError> {
  Ok(Json(state.engine.end_session(&session_id).await?))
}

#[instrument(level = "info", skip(state, q), fields(%quiz_id, user_id = %q.user_id))]
pub async fn http_session_history(
  State(state): State<Arc<AppState>>,
  Path(quiz_id): Path<String>,
  Query(q): Query<HistoryQuery>,
) -> Json<Vec<SessionSummary>> {
  Json(state.engine.list_session_history(&quiz_id, &q.user_id, q.limit).await)
}

#[instrument(level = "info", skip(state, q), fields(%session_id))]
pub async fn http_session_review(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
  Query(q): Query<ReviewQuery>,
) -> Result<Json<SessionReview>, QuizError> {
  Ok(Json(state.engine.get_session_review(&session_id, &q.user_id).await?))
}

#[instrument(level = "info", skip(state), fields(%session_id))]
pub async fn http_delete_preview_session(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<Json<DeletedSessionOut>, QuizError> {
  state.engine.delete_preview_session(&session_id).await?;
  Ok(Json(DeletedSessionOut { status: "deleted", session_id }))
}

#[instrument(level = "info", skip(state, q), fields(%session_id))]
pub async fn http_delete_session_record(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
  Query(q): Query<ReviewQuery>,
) -> Result<Json<DeletedSessionOut>, QuizError> {
  state.engine.delete_session_record(&session_id, &q.user_id).await?;
  Ok(Json(DeletedSessionOut { status: "deleted", session_id }))
}
