//! The quiz engine: definition registry and the per-learner session state
//! machine.
//!
//! Question sourcing for a session resolves in priority order:
//!   1) the outstanding (served-but-unanswered) question, re-served verbatim
//!   2) a missed-question replay clone, once the review gap has elapsed
//!   3) a pre-generated queued question
//!   4) an unused bank question, topic-matched when possible
//!   5) fresh generation, grounded in retrieved context when available
//!
//! Sessions are mutated as whole snapshots: load, mutate, save. A generation
//! failure aborts the request before anything is saved.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::{
  Difficulty, QuizAttempt, QuizDefinition, QuizMode, QuizQuestion, QuizSession, SessionStatus,
};
use crate::error::QuizError;
use crate::generator::QuestionGenerator;
use crate::retriever::{ContextFetch, ContextRetriever};
use crate::store::QuizStore;
use crate::summary::{build_summary, SessionSummary};

/// Input for creating or updating a quiz definition.
#[derive(Clone, Debug, Default)]
pub struct UpsertDefinition {
  pub quiz_id: Option<String>,
  pub name: String,
  pub topics: Vec<String>,
  pub default_mode: String,
  pub initial_difficulty: String,
  pub assessment_num_questions: Option<u32>,
  pub assessment_time_limit_minutes: Option<u32>,
  pub assessment_max_attempts: Option<u32>,
  pub embedding_document_id: Option<String>,
  pub source_filename: Option<String>,
  pub is_published: bool,
  pub metadata: Option<serde_json::Value>,
}

/// Input for starting a session.
#[derive(Clone, Debug)]
pub struct StartSession {
  pub session_id: String,
  pub quiz_id: String,
  pub user_id: String,
  pub mode: Option<String>,
  pub initial_difficulty: Option<String>,
  pub is_preview: bool,
}

/// Everything the caller learns from grading one answer.
#[derive(Clone, Debug, Serialize)]
pub struct AnswerOutcome {
  pub question_id: String,
  pub is_correct: bool,
  pub selected_answer: String,
  pub correct_answer: String,
  /// Rationale shown for this attempt.
  pub rationale: String,
  pub correct_rationale: String,
  pub incorrect_rationales: HashMap<String, String>,
  pub topic: String,
  pub difficulty: Difficulty,
  pub session_completed: bool,
  pub current_difficulty: Difficulty,
  pub response_ms: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub summary: Option<SessionSummary>,
}

/// One attempt with its question resolved for after-the-fact review.
#[derive(Clone, Debug, Serialize)]
pub struct AttemptReview {
  pub question_id: String,
  pub prompt: Option<String>,
  pub choices: Vec<String>,
  pub selected_answer: String,
  pub correct_answer: Option<String>,
  pub is_correct: bool,
  pub rationale: Option<String>,
  pub correct_rationale: Option<String>,
  pub incorrect_rationales: HashMap<String, String>,
  pub topic: Option<String>,
  pub difficulty: Option<Difficulty>,
  pub source_document_id: Option<String>,
  pub source_metadata: Option<serde_json::Value>,
  pub presented_at: Option<DateTime<Utc>>,
  pub submitted_at: DateTime<Utc>,
  pub response_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionReview {
  pub summary: SessionSummary,
  pub attempts: Vec<AttemptReview>,
}

/// Coordinates quiz lifecycle, question sourcing, and grading over a shared
/// question bank. Constructed once at startup and handed to the API layer.
pub struct QuizEngine {
  store: QuizStore,
  config: EngineConfig,
  generator: Arc<dyn QuestionGenerator>,
  retriever: Option<Arc<dyn ContextRetriever>>,
}

impl QuizEngine {
  pub fn new(
    store: QuizStore,
    config: EngineConfig,
    generator: Arc<dyn QuestionGenerator>,
    retriever: Option<Arc<dyn ContextRetriever>>,
  ) -> Self {
    Self { store, config, generator, retriever }
  }

  pub fn store(&self) -> &QuizStore {
    &self.store
  }

  // ------------------------------------------------------------------
  // Quiz definition registry
  // ------------------------------------------------------------------

  #[instrument(level = "info", skip(self, input), fields(name = %input.name))]
  pub async fn upsert_definition(&self, input: UpsertDefinition) -> Result<QuizDefinition, QuizError> {
    let mut topics: Vec<String> = input
      .topics
      .iter()
      .map(|t| t.trim().to_string())
      .filter(|t| !t.is_empty())
      .collect();
    if topics.is_empty() {
      topics.push("General".into());
    }

    let default_mode = QuizMode::parse(&input.default_mode)
      .ok_or_else(|| QuizError::Validation(format!("unsupported default mode '{}'", input.default_mode)))?;
    let initial_difficulty = Difficulty::parse(&input.initial_difficulty).ok_or_else(|| {
      QuizError::Validation(format!("unsupported initial difficulty '{}'", input.initial_difficulty))
    })?;

    let quiz_id = input
      .quiz_id
      .filter(|id| !id.trim().is_empty())
      .unwrap_or_else(|| Uuid::new_v4().to_string());

    let existing = self.store.load_definition(&quiz_id).await;
    let created_at = existing.as_ref().map(|d| d.created_at).unwrap_or_else(Utc::now);

    let record = QuizDefinition {
      quiz_id: quiz_id.clone(),
      name: input.name,
      topics,
      default_mode,
      initial_difficulty,
      assessment_num_questions: input.assessment_num_questions,
      assessment_time_limit_minutes: input.assessment_time_limit_minutes,
      assessment_max_attempts: input.assessment_max_attempts,
      embedding_document_id: input.embedding_document_id,
      source_filename: input.source_filename,
      is_published: input.is_published,
      metadata: input.metadata,
      created_at,
      updated_at: Utc::now(),
    };

    // Once sessions reference a quiz its behavior is frozen; only the name,
    // publication flag, and metadata stay editable.
    if let Some(previous) = &existing {
      let structurally_changed = previous.topics != record.topics
        || previous.default_mode != record.default_mode
        || previous.initial_difficulty != record.initial_difficulty
        || previous.assessment_num_questions != record.assessment_num_questions
        || previous.assessment_time_limit_minutes != record.assessment_time_limit_minutes
        || previous.assessment_max_attempts != record.assessment_max_attempts
        || previous.embedding_document_id != record.embedding_document_id;
      if structurally_changed && self.store.quiz_has_sessions(&quiz_id).await {
        return Err(QuizError::Conflict(
          "quiz structure cannot change while sessions reference it; only name, publication, and metadata may be updated".into(),
        ));
      }
    }

    self.store.save_definition(record.clone()).await;
    info!(target: "quiz", %quiz_id, "Quiz definition saved");
    Ok(record)
  }

  pub async fn get_definition(&self, quiz_id: &str) -> Result<QuizDefinition, QuizError> {
    self
      .store
      .load_definition(quiz_id)
      .await
      .ok_or_else(|| QuizError::NotFound(format!("quiz {} not found", quiz_id)))
  }

  pub async fn list_definitions(&self) -> Vec<QuizDefinition> {
    self.store.list_definitions().await
  }

  /// Removes the definition along with its question bank and every session
  /// referencing it, in-progress ones included.
  #[instrument(level = "info", skip(self))]
  pub async fn delete_definition(&self, quiz_id: &str) -> Result<(), QuizError> {
    if !self.store.delete_definition_cascade(quiz_id).await {
      return Err(QuizError::NotFound(format!("quiz {} not found", quiz_id)));
    }
    info!(target: "quiz", %quiz_id, "Quiz definition deleted with bank and sessions");
    Ok(())
  }

  // ------------------------------------------------------------------
  // Session lifecycle
  // ------------------------------------------------------------------

  #[instrument(level = "info", skip(self, input), fields(session_id = %input.session_id, quiz_id = %input.quiz_id))]
  pub async fn start_session(&self, input: StartSession) -> Result<QuizSession, QuizError> {
    if let Some(existing) = self.store.load_session(&input.session_id).await {
      if !existing.is_terminal() {
        return Err(QuizError::Conflict(
          "a quiz session with this identifier is already in progress".into(),
        ));
      }
    }

    let definition = self.get_definition(&input.quiz_id).await?;

    let mode = match &input.mode {
      Some(raw) => QuizMode::parse(raw)
        .ok_or_else(|| QuizError::Validation(format!("unsupported quiz mode '{}'", raw)))?,
      None => definition.default_mode,
    };
    let difficulty = match &input.initial_difficulty {
      Some(raw) => Difficulty::parse(raw)
        .ok_or_else(|| QuizError::Validation(format!("unsupported difficulty '{}'", raw)))?,
      None => definition.initial_difficulty,
    };

    let now = Utc::now();
    let mut deadline = None;
    if mode == QuizMode::Assessment {
      if definition.assessment_num_questions.is_none() {
        return Err(QuizError::Validation(
          "quiz definition is missing an assessment question count".into(),
        ));
      }
      if let Some(minutes) = definition.assessment_time_limit_minutes {
        deadline = Some(now + Duration::minutes(minutes as i64));
      }
    }

    // Randomize topic order per session (not per question).
    let mut topics = definition.topics.clone();
    if topics.len() > 1 {
      topics.shuffle(&mut rand::thread_rng());
    }

    let record = QuizSession {
      session_id: input.session_id,
      quiz_id: input.quiz_id,
      user_id: input.user_id,
      mode,
      status: SessionStatus::InProgress,
      current_difficulty: difficulty,
      correct_streak: 0,
      incorrect_streak: 0,
      attempts_used: 0,
      topics,
      asked_question_ids: vec![],
      active_question_id: None,
      active_question_served_at: None,
      started_at: now,
      completed_at: None,
      deadline,
      attempts: vec![],
      is_preview: input.is_preview,
      preview_question_ids: vec![],
      used_slide_ids: vec![],
      missed_question_ids: vec![],
      questions_since_review: 0,
      total_slide_count: definition.slide_count(),
      coverage_cycles: 0,
      topic_cursor: 0,
      prefer_existing_next: true,
      max_correct_streak: 0,
      max_incorrect_streak: 0,
      cached_summary: None,
      queued_question_id: None,
    };
    self.store.save_session(record.clone()).await;
    info!(target: "quiz", session_id = %record.session_id, mode = %mode.as_str(), preview = record.is_preview, "Session started");
    Ok(record)
  }

  #[instrument(level = "info", skip(self), fields(%session_id))]
  pub async fn get_next_question(
    &self,
    session_id: &str,
    topic_override: Option<&str>,
    difficulty_override: Option<Difficulty>,
  ) -> Result<QuizQuestion, QuizError> {
    let session = self.load_session(session_id).await?;
    let mut session = self.enforce_time_constraints(session).await;

    if session.is_terminal() {
      return Err(QuizError::Closed { status: session.status });
    }

    // Outstanding question: re-serve it verbatim so retries are harmless.
    if let Some(active_id) = session.active_question_id.clone() {
      match self.store.get_question(&active_id).await {
        Some(existing) => return Ok(existing),
        None => {
          warn!(target: "quiz", %active_id, "Active question missing from bank; generating replacement");
          session.active_question_id = None;
          session.active_question_served_at = None;
        }
      }
    }

    let definition = self.get_definition(&session.quiz_id).await?;

    // Spaced review of missed questions takes priority in real sessions.
    if !session.is_preview
      && !session.missed_question_ids.is_empty()
      && session.questions_since_review >= self.config.review_gap
    {
      let missed_id = session.missed_question_ids.remove(0);
      match self.store.get_question(&missed_id).await {
        Some(original) => {
          let clone = clone_for_review(&original, &session.session_id);
          self.store.save_question(clone.clone()).await;
          record_served(&mut session, &clone);
          session.questions_since_review = 0;
          self.store.save_session(session).await;
          info!(target: "quiz", %session_id, original = %missed_id, replay = %clone.question_id, "Replaying missed question");
          return Ok(clone);
        }
        None => {
          warn!(target: "quiz", %missed_id, "Missed question vanished from bank; dropping review item");
        }
      }
    }

    let topic = resolve_topic(&mut session, topic_override);
    let bank = self.store.list_questions(&session.quiz_id).await;

    let mut selected: Option<QuizQuestion> = None;

    // Consume the pre-generated question first.
    if let Some(queued_id) = session.queued_question_id.take() {
      match self.store.get_question(&queued_id).await {
        Some(q) => selected = Some(q),
        None => warn!(target: "quiz", %queued_id, "Queued question missing from bank; ignoring"),
      }
    }

    if selected.is_none() && session.prefer_existing_next {
      selected = pick_unused(&bank, &session, &topic);
    }

    let selected = match selected {
      Some(question) => question,
      None => {
        let order = bank.len() as u32 + 1;
        self
          .generate_question(&mut session, &definition, &topic, difficulty_override, order)
          .await?
      }
    };

    record_served(&mut session, &selected);
    session.questions_since_review = session.questions_since_review.saturating_add(1);
    if session.is_preview {
      // Preview mode follows the generated content instead of driving it.
      session.current_difficulty = selected.difficulty;
    }

    // Decide where the next question should come from, and pre-generate it
    // when nothing reusable is left; a failure here only costs latency later.
    let bank = self.store.list_questions(&session.quiz_id).await;
    session.prefer_existing_next = has_unused(&bank, &session);
    if !session.prefer_existing_next && session.queued_question_id.is_none() {
      let next_topic = peek_topic(&session);
      let order = bank.len() as u32 + 1;
      match self
        .generate_question(&mut session, &definition, &next_topic, None, order)
        .await
      {
        Ok(question) => {
          session.queued_question_id = Some(question.question_id);
        }
        Err(e) => {
          warn!(target: "quiz", %session_id, error = %e, "Pre-generation failed; will generate on demand");
        }
      }
    }

    self.store.save_session(session).await;
    info!(target: "quiz", %session_id, question_id = %selected.question_id, topic = %selected.topic, "Question served");
    Ok(selected)
  }

  #[instrument(level = "info", skip(self, selected_answer), fields(%session_id, %question_id))]
  pub async fn submit_answer(
    &self,
    session_id: &str,
    question_id: &str,
    selected_answer: &str,
  ) -> Result<AnswerOutcome, QuizError> {
    let session = self.load_session(session_id).await?;
    let mut session = self.enforce_time_constraints(session).await;

    if session.is_terminal() {
      return Err(QuizError::Closed { status: session.status });
    }

    let question = self
      .store
      .get_question(question_id)
      .await
      .ok_or_else(|| QuizError::NotFound("question not found in the shared bank".into()))?;

    if session.has_answered(question_id) {
      return Err(QuizError::Validation(
        "this question has already been answered in this session".into(),
      ));
    }

    let now = Utc::now();
    let is_correct = selected_answer == question.correct_answer;
    let rationale_shown = if is_correct {
      question.rationale.clone()
    } else {
      question
        .incorrect_rationales
        .get(selected_answer)
        .cloned()
        .unwrap_or_else(|| question.rationale.clone())
    };

    let presented_at = session.active_question_served_at;
    let response_ms = presented_at.map(|served| (now - served).num_milliseconds().max(0));

    session.attempts.push(QuizAttempt {
      question_id: question.question_id.clone(),
      selected_answer: selected_answer.to_string(),
      is_correct,
      submitted_at: now,
      response_ms,
      rationale: Some(rationale_shown.clone()),
      presented_at,
    });
    session.attempts_used += 1;

    // Raw streak update happens before any difficulty adaptation.
    if is_correct {
      session.correct_streak += 1;
      session.incorrect_streak = 0;
    } else {
      session.incorrect_streak += 1;
      session.correct_streak = 0;
    }
    session.max_correct_streak = session.max_correct_streak.max(session.correct_streak);
    session.max_incorrect_streak = session.max_incorrect_streak.max(session.incorrect_streak);

    // Missed-question queue: a correct answer clears the debt, an incorrect
    // one queues the question for spaced replay.
    if is_correct {
      session.missed_question_ids.retain(|id| id != question_id);
    } else if !session.missed_question_ids.iter().any(|id| id == question_id) {
      session.missed_question_ids.push(question_id.to_string());
    }

    if session.mode == QuizMode::Practice {
      let current = session.current_difficulty;
      let adapted =
        adapt_difficulty(current, session.correct_streak, session.incorrect_streak, &self.config);
      if adapted != current {
        // Crossing a level consumed the streak that caused it.
        if adapted.rank() > current.rank() {
          session.correct_streak = 0;
        } else {
          session.incorrect_streak = 0;
        }
        session.current_difficulty = adapted;
      }
      if is_correct {
        session.incorrect_streak = 0;
      } else {
        session.correct_streak = 0;
      }
    }

    session.active_question_id = None;
    session.active_question_served_at = None;

    // Assessment termination, in order: question count, attempt cap, deadline.
    if session.mode == QuizMode::Assessment {
      let definition = self.get_definition(&session.quiz_id).await?;
      if definition
        .assessment_num_questions
        .is_some_and(|n| n > 0 && session.attempts.len() as u32 >= n)
      {
        session = self.close_session(session, SessionStatus::Completed).await;
      } else if definition
        .assessment_max_attempts
        .is_some_and(|cap| session.attempts_used >= cap)
      {
        session = self.close_session(session, SessionStatus::Completed).await;
      } else if session.deadline.is_some_and(|deadline| Utc::now() > deadline) {
        session = self.close_session(session, SessionStatus::TimedOut).await;
      }
    }

    self.store.save_session(session.clone()).await;
    info!(target: "quiz", %session_id, %question_id, %is_correct, completed = session.is_terminal(), "Answer recorded");

    Ok(AnswerOutcome {
      question_id: question.question_id.clone(),
      is_correct,
      selected_answer: selected_answer.to_string(),
      correct_answer: question.correct_answer.clone(),
      rationale: rationale_shown,
      correct_rationale: question.rationale.clone(),
      incorrect_rationales: question.incorrect_rationales.clone(),
      topic: question.topic.clone(),
      difficulty: question.difficulty,
      session_completed: session.is_terminal(),
      current_difficulty: session.current_difficulty,
      response_ms,
      summary: session.cached_summary.clone(),
    })
  }

  /// Force-completes an in-progress session and returns its summary. Preview
  /// sessions are deleted along with their generated questions; sessions that
  /// never recorded an attempt are discarded outright.
  #[instrument(level = "info", skip(self), fields(%session_id))]
  pub async fn end_session(&self, session_id: &str) -> Result<SessionSummary, QuizError> {
    let mut session = self.load_session(session_id).await?;
    if !session.is_terminal() {
      session = self.close_session(session, SessionStatus::Completed).await;
    }
    let summary = match session.cached_summary.clone() {
      Some(summary) => summary,
      None => build_summary(&self.store, &session).await,
    };

    if session.is_preview {
      for qid in &session.preview_question_ids {
        self.store.delete_question(qid).await;
      }
      self.store.delete_session(&session.session_id).await;
      info!(target: "quiz", %session_id, removed_questions = session.preview_question_ids.len(), "Preview session cleaned up");
    } else if session.attempts.is_empty() {
      self.store.delete_session(&session.session_id).await;
      info!(target: "quiz", %session_id, "Empty session discarded");
    } else {
      session.cached_summary = Some(summary.clone());
      self.store.save_session(session).await;
    }
    Ok(summary)
  }

  // ------------------------------------------------------------------
  // Review / history / deletion
  // ------------------------------------------------------------------

  /// Finished, non-preview sessions for one learner on one quiz, newest
  /// first, each with its cached or recomputed summary.
  pub async fn list_session_history(
    &self,
    quiz_id: &str,
    user_id: &str,
    limit: Option<usize>,
  ) -> Vec<SessionSummary> {
    let mut sessions: Vec<QuizSession> = self
      .store
      .list_sessions(quiz_id, user_id)
      .await
      .into_iter()
      .filter(|s| !s.is_preview && s.is_terminal())
      .collect();
    sessions.sort_by_key(|s| std::cmp::Reverse(s.completed_at.unwrap_or(s.started_at)));
    if let Some(limit) = limit {
      sessions.truncate(limit);
    }

    let mut summaries = Vec::with_capacity(sessions.len());
    for session in &sessions {
      match session.cached_summary.clone() {
        Some(summary) => summaries.push(summary),
        None => summaries.push(build_summary(&self.store, session).await),
      }
    }
    summaries
  }

  /// Summary plus full per-attempt detail. Only the owning learner may look.
  pub async fn get_session_review(
    &self,
    session_id: &str,
    user_id: &str,
  ) -> Result<SessionReview, QuizError> {
    let session = self.load_session(session_id).await?;
    if session.user_id != user_id {
      return Err(QuizError::Forbidden("session belongs to a different learner".into()));
    }

    let summary = match session.cached_summary.clone() {
      Some(summary) => summary,
      None => build_summary(&self.store, &session).await,
    };

    let mut attempts = Vec::with_capacity(session.attempts.len());
    for attempt in &session.attempts {
      let question = self.store.get_question(&attempt.question_id).await;
      attempts.push(AttemptReview {
        question_id: attempt.question_id.clone(),
        prompt: question.as_ref().map(|q| q.prompt.clone()),
        choices: question.as_ref().map(|q| q.choices.clone()).unwrap_or_default(),
        selected_answer: attempt.selected_answer.clone(),
        correct_answer: question.as_ref().map(|q| q.correct_answer.clone()),
        is_correct: attempt.is_correct,
        rationale: attempt.rationale.clone(),
        correct_rationale: question.as_ref().map(|q| q.rationale.clone()),
        incorrect_rationales: question
          .as_ref()
          .map(|q| q.incorrect_rationales.clone())
          .unwrap_or_default(),
        topic: question.as_ref().map(|q| q.topic.clone()),
        difficulty: question.as_ref().map(|q| q.difficulty),
        source_document_id: question.as_ref().and_then(|q| q.source_document_id.clone()),
        source_metadata: question.as_ref().and_then(|q| q.source_metadata.clone()),
        presented_at: attempt.presented_at,
        submitted_at: attempt.submitted_at,
        response_ms: attempt.response_ms,
      });
    }

    Ok(SessionReview { summary, attempts })
  }

  /// Preview-only deletion path: removes the session and every question it
  /// generated. Non-preview sessions are rejected here.
  #[instrument(level = "info", skip(self), fields(%session_id))]
  pub async fn delete_preview_session(&self, session_id: &str) -> Result<(), QuizError> {
    let session = self.load_session(session_id).await?;
    if !session.is_preview {
      return Err(QuizError::Conflict(
        "only preview sessions can be deleted through this path".into(),
      ));
    }
    for qid in &session.preview_question_ids {
      self.store.delete_question(qid).await;
    }
    self.store.delete_session(session_id).await;
    info!(target: "quiz", %session_id, "Preview session deleted");
    Ok(())
  }

  /// Owner-gated deletion of a finished session's record.
  #[instrument(level = "info", skip(self), fields(%session_id))]
  pub async fn delete_session_record(&self, session_id: &str, user_id: &str) -> Result<(), QuizError> {
    let session = self.load_session(session_id).await?;
    if session.user_id != user_id {
      return Err(QuizError::Forbidden("session belongs to a different learner".into()));
    }
    if !session.is_terminal() {
      return Err(QuizError::Conflict("session is still in progress".into()));
    }
    self.store.delete_session(session_id).await;
    Ok(())
  }

  // ------------------------------------------------------------------
  // Helpers
  // ------------------------------------------------------------------

  async fn load_session(&self, session_id: &str) -> Result<QuizSession, QuizError> {
    self
      .store
      .load_session(session_id)
      .await
      .ok_or_else(|| QuizError::NotFound(format!("quiz session {} not found", session_id)))
  }

  /// Assessment sessions past their deadline are force-completed before
  /// anything else happens; the transition is persisted immediately.
  async fn enforce_time_constraints(&self, session: QuizSession) -> QuizSession {
    if session.mode != QuizMode::Assessment || session.is_terminal() {
      return session;
    }
    match session.deadline {
      Some(deadline) if Utc::now() > deadline => {
        let session = self.close_session(session, SessionStatus::TimedOut).await;
        self.store.save_session(session.clone()).await;
        info!(target: "quiz", session_id = %session.session_id, "Assessment deadline passed; session timed out");
        session
      }
      _ => session,
    }
  }

  /// Transition to a terminal status and cache the summary.
  async fn close_session(&self, mut session: QuizSession, status: SessionStatus) -> QuizSession {
    session.status = status;
    session.completed_at = Some(Utc::now());
    session.active_question_id = None;
    session.active_question_served_at = None;
    session.cached_summary = Some(build_summary(&self.store, &session).await);
    session
  }

  /// Generate, persist, and register one fresh question for this session.
  /// Retrieval failures degrade to ungrounded generation; generator failures
  /// surface to the caller, with no session mutation persisted.
  async fn generate_question(
    &self,
    session: &mut QuizSession,
    definition: &QuizDefinition,
    topic: &str,
    difficulty_override: Option<Difficulty>,
    order: u32,
  ) -> Result<QuizQuestion, QuizError> {
    let difficulty = difficulty_override.unwrap_or(session.current_difficulty);
    let fetch = self.fetch_contexts(session, definition, topic, difficulty).await;

    let generated = self
      .generator
      .generate(topic, difficulty, order, &fetch.contexts)
      .await
      .map_err(|e| {
        error!(target: "quiz", quiz_id = %session.quiz_id, %topic, error = %e, "Question generation failed");
        QuizError::GenerationUnavailable(e.to_string())
      })?;

    let question = QuizQuestion {
      question_id: Uuid::new_v4().to_string(),
      quiz_id: session.quiz_id.clone(),
      prompt: generated.prompt,
      choices: generated.choices,
      correct_answer: generated.correct_answer,
      rationale: generated.rationale,
      incorrect_rationales: generated.incorrect_rationales,
      topic: topic.to_string(),
      difficulty,
      order,
      generated_at: Utc::now(),
      origin_session_id: Some(session.session_id.clone()),
      source_document_id: definition.embedding_document_id.clone(),
      source_metadata: generated.source_metadata,
    };
    self.store.save_question(question.clone()).await;

    if session.is_preview {
      session.preview_question_ids.push(question.question_id.clone());
    }

    if fetch.coverage_reset_needed {
      session.used_slide_ids.clear();
      session.coverage_cycles += 1;
      info!(target: "quiz", session_id = %session.session_id, cycle = session.coverage_cycles, "Coverage exclusion reset");
    }
    if let Some(slide_id) = question.source_slide_id() {
      if !session.used_slide_ids.contains(&slide_id) {
        session.used_slide_ids.push(slide_id);
      }
    }

    Ok(question)
  }

  async fn fetch_contexts(
    &self,
    session: &QuizSession,
    definition: &QuizDefinition,
    topic: &str,
    difficulty: Difficulty,
  ) -> ContextFetch {
    let (Some(retriever), Some(document_id)) =
      (self.retriever.as_ref(), definition.embedding_document_id.as_deref())
    else {
      return ContextFetch::default();
    };

    match retriever
      .fetch(
        document_id,
        topic,
        difficulty,
        &session.used_slide_ids,
        session.total_slide_count,
        self.config.coverage_reset_threshold,
        self.config.context_sample_size,
      )
      .await
    {
      Ok(fetch) => fetch,
      Err(e) => {
        warn!(target: "quiz", %document_id, error = %e, "Context retrieval failed; generating ungrounded");
        ContextFetch::default()
      }
    }
  }
}

/// Promote on a long-enough correct streak, demote on a long-enough
/// incorrect streak, exactly one level per evaluation, never past the edges.
fn adapt_difficulty(
  current: Difficulty,
  correct_streak: u32,
  incorrect_streak: u32,
  config: &EngineConfig,
) -> Difficulty {
  if correct_streak >= config.practice_increase_streak && current != Difficulty::Hard {
    return current.one_harder();
  }
  if incorrect_streak >= config.practice_decrease_streak && current != Difficulty::Easy {
    return current.one_easier();
  }
  current
}

fn record_served(session: &mut QuizSession, question: &QuizQuestion) {
  session.asked_question_ids.push(question.question_id.clone());
  session.active_question_id = Some(question.question_id.clone());
  session.active_question_served_at = Some(Utc::now());
}

/// Round-robin topic resolution; an explicit override never moves the cursor.
fn resolve_topic(session: &mut QuizSession, topic_override: Option<&str>) -> String {
  if let Some(topic) = topic_override {
    return topic.to_string();
  }
  if session.topics.is_empty() {
    return "General".into();
  }
  let topic = session.topics[session.topic_cursor % session.topics.len()].clone();
  session.topic_cursor = session.topic_cursor.wrapping_add(1);
  topic
}

/// Topic the next rotation step would pick, without moving the cursor.
fn peek_topic(session: &QuizSession) -> String {
  if session.topics.is_empty() {
    return "General".into();
  }
  session.topics[session.topic_cursor % session.topics.len()].clone()
}

/// First unused bank question matching the topic, else any unused one.
fn pick_unused(bank: &[QuizQuestion], session: &QuizSession, topic: &str) -> Option<QuizQuestion> {
  let unused = |q: &&QuizQuestion| !session.has_asked(&q.question_id);
  bank
    .iter()
    .filter(unused)
    .find(|q| q.topic == topic)
    .or_else(|| bank.iter().find(unused))
    .cloned()
}

fn has_unused(bank: &[QuizQuestion], session: &QuizSession) -> bool {
  bank.iter().any(|q| !session.has_asked(&q.question_id))
}

/// Duplicate a missed question under a fresh id so the review attempt is
/// tracked independently of the original.
fn clone_for_review(original: &QuizQuestion, session_id: &str) -> QuizQuestion {
  QuizQuestion {
    question_id: Uuid::new_v4().to_string(),
    generated_at: Utc::now(),
    origin_session_id: Some(session_id.to_string()),
    ..original.clone()
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  use async_trait::async_trait;
  use serde_json::json;

  use super::*;
  use crate::generator::{GeneratedQuestion, GenerationError};
  use crate::retriever::{RetrievalError, RetrievedContext};

  /// Deterministic generator producing numbered questions; the first choice
  /// is always the correct one.
  #[derive(Default)]
  struct CountingGenerator {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl QuestionGenerator for CountingGenerator {
    async fn generate(
      &self,
      topic: &str,
      _difficulty: Difficulty,
      _order: u32,
      contexts: &[RetrievedContext],
    ) -> Result<GeneratedQuestion, GenerationError> {
      let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      let correct = format!("Correct {n}");
      let wrong_a = format!("Wrong A {n}");
      let wrong_b = format!("Wrong B {n}");
      Ok(GeneratedQuestion {
        prompt: format!("Question {n} on {topic}"),
        choices: vec![correct.clone(), wrong_a.clone(), wrong_b.clone()],
        correct_answer: correct,
        rationale: format!("Rationale {n}"),
        incorrect_rationales: HashMap::from([
          (wrong_a, format!("Wrong A rationale {n}")),
          (wrong_b, format!("Wrong B rationale {n}")),
        ]),
        source_metadata: contexts.first().map(|c| c.metadata.clone()),
      })
    }
  }

  struct FailingGenerator;

  #[async_trait]
  impl QuestionGenerator for FailingGenerator {
    async fn generate(
      &self,
      _topic: &str,
      _difficulty: Difficulty,
      _order: u32,
      _contexts: &[RetrievedContext],
    ) -> Result<GeneratedQuestion, GenerationError> {
      Err(GenerationError::Upstream("model down".into()))
    }
  }

  /// Replays a scripted sequence of retrieval results, then empty fetches.
  struct ScriptedRetriever {
    results: Mutex<VecDeque<Result<ContextFetch, RetrievalError>>>,
  }

  impl ScriptedRetriever {
    fn new(results: Vec<Result<ContextFetch, RetrievalError>>) -> Self {
      Self { results: Mutex::new(results.into()) }
    }
  }

  #[async_trait]
  impl ContextRetriever for ScriptedRetriever {
    async fn fetch(
      &self,
      _document_id: &str,
      _topic: &str,
      _difficulty: Difficulty,
      _exclude_slide_ids: &[String],
      _total_slide_count: Option<u32>,
      _coverage_threshold: f32,
      _sample_size: usize,
    ) -> Result<ContextFetch, RetrievalError> {
      let next = self.results.lock().unwrap().pop_front();
      next.unwrap_or_else(|| Ok(ContextFetch::default()))
    }
  }

  fn test_config() -> EngineConfig {
    EngineConfig {
      practice_increase_streak: 3,
      practice_decrease_streak: 3,
      review_gap: 2,
      coverage_reset_threshold: 0.8,
      context_sample_size: 4,
    }
  }

  fn engine_with(
    generator: Arc<dyn QuestionGenerator>,
    retriever: Option<Arc<dyn ContextRetriever>>,
  ) -> QuizEngine {
    QuizEngine::new(QuizStore::new(), test_config(), generator, retriever)
  }

  fn counting_engine() -> (QuizEngine, Arc<CountingGenerator>) {
    let generator = Arc::new(CountingGenerator::default());
    (engine_with(generator.clone(), None), generator)
  }

  async fn seed_definition(
    engine: &QuizEngine,
    quiz_id: &str,
    mode: &str,
    topics: &[&str],
    num_questions: Option<u32>,
  ) -> QuizDefinition {
    engine
      .upsert_definition(UpsertDefinition {
        quiz_id: Some(quiz_id.into()),
        name: format!("{quiz_id}-name"),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        default_mode: mode.into(),
        initial_difficulty: "medium".into(),
        assessment_num_questions: num_questions,
        ..Default::default()
      })
      .await
      .expect("definition")
  }

  async fn start(
    engine: &QuizEngine,
    session_id: &str,
    quiz_id: &str,
    is_preview: bool,
  ) -> QuizSession {
    engine
      .start_session(StartSession {
        session_id: session_id.into(),
        quiz_id: quiz_id.into(),
        user_id: "learner-1".into(),
        mode: None,
        initial_difficulty: None,
        is_preview,
      })
      .await
      .expect("session")
  }

  async fn answer(
    engine: &QuizEngine,
    session_id: &str,
    question: &QuizQuestion,
    correct: bool,
  ) -> AnswerOutcome {
    let choice = if correct {
      question.correct_answer.clone()
    } else {
      question
        .choices
        .iter()
        .find(|c| **c != question.correct_answer)
        .cloned()
        .expect("distractor")
    };
    engine
      .submit_answer(session_id, &question.question_id, &choice)
      .await
      .expect("answer accepted")
  }

  fn bank_question(quiz_id: &str, question_id: &str, difficulty: Difficulty) -> QuizQuestion {
    QuizQuestion {
      question_id: question_id.into(),
      quiz_id: quiz_id.into(),
      prompt: format!("Seeded {question_id}"),
      choices: vec!["yes".into(), "no".into()],
      correct_answer: "yes".into(),
      rationale: "it is".into(),
      incorrect_rationales: HashMap::from([("no".to_string(), "it is not".to_string())]),
      topic: "algebra".into(),
      difficulty,
      order: 1,
      generated_at: Utc::now(),
      origin_session_id: None,
      source_document_id: None,
      source_metadata: None,
    }
  }

  // ---- registry ----

  #[tokio::test]
  async fn upsert_defaults_blank_topics_to_general_and_generates_an_id() {
    let (engine, _) = counting_engine();
    let definition = engine
      .upsert_definition(UpsertDefinition {
        quiz_id: None,
        name: "untitled".into(),
        topics: vec!["   ".into(), "".into()],
        default_mode: "practice".into(),
        initial_difficulty: "medium".into(),
        ..Default::default()
      })
      .await
      .expect("definition");
    assert_eq!(definition.topics, vec!["General".to_string()]);
    assert!(!definition.quiz_id.is_empty());
  }

  #[tokio::test]
  async fn upsert_rejects_unknown_mode_and_difficulty() {
    let (engine, _) = counting_engine();
    let bad_mode = engine
      .upsert_definition(UpsertDefinition {
        name: "x".into(),
        default_mode: "exam".into(),
        initial_difficulty: "medium".into(),
        ..Default::default()
      })
      .await;
    assert!(matches!(bad_mode, Err(QuizError::Validation(_))));

    let bad_difficulty = engine
      .upsert_definition(UpsertDefinition {
        name: "x".into(),
        default_mode: "practice".into(),
        initial_difficulty: "brutal".into(),
        ..Default::default()
      })
      .await;
    assert!(matches!(bad_difficulty, Err(QuizError::Validation(_))));
  }

  #[tokio::test]
  async fn upsert_preserves_created_at_and_list_orders_by_update() {
    let (engine, _) = counting_engine();
    let first = seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    seed_definition(&engine, "quiz-b", "practice", &["geometry"], None).await;

    let updated = engine
      .upsert_definition(UpsertDefinition {
        quiz_id: Some("quiz-a".into()),
        name: "renamed".into(),
        topics: vec!["algebra".into()],
        default_mode: "practice".into(),
        initial_difficulty: "medium".into(),
        ..Default::default()
      })
      .await
      .expect("update");
    assert_eq!(updated.created_at, first.created_at);
    assert!(updated.updated_at >= first.updated_at);
    assert_eq!(updated.name, "renamed");

    let listed = engine.list_definitions().await;
    assert_eq!(listed[0].quiz_id, "quiz-a");
    assert_eq!(listed[1].quiz_id, "quiz-b");
  }

  #[tokio::test]
  async fn upsert_freezes_structure_once_sessions_exist() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let structural = engine
      .upsert_definition(UpsertDefinition {
        quiz_id: Some("quiz-a".into()),
        name: "quiz-a-name".into(),
        topics: vec!["geometry".into()],
        default_mode: "practice".into(),
        initial_difficulty: "medium".into(),
        ..Default::default()
      })
      .await;
    assert!(matches!(structural, Err(QuizError::Conflict(_))));

    // Cosmetic fields stay editable.
    let cosmetic = engine
      .upsert_definition(UpsertDefinition {
        quiz_id: Some("quiz-a".into()),
        name: "renamed".into(),
        topics: vec!["algebra".into()],
        default_mode: "practice".into(),
        initial_difficulty: "medium".into(),
        is_published: true,
        ..Default::default()
      })
      .await
      .expect("cosmetic update");
    assert!(cosmetic.is_published);
  }

  #[tokio::test]
  async fn delete_definition_cascades_to_bank_and_sessions() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;
    engine.get_next_question("s-1", None, None).await.expect("question");

    engine.delete_definition("quiz-a").await.expect("deleted");
    assert!(matches!(engine.get_definition("quiz-a").await, Err(QuizError::NotFound(_))));
    assert!(engine.store().load_session("s-1").await.is_none());
    assert!(engine.store().list_questions("quiz-a").await.is_empty());

    assert!(matches!(engine.delete_definition("quiz-a").await, Err(QuizError::NotFound(_))));
  }

  // ---- session lifecycle ----

  #[tokio::test]
  async fn start_conflicts_while_in_progress_and_requires_a_definition() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let conflict = engine
      .start_session(StartSession {
        session_id: "s-1".into(),
        quiz_id: "quiz-a".into(),
        user_id: "learner-1".into(),
        mode: None,
        initial_difficulty: None,
        is_preview: false,
      })
      .await;
    assert!(matches!(conflict, Err(QuizError::Conflict(_))));

    let missing = engine
      .start_session(StartSession {
        session_id: "s-2".into(),
        quiz_id: "nope".into(),
        user_id: "learner-1".into(),
        mode: None,
        initial_difficulty: None,
        is_preview: false,
      })
      .await;
    assert!(matches!(missing, Err(QuizError::NotFound(_))));
  }

  #[tokio::test]
  async fn assessment_start_requires_a_question_count() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    let result = engine
      .start_session(StartSession {
        session_id: "s-1".into(),
        quiz_id: "quiz-a".into(),
        user_id: "learner-1".into(),
        mode: Some("assessment".into()),
        initial_difficulty: None,
        is_preview: false,
      })
      .await;
    assert!(matches!(result, Err(QuizError::Validation(_))));
  }

  #[tokio::test]
  async fn assessment_completes_exactly_on_the_final_attempt() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "assessment", &["algebra"], Some(2)).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let q1 = engine.get_next_question("s-1", None, None).await.expect("q1");
    let first = answer(&engine, "s-1", &q1, true).await;
    assert!(first.is_correct);
    assert!(!first.session_completed);

    let q2 = engine.get_next_question("s-1", None, None).await.expect("q2");
    let second = answer(&engine, "s-1", &q2, true).await;
    assert!(second.session_completed);
    let summary = second.summary.expect("summary");
    assert_eq!(summary.total_questions, 2);
    assert_eq!(summary.status, SessionStatus::Completed);

    match engine.get_next_question("s-1", None, None).await {
      Err(QuizError::Closed { status }) => assert_eq!(status, SessionStatus::Completed),
      other => panic!("expected Closed, got {:?}", other.map(|q| q.question_id)),
    }

    // Attempt log stays consistent with the usage counter.
    let session = engine.store().load_session("s-1").await.expect("session");
    assert_eq!(session.attempts.len() as u32, session.attempts_used);
    let mut ids: Vec<_> = session.attempts.iter().map(|a| a.question_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), session.attempts.len());
  }

  #[tokio::test]
  async fn next_question_is_idempotent_until_answered() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let first = engine.get_next_question("s-1", None, None).await.expect("q");
    let second = engine.get_next_question("s-1", None, None).await.expect("q");
    assert_eq!(first.question_id, second.question_id);

    let session = engine.store().load_session("s-1").await.expect("session");
    assert_eq!(session.asked_question_ids.len(), 1);
  }

  #[tokio::test]
  async fn answers_reject_unknown_questions_and_duplicates() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let unknown = engine.submit_answer("s-1", "bogus", "anything").await;
    assert!(matches!(unknown, Err(QuizError::NotFound(_))));

    let q = engine.get_next_question("s-1", None, None).await.expect("q");
    answer(&engine, "s-1", &q, true).await;
    let duplicate = engine.submit_answer("s-1", &q.question_id, &q.correct_answer).await;
    assert!(matches!(duplicate, Err(QuizError::Validation(_))));
  }

  // ---- difficulty adaptation ----

  #[tokio::test]
  async fn practice_promotes_after_the_configured_streak() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    for round in 1..=3 {
      let q = engine.get_next_question("s-1", None, None).await.expect("q");
      let outcome = answer(&engine, "s-1", &q, true).await;
      if round < 3 {
        assert_eq!(outcome.current_difficulty, Difficulty::Medium, "round {round}");
      } else {
        assert_eq!(outcome.current_difficulty, Difficulty::Hard);
      }
    }

    // Crossing the level consumed the streak that caused it.
    let session = engine.store().load_session("s-1").await.expect("session");
    assert_eq!(session.correct_streak, 0);
    assert_eq!(session.max_correct_streak, 3);
  }

  #[tokio::test]
  async fn practice_demotes_one_level_and_saturates_at_easy() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    for round in 1..=6 {
      let q = engine.get_next_question("s-1", None, None).await.expect("q");
      let outcome = answer(&engine, "s-1", &q, false).await;
      match round {
        1 | 2 => assert_eq!(outcome.current_difficulty, Difficulty::Medium),
        _ => assert_eq!(outcome.current_difficulty, Difficulty::Easy, "round {round}"),
      }
    }
  }

  // ---- missed-question review ----

  #[tokio::test]
  async fn missed_question_replays_as_a_clone_after_the_gap() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let q1 = engine.get_next_question("s-1", None, None).await.expect("q1");
    answer(&engine, "s-1", &q1, false).await;

    // Gap of 2 not reached yet (only q1 served), so a fresh question comes next.
    let q2 = engine.get_next_question("s-1", None, None).await.expect("q2");
    assert_ne!(q2.prompt, q1.prompt);
    answer(&engine, "s-1", &q2, true).await;

    let replay = engine.get_next_question("s-1", None, None).await.expect("replay");
    assert_eq!(replay.prompt, q1.prompt);
    assert_ne!(replay.question_id, q1.question_id);

    let session = engine.store().load_session("s-1").await.expect("session");
    assert!(session.missed_question_ids.is_empty());
    assert_eq!(session.questions_since_review, 0);
  }

  #[tokio::test]
  async fn correct_answer_clears_a_queued_miss() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let q1 = engine.get_next_question("s-1", None, None).await.expect("q1");
    let mut session = engine.store().load_session("s-1").await.expect("session");
    session.missed_question_ids.push(q1.question_id.clone());
    engine.store().save_session(session).await;

    answer(&engine, "s-1", &q1, true).await;
    let session = engine.store().load_session("s-1").await.expect("session");
    assert!(session.missed_question_ids.is_empty());
  }

  // ---- preview sessions ----

  #[tokio::test]
  async fn ending_a_preview_deletes_it_and_its_generated_questions() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "p-1", "quiz-a", true).await;

    engine.get_next_question("p-1", None, None).await.expect("q");
    let session = engine.store().load_session("p-1").await.expect("session");
    assert!(!session.preview_question_ids.is_empty());

    engine.end_session("p-1").await.expect("summary");
    assert!(engine.store().load_session("p-1").await.is_none());
    assert!(engine.store().list_questions("quiz-a").await.is_empty());
  }

  #[tokio::test]
  async fn preview_difficulty_mirrors_the_served_question() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    engine.store().save_question(bank_question("quiz-a", "q-hard", Difficulty::Hard)).await;
    let session = start(&engine, "p-1", "quiz-a", true).await;
    assert_eq!(session.current_difficulty, Difficulty::Medium);

    let served = engine.get_next_question("p-1", None, None).await.expect("q");
    assert_eq!(served.question_id, "q-hard");
    let session = engine.store().load_session("p-1").await.expect("session");
    assert_eq!(session.current_difficulty, Difficulty::Hard);
  }

  // ---- question sourcing ----

  #[tokio::test]
  async fn bank_questions_are_reused_across_sessions() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;
    let q1 = engine.get_next_question("s-1", None, None).await.expect("q1");

    start(&engine, "s-2", "quiz-a", false).await;
    let reused = engine.get_next_question("s-2", None, None).await.expect("reused");
    assert_eq!(reused.question_id, q1.question_id);
  }

  #[tokio::test]
  async fn queued_pregenerated_question_is_served_next() {
    let (engine, generator) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let q1 = engine.get_next_question("s-1", None, None).await.expect("q1");
    // One generation for the served question plus one pre-generated spare.
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    let queued = engine
      .store()
      .load_session("s-1")
      .await
      .expect("session")
      .queued_question_id
      .expect("queued");

    answer(&engine, "s-1", &q1, true).await;
    let q2 = engine.get_next_question("s-1", None, None).await.expect("q2");
    assert_eq!(q2.question_id, queued);
    // Serving the spare triggered only the next round of pre-generation.
    assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn topics_rotate_round_robin_and_overrides_pin_without_advancing() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["alpha", "beta"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let mut topics = Vec::new();
    for _ in 0..4 {
      let q = engine.get_next_question("s-1", None, None).await.expect("q");
      topics.push(q.topic.clone());
      answer(&engine, "s-1", &q, true).await;
    }
    assert_ne!(topics[0], topics[1]);
    assert_eq!(topics[2], topics[0]);
    assert_eq!(topics[3], topics[1]);

    // A fresh quiz with an empty bank, so the override drives generation.
    seed_definition(&engine, "quiz-b", "practice", &["alpha", "beta"], None).await;
    start(&engine, "s-2", "quiz-b", false).await;
    let pinned = engine.get_next_question("s-2", Some("gamma"), None).await.expect("q");
    assert_eq!(pinned.topic, "gamma");
    let session = engine.store().load_session("s-2").await.expect("session");
    assert_eq!(session.topic_cursor, 0);
  }

  #[tokio::test]
  async fn generation_failure_surfaces_without_mutating_the_session() {
    let engine = engine_with(Arc::new(FailingGenerator), None);
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let result = engine.get_next_question("s-1", None, None).await;
    assert!(matches!(result, Err(QuizError::GenerationUnavailable(_))));

    let session = engine.store().load_session("s-1").await.expect("session");
    assert!(session.asked_question_ids.is_empty());
    assert!(session.active_question_id.is_none());
  }

  #[tokio::test]
  async fn retrieval_failure_degrades_to_ungrounded_generation() {
    let retriever = Arc::new(ScriptedRetriever::new(vec![Err(RetrievalError::Transport(
      "index offline".into(),
    ))]));
    let generator = Arc::new(CountingGenerator::default());
    let engine = engine_with(generator, Some(retriever));
    engine
      .upsert_definition(UpsertDefinition {
        quiz_id: Some("quiz-a".into()),
        name: "grounded".into(),
        topics: vec!["algebra".into()],
        default_mode: "practice".into(),
        initial_difficulty: "medium".into(),
        embedding_document_id: Some("doc-1".into()),
        ..Default::default()
      })
      .await
      .expect("definition");
    start(&engine, "s-1", "quiz-a", false).await;

    let q = engine.get_next_question("s-1", None, None).await.expect("question");
    assert!(q.source_metadata.is_none());
  }

  #[tokio::test]
  async fn coverage_registers_slides_and_resets_on_signal() {
    let retriever = Arc::new(ScriptedRetriever::new(vec![
      Ok(ContextFetch {
        contexts: vec![RetrievedContext {
          text: "slide one".into(),
          metadata: json!({"slide_id": "s-1", "slide_number": 1}),
        }],
        coverage_reset_needed: false,
      }),
      Ok(ContextFetch {
        contexts: vec![RetrievedContext {
          text: "slide two".into(),
          metadata: json!({"slide_id": "s-2", "slide_number": 2}),
        }],
        coverage_reset_needed: true,
      }),
    ]));
    let generator = Arc::new(CountingGenerator::default());
    let engine = engine_with(generator, Some(retriever));
    engine
      .upsert_definition(UpsertDefinition {
        quiz_id: Some("quiz-a".into()),
        name: "grounded".into(),
        topics: vec!["algebra".into()],
        default_mode: "practice".into(),
        initial_difficulty: "medium".into(),
        embedding_document_id: Some("doc-1".into()),
        metadata: Some(json!({"slide_count": 2})),
        ..Default::default()
      })
      .await
      .expect("definition");

    let session = start(&engine, "s-1", "quiz-a", false).await;
    assert_eq!(session.total_slide_count, Some(2));

    // First call generates the served question (slide s-1) and pre-generates
    // the spare (slide s-2, reset signalled): the used set holds only s-2.
    engine.get_next_question("s-1", None, None).await.expect("question");
    let session = engine.store().load_session("s-1").await.expect("session");
    assert_eq!(session.coverage_cycles, 1);
    assert_eq!(session.used_slide_ids, vec!["s-2".to_string()]);
  }

  // ---- deadlines ----

  #[tokio::test]
  async fn past_deadline_times_the_session_out_before_serving() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "assessment", &["algebra"], Some(5)).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let mut session = engine.store().load_session("s-1").await.expect("session");
    session.deadline = Some(Utc::now() - Duration::seconds(1));
    engine.store().save_session(session).await;

    match engine.get_next_question("s-1", None, None).await {
      Err(QuizError::Closed { status }) => assert_eq!(status, SessionStatus::TimedOut),
      other => panic!("expected Closed, got {:?}", other.map(|q| q.question_id)),
    }

    let session = engine.store().load_session("s-1").await.expect("session");
    assert_eq!(session.status, SessionStatus::TimedOut);
    assert!(session.cached_summary.is_some());
  }

  // ---- end / history / review / deletion ----

  #[tokio::test]
  async fn ending_without_attempts_discards_the_session() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    let summary = engine.end_session("s-1").await.expect("summary");
    assert_eq!(summary.total_questions, 0);
    assert!(engine.store().load_session("s-1").await.is_none());
  }

  #[tokio::test]
  async fn history_lists_finished_sessions_newest_first() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;

    for session_id in ["s-old", "s-new"] {
      start(&engine, session_id, "quiz-a", false).await;
      let q = engine.get_next_question(session_id, None, None).await.expect("q");
      answer(&engine, session_id, &q, true).await;
      engine.end_session(session_id).await.expect("summary");
    }
    // Preview and in-progress sessions stay out of the history.
    start(&engine, "p-1", "quiz-a", true).await;
    start(&engine, "s-live", "quiz-a", false).await;

    let history = engine.list_session_history("quiz-a", "learner-1", None).await;
    let ids: Vec<&str> = history.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["s-new", "s-old"]);

    let limited = engine.list_session_history("quiz-a", "learner-1", Some(1)).await;
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].session_id, "s-new");
  }

  #[tokio::test]
  async fn review_is_owner_gated_and_carries_attempt_detail() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;
    let q = engine.get_next_question("s-1", None, None).await.expect("q");
    let outcome = answer(&engine, "s-1", &q, false).await;

    let review = engine.get_session_review("s-1", "learner-1").await.expect("review");
    assert_eq!(review.attempts.len(), 1);
    let attempt = &review.attempts[0];
    assert_eq!(attempt.prompt.as_deref(), Some(q.prompt.as_str()));
    assert_eq!(attempt.rationale.as_deref(), Some(outcome.rationale.as_str()));
    assert!(!attempt.is_correct);

    let stranger = engine.get_session_review("s-1", "learner-2").await;
    assert!(matches!(stranger, Err(QuizError::Forbidden(_))));
  }

  #[tokio::test]
  async fn deletion_paths_enforce_preview_and_ownership_rules() {
    let (engine, _) = counting_engine();
    seed_definition(&engine, "quiz-a", "practice", &["algebra"], None).await;
    start(&engine, "s-1", "quiz-a", false).await;

    // The preview-only path refuses a regular session.
    let wrong_path = engine.delete_preview_session("s-1").await;
    assert!(matches!(wrong_path, Err(QuizError::Conflict(_))));

    // An in-progress record cannot be deleted, nor by a different learner.
    let in_progress = engine.delete_session_record("s-1", "learner-1").await;
    assert!(matches!(in_progress, Err(QuizError::Conflict(_))));
    let stranger = engine.delete_session_record("s-1", "learner-2").await;
    assert!(matches!(stranger, Err(QuizError::Forbidden(_))));

    let q = engine.get_next_question("s-1", None, None).await.expect("q");
    answer(&engine, "s-1", &q, true).await;
    engine.end_session("s-1").await.expect("summary");
    engine.delete_session_record("s-1", "learner-1").await.expect("deleted");
    assert!(engine.store().load_session("s-1").await.is_none());

    // The preview path removes a preview session and its questions.
    start(&engine, "p-1", "quiz-a", true).await;
    engine.get_next_question("p-1", None, None).await.expect("q");
    engine.delete_preview_session("p-1").await.expect("deleted");
    assert!(engine.store().load_session("p-1").await.is_none());
  }
}
