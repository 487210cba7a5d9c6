//! Domain models shared by the engine: difficulty scale, quiz modes, session
//! status, instructor definitions, bank questions, attempts, and sessions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::summary::SessionSummary;

/// Three-step difficulty ladder. Practice mode walks it one level at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
  Easy,
  Medium,
  Hard,
}

impl Difficulty {
  pub fn rank(self) -> u8 {
    match self {
      Difficulty::Easy => 0,
      Difficulty::Medium => 1,
      Difficulty::Hard => 2,
    }
  }

  /// One step up; saturates at `Hard`.
  pub fn one_harder(self) -> Difficulty {
    match self {
      Difficulty::Easy => Difficulty::Medium,
      Difficulty::Medium | Difficulty::Hard => Difficulty::Hard,
    }
  }

  /// One step down; saturates at `Easy`.
  pub fn one_easier(self) -> Difficulty {
    match self {
      Difficulty::Hard => Difficulty::Medium,
      Difficulty::Medium | Difficulty::Easy => Difficulty::Easy,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Difficulty::Easy => "easy",
      Difficulty::Medium => "medium",
      Difficulty::Hard => "hard",
    }
  }

  pub fn parse(raw: &str) -> Option<Difficulty> {
    match raw {
      "easy" => Some(Difficulty::Easy),
      "medium" => Some(Difficulty::Medium),
      "hard" => Some(Difficulty::Hard),
      _ => None,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizMode {
  Assessment,
  Practice,
}

impl QuizMode {
  pub fn as_str(self) -> &'static str {
    match self {
      QuizMode::Assessment => "assessment",
      QuizMode::Practice => "practice",
    }
  }

  pub fn parse(raw: &str) -> Option<QuizMode> {
    match raw {
      "assessment" => Some(QuizMode::Assessment),
      "practice" => Some(QuizMode::Practice),
      _ => None,
    }
  }
}

/// Terminal once it leaves `InProgress`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
  InProgress,
  Completed,
  TimedOut,
}

impl SessionStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      SessionStatus::InProgress => "in_progress",
      SessionStatus::Completed => "completed",
      SessionStatus::TimedOut => "timed_out",
    }
  }
}

/// Instructor-authored quiz configuration shared by every session of a quiz.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuizDefinition {
  pub quiz_id: String,
  pub name: String,
  /// Non-empty; `["General"]` when the instructor supplied nothing usable.
  pub topics: Vec<String>,
  pub default_mode: QuizMode,
  pub initial_difficulty: Difficulty,
  pub assessment_num_questions: Option<u32>,
  pub assessment_time_limit_minutes: Option<u32>,
  pub assessment_max_attempts: Option<u32>,
  /// Ingested document backing grounded generation, if any.
  #[serde(default)]
  pub embedding_document_id: Option<String>,
  #[serde(default)]
  pub source_filename: Option<String>,
  #[serde(default)]
  pub is_published: bool,
  /// Open-ended instructor metadata. May carry `slide_count` for coverage math.
  #[serde(default)]
  pub metadata: Option<serde_json::Value>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl QuizDefinition {
  /// Total content-unit count advertised by the instructor, when present.
  pub fn slide_count(&self) -> Option<u32> {
    self
      .metadata
      .as_ref()
      .and_then(|m| m.get("slide_count"))
      .and_then(|v| v.as_u64())
      .map(|n| n as u32)
  }
}

/// A single persisted MCQ, scoped to one quiz and never mutated after save.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuizQuestion {
  pub question_id: String,
  pub quiz_id: String,
  pub prompt: String,
  /// At least two distinct choices; `correct_answer` is always one of them.
  pub choices: Vec<String>,
  pub correct_answer: String,
  pub rationale: String,
  /// Every distractor has an entry (backfilled when the generator omits one).
  pub incorrect_rationales: HashMap<String, String>,
  pub topic: String,
  pub difficulty: Difficulty,
  pub order: u32,
  pub generated_at: DateTime<Utc>,
  /// Session the question was first generated in, if generated.
  #[serde(default)]
  pub origin_session_id: Option<String>,
  #[serde(default)]
  pub source_document_id: Option<String>,
  /// Grounding provenance, e.g. the slide the question was built from.
  #[serde(default)]
  pub source_metadata: Option<serde_json::Value>,
}

impl QuizQuestion {
  /// Slide/content-unit identifier this question was grounded in, if any.
  pub fn source_slide_id(&self) -> Option<String> {
    self
      .source_metadata
      .as_ref()
      .and_then(|m| m.get("slide_id"))
      .and_then(|v| v.as_str())
      .map(str::to_string)
  }
}

/// One learner answer to one question within one session. Append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuizAttempt {
  pub question_id: String,
  pub selected_answer: String,
  pub is_correct: bool,
  pub submitted_at: DateTime<Utc>,
  /// Milliseconds between serve and answer; `None` when serve time was unknown.
  pub response_ms: Option<i64>,
  /// Rationale shown to the learner for this attempt.
  pub rationale: Option<String>,
  pub presented_at: Option<DateTime<Utc>>,
}

/// One learner's run through a quiz definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuizSession {
  pub session_id: String,
  pub quiz_id: String,
  pub user_id: String,
  pub mode: QuizMode,
  pub status: SessionStatus,
  pub current_difficulty: Difficulty,
  pub correct_streak: u32,
  pub incorrect_streak: u32,
  pub attempts_used: u32,
  /// Shuffled copy of the definition topics (shuffled only when more than one).
  pub topics: Vec<String>,
  pub asked_question_ids: Vec<String>,
  /// Served-but-unanswered question, making `get_next_question` retry-safe.
  pub active_question_id: Option<String>,
  pub active_question_served_at: Option<DateTime<Utc>>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub deadline: Option<DateTime<Utc>>,
  pub attempts: Vec<QuizAttempt>,
  #[serde(default)]
  pub is_preview: bool,
  /// Questions generated exclusively for a preview; deleted on cleanup.
  #[serde(default)]
  pub preview_question_ids: Vec<String>,
  /// Slide ids already used for grounding in this session (coverage exclusion).
  #[serde(default)]
  pub used_slide_ids: Vec<String>,
  /// Questions answered incorrectly and not yet replayed, oldest first.
  #[serde(default)]
  pub missed_question_ids: Vec<String>,
  /// Questions served since the last missed-question replay.
  #[serde(default)]
  pub questions_since_review: u32,
  #[serde(default)]
  pub total_slide_count: Option<u32>,
  #[serde(default)]
  pub coverage_cycles: u32,
  /// Round-robin position into `topics`; advances only without an override.
  #[serde(default)]
  pub topic_cursor: usize,
  /// Whether the next question should prefer bank reuse over generation.
  #[serde(default)]
  pub prefer_existing_next: bool,
  #[serde(default)]
  pub max_correct_streak: u32,
  #[serde(default)]
  pub max_incorrect_streak: u32,
  /// Computed once the session leaves `InProgress`.
  #[serde(default)]
  pub cached_summary: Option<SessionSummary>,
  /// Pre-generated question waiting to be served, to cut next-question latency.
  #[serde(default)]
  pub queued_question_id: Option<String>,
}

impl QuizSession {
  pub fn is_terminal(&self) -> bool {
    self.status != SessionStatus::InProgress
  }

  pub fn has_answered(&self, question_id: &str) -> bool {
    self.attempts.iter().any(|a| a.question_id == question_id)
  }

  pub fn has_asked(&self, question_id: &str) -> bool {
    self.asked_question_ids.iter().any(|id| id == question_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn difficulty_steps_saturate_at_the_edges() {
    assert_eq!(Difficulty::Hard.one_harder(), Difficulty::Hard);
    assert_eq!(Difficulty::Easy.one_easier(), Difficulty::Easy);
    assert_eq!(Difficulty::Medium.one_harder(), Difficulty::Hard);
    assert_eq!(Difficulty::Medium.one_easier(), Difficulty::Easy);
  }

  #[test]
  fn difficulty_round_trips_through_strings() {
    for d in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
      assert_eq!(Difficulty::parse(d.as_str()), Some(d));
    }
    assert_eq!(Difficulty::parse("brutal"), None);
  }

  #[test]
  fn slide_count_reads_instructor_metadata() {
    let def = QuizDefinition {
      quiz_id: "q".into(),
      name: "n".into(),
      topics: vec!["General".into()],
      default_mode: QuizMode::Practice,
      initial_difficulty: Difficulty::Medium,
      assessment_num_questions: None,
      assessment_time_limit_minutes: None,
      assessment_max_attempts: None,
      embedding_document_id: None,
      source_filename: None,
      is_published: false,
      metadata: Some(serde_json::json!({"slide_count": 12, "grade_level": "middle"})),
      created_at: Utc::now(),
      updated_at: Utc::now(),
    };
    assert_eq!(def.slide_count(), Some(12));
  }
}
