//! Summary/analytics projection over a session's attempt log.
//!
//! Everything here is derived from the recorded attempts rather than the
//! session's live counters, so a summary stays auditable even if the
//! counters drift.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{QuizMode, QuizSession, SessionStatus};
use crate::store::QuizStore;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
  pub attempted: u32,
  pub correct: u32,
}

/// Aggregate view of one session, cached once the session turns terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
  pub session_id: String,
  pub quiz_id: String,
  pub user_id: String,
  pub mode: QuizMode,
  pub status: SessionStatus,
  pub total_questions: u32,
  pub correct_answers: u32,
  /// `correct / total`, rounded to two decimals; 0 with no attempts.
  pub accuracy: f64,
  pub total_time_ms: i64,
  /// Mean of recorded latencies; absent when none were recorded.
  pub average_response_ms: Option<f64>,
  /// Per-topic attempted/correct counts; unresolvable questions land in
  /// the "general" bucket.
  pub topics: HashMap<String, TopicStats>,
  pub max_correct_streak: u32,
  pub max_incorrect_streak: u32,
  /// Wall-clock session length; absent until the session completes.
  pub duration_ms: Option<i64>,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

/// Project a summary from the session's attempt log, resolving each
/// attempt's topic through the question bank.
pub async fn build_summary(store: &QuizStore, session: &QuizSession) -> SessionSummary {
  let total_questions = session.attempts.len() as u32;
  let correct_answers = session.attempts.iter().filter(|a| a.is_correct).count() as u32;
  let accuracy = if total_questions > 0 {
    round2(correct_answers as f64 / total_questions as f64)
  } else {
    0.0
  };

  let recorded: Vec<i64> = session.attempts.iter().filter_map(|a| a.response_ms).collect();
  let total_time_ms: i64 = recorded.iter().sum();
  let average_response_ms =
    (!recorded.is_empty()).then(|| round2(total_time_ms as f64 / recorded.len() as f64));

  let mut topics: HashMap<String, TopicStats> = HashMap::new();
  for attempt in &session.attempts {
    let topic = match store.get_question(&attempt.question_id).await {
      Some(question) => question.topic,
      None => "general".to_string(),
    };
    let stats = topics.entry(topic).or_default();
    stats.attempted += 1;
    if attempt.is_correct {
      stats.correct += 1;
    }
  }

  let (max_correct_streak, max_incorrect_streak) = max_streaks(session);

  let duration_ms = session
    .completed_at
    .map(|done| (done - session.started_at).num_milliseconds());

  SessionSummary {
    session_id: session.session_id.clone(),
    quiz_id: session.quiz_id.clone(),
    user_id: session.user_id.clone(),
    mode: session.mode,
    status: session.status,
    total_questions,
    correct_answers,
    accuracy,
    total_time_ms,
    average_response_ms,
    topics,
    max_correct_streak,
    max_incorrect_streak,
    duration_ms,
    started_at: session.started_at,
    completed_at: session.completed_at,
  }
}

/// Longest runs of consecutive correct/incorrect answers over the full log.
fn max_streaks(session: &QuizSession) -> (u32, u32) {
  let mut max_correct = 0u32;
  let mut max_incorrect = 0u32;
  let mut run_correct = 0u32;
  let mut run_incorrect = 0u32;
  for attempt in &session.attempts {
    if attempt.is_correct {
      run_correct += 1;
      run_incorrect = 0;
    } else {
      run_incorrect += 1;
      run_correct = 0;
    }
    max_correct = max_correct.max(run_correct);
    max_incorrect = max_incorrect.max(run_incorrect);
  }
  (max_correct, max_incorrect)
}

fn round2(value: f64) -> f64 {
  (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, Utc};

  use super::*;
  use crate::domain::{Difficulty, QuizAttempt, QuizQuestion};

  fn attempt(question_id: &str, is_correct: bool, response_ms: Option<i64>) -> QuizAttempt {
    QuizAttempt {
      question_id: question_id.into(),
      selected_answer: "x".into(),
      is_correct,
      submitted_at: Utc::now(),
      response_ms,
      rationale: None,
      presented_at: None,
    }
  }

  fn session_with(attempts: Vec<QuizAttempt>) -> QuizSession {
    let started = Utc::now() - Duration::seconds(90);
    QuizSession {
      session_id: "s-1".into(),
      quiz_id: "quiz-1".into(),
      user_id: "learner".into(),
      mode: QuizMode::Practice,
      status: SessionStatus::Completed,
      current_difficulty: Difficulty::Medium,
      correct_streak: 0,
      incorrect_streak: 0,
      attempts_used: attempts.len() as u32,
      topics: vec!["General".into()],
      asked_question_ids: attempts.iter().map(|a| a.question_id.clone()).collect(),
      active_question_id: None,
      active_question_served_at: None,
      started_at: started,
      completed_at: Some(started + Duration::seconds(90)),
      deadline: None,
      attempts,
      is_preview: false,
      preview_question_ids: vec![],
      used_slide_ids: vec![],
      missed_question_ids: vec![],
      questions_since_review: 0,
      total_slide_count: None,
      coverage_cycles: 0,
      topic_cursor: 0,
      prefer_existing_next: true,
      max_correct_streak: 0,
      max_incorrect_streak: 0,
      cached_summary: None,
      queued_question_id: None,
    }
  }

  fn bank_question(question_id: &str, topic: &str) -> QuizQuestion {
    QuizQuestion {
      question_id: question_id.into(),
      quiz_id: "quiz-1".into(),
      prompt: "?".into(),
      choices: vec!["a".into(), "b".into()],
      correct_answer: "a".into(),
      rationale: "r".into(),
      incorrect_rationales: HashMap::from([("b".to_string(), "wrong".to_string())]),
      topic: topic.into(),
      difficulty: Difficulty::Easy,
      order: 1,
      generated_at: Utc::now(),
      origin_session_id: None,
      source_document_id: None,
      source_metadata: None,
    }
  }

  #[tokio::test]
  async fn empty_session_yields_zeroes() {
    let store = QuizStore::new();
    let summary = build_summary(&store, &session_with(vec![])).await;
    assert_eq!(summary.total_questions, 0);
    assert_eq!(summary.accuracy, 0.0);
    assert!(summary.average_response_ms.is_none());
    assert!(summary.topics.is_empty());
  }

  #[tokio::test]
  async fn accuracy_latency_and_topics_are_projected() {
    let store = QuizStore::new();
    store.save_question(bank_question("q-1", "algebra")).await;
    store.save_question(bank_question("q-2", "geometry")).await;

    let summary = build_summary(
      &store,
      &session_with(vec![
        attempt("q-1", true, Some(1200)),
        attempt("q-2", false, Some(800)),
        attempt("q-ghost", true, None),
      ]),
    )
    .await;

    assert_eq!(summary.total_questions, 3);
    assert_eq!(summary.correct_answers, 2);
    assert_eq!(summary.accuracy, 0.67);
    assert_eq!(summary.total_time_ms, 2000);
    assert_eq!(summary.average_response_ms, Some(1000.0));
    assert_eq!(summary.topics["algebra"], TopicStats { attempted: 1, correct: 1 });
    assert_eq!(summary.topics["geometry"], TopicStats { attempted: 1, correct: 0 });
    // Question that no longer resolves counts toward the generic bucket.
    assert_eq!(summary.topics["general"], TopicStats { attempted: 1, correct: 1 });
    assert!(summary.duration_ms.unwrap() >= 90_000);
  }

  #[tokio::test]
  async fn streak_maxima_come_from_the_attempt_log() {
    let store = QuizStore::new();
    let summary = build_summary(
      &store,
      &session_with(vec![
        attempt("a", true, None),
        attempt("b", true, None),
        attempt("c", false, None),
        attempt("d", false, None),
        attempt("e", false, None),
        attempt("f", true, None),
      ]),
    )
    .await;
    assert_eq!(summary.max_correct_streak, 2);
    assert_eq!(summary.max_incorrect_streak, 3);
  }
}
