//! Public request/response structs for the HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Difficulty, QuizMode, QuizQuestion, QuizSession, SessionStatus};

fn default_mode() -> String {
    "practice".into()
}

fn default_difficulty() -> String {
    "medium".into()
}

/// Create-or-update payload for a quiz definition.
#[derive(Debug, Deserialize)]
pub struct UpsertDefinitionIn {
    #[serde(default)]
    pub quiz_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_mode")]
    pub default_mode: String,
    #[serde(default = "default_difficulty")]
    pub initial_difficulty: String,
    #[serde(default)]
    pub assessment_num_questions: Option<u32>,
    #[serde(default)]
    pub assessment_time_limit_minutes: Option<u32>,
    #[serde(default)]
    pub assessment_max_attempts: Option<u32>,
    #[serde(default)]
    pub embedding_document_id: Option<String>,
    #[serde(default)]
    pub source_filename: Option<String>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct StartSessionIn {
    pub session_id: String,
    pub quiz_id: String,
    pub user_id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub initial_difficulty: Option<String>,
    #[serde(default)]
    pub is_preview: bool,
}

/// Learner-facing view of a session (counters and bookkeeping stay private).
#[derive(Debug, Serialize)]
pub struct SessionOut {
    pub session_id: String,
    pub quiz_id: String,
    pub user_id: String,
    pub mode: QuizMode,
    pub status: SessionStatus,
    pub current_difficulty: Difficulty,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub is_preview: bool,
}

pub fn to_session_out(s: &QuizSession) -> SessionOut {
    SessionOut {
        session_id: s.session_id.clone(),
        quiz_id: s.quiz_id.clone(),
        user_id: s.user_id.clone(),
        mode: s.mode,
        status: s.status,
        current_difficulty: s.current_difficulty,
        started_at: s.started_at,
        deadline: s.deadline,
        is_preview: s.is_preview,
    }
}

#[derive(Debug, Deserialize)]
pub struct NextQuestionQuery {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
}

/// Learner-facing view of a question: no answer key, no rationales.
#[derive(Debug, Serialize)]
pub struct QuestionOut {
    pub question_id: String,
    pub quiz_id: String,
    pub prompt: String,
    pub choices: Vec<String>,
    pub topic: String,
    pub difficulty: Difficulty,
    pub order: u32,
}

pub fn to_question_out(q: &QuizQuestion) -> QuestionOut {
    QuestionOut {
        question_id: q.question_id.clone(),
        quiz_id: q.quiz_id.clone(),
        prompt: q.prompt.clone(),
        choices: q.choices.clone(),
        topic: q.topic.clone(),
        difficulty: q.difficulty,
        order: q.order,
    }
}

#[derive(Debug, Deserialize)]
pub struct AnswerIn {
    pub question_id: String,
    pub selected_answer: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedSessionOut {
    pub status: &'static str,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeletedDefinitionOut {
    pub status: &'static str,
    pub quiz_id: String,
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
}
