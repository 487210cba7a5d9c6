//! In-memory persistence for definitions, bank questions, and sessions.
//!
//! Every accessor returns deep snapshots (cloned records); callers mutate a
//! snapshot and save it back whole. No two readers ever observe a partially
//! updated record, which is the invariant the engine's read-modify-write
//! cycle relies on. Swapping this for a durable backend only needs the same
//! snapshot semantics.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::instrument;

use crate::domain::{QuizDefinition, QuizQuestion, QuizSession};

#[derive(Clone, Default)]
pub struct QuizStore {
    definitions: Arc<RwLock<HashMap<String, QuizDefinition>>>,
    questions: Arc<RwLock<HashMap<String, QuizQuestion>>>,
    sessions: Arc<RwLock<HashMap<String, QuizSession>>>,
}

impl QuizStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Quiz definitions ----

    pub async fn load_definition(&self, quiz_id: &str) -> Option<QuizDefinition> {
        self.definitions.read().await.get(quiz_id).cloned()
    }

    pub async fn save_definition(&self, record: QuizDefinition) {
        self.definitions.write().await.insert(record.quiz_id.clone(), record);
    }

    /// All definitions, newest-updated first.
    pub async fn list_definitions(&self) -> Vec<QuizDefinition> {
        let mut all: Vec<QuizDefinition> = self.definitions.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all
    }

    /// Removes the definition plus every bank question and session under it.
    /// Returns false when the definition did not exist.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_definition_cascade(&self, quiz_id: &str) -> bool {
        let existed = self.definitions.write().await.remove(quiz_id).is_some();
        if existed {
            self.questions.write().await.retain(|_, q| q.quiz_id != quiz_id);
            self.sessions.write().await.retain(|_, s| s.quiz_id != quiz_id);
        }
        existed
    }

    // ---- Question bank ----

    /// Bank questions for a quiz ordered by (order, generated_at).
    pub async fn list_questions(&self, quiz_id: &str) -> Vec<QuizQuestion> {
        let mut questions: Vec<QuizQuestion> = self
            .questions
            .read()
            .await
            .values()
            .filter(|q| q.quiz_id == quiz_id)
            .cloned()
            .collect();
        questions.sort_by(|a, b| (a.order, a.generated_at).cmp(&(b.order, b.generated_at)));
        questions
    }

    pub async fn save_question(&self, record: QuizQuestion) {
        self.questions.write().await.insert(record.question_id.clone(), record);
    }

    pub async fn get_question(&self, question_id: &str) -> Option<QuizQuestion> {
        self.questions.read().await.get(question_id).cloned()
    }

    pub async fn delete_question(&self, question_id: &str) -> bool {
        self.questions.write().await.remove(question_id).is_some()
    }

    // ---- Learner sessions ----

    pub async fn load_session(&self, session_id: &str) -> Option<QuizSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn save_session(&self, record: QuizSession) {
        self.sessions.write().await.insert(record.session_id.clone(), record);
    }

    pub async fn delete_session(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// True when any session (any learner, any status) references the quiz.
    pub async fn quiz_has_sessions(&self, quiz_id: &str) -> bool {
        self.sessions.read().await.values().any(|s| s.quiz_id == quiz_id)
    }

    /// Sessions for one learner on one quiz, unsorted; the engine applies
    /// status filtering, ordering, and limits.
    pub async fn list_sessions(&self, quiz_id: &str, user_id: &str) -> Vec<QuizSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.quiz_id == quiz_id && s.user_id == user_id)
            .cloned()
            .collect()
    }
}
