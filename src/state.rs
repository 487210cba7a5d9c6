//! Application state: the engine instance shared by every handler.
//!
//! The engine (store, config, generator, retriever) is wired together once at
//! process start and passed to the router; nothing here is a hidden
//! module-level singleton.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::{load_quiz_config_from_env, EngineConfig};
use crate::engine::QuizEngine;
use crate::generator::{OpenAiGenerator, QuestionGenerator, TemplateQuestionGenerator};
use crate::retriever::{ContextRetriever, HttpVectorRetriever};
use crate::store::QuizStore;

pub struct AppState {
    pub engine: QuizEngine,
}

impl AppState {
    /// Build state from env: engine config, prompt overrides, generator and
    /// retriever clients.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let config = EngineConfig::from_env();
        let prompts = load_quiz_config_from_env().map(|c| c.prompts).unwrap_or_default();

        let generator: Arc<dyn QuestionGenerator> = match OpenAiGenerator::from_env(prompts) {
            Some(client) => {
                info!(target: "quizcoach_backend", "OpenAI question generation enabled.");
                Arc::new(client)
            }
            None => {
                info!(target: "quizcoach_backend", "OpenAI disabled (no OPENAI_API_KEY). Serving template questions.");
                Arc::new(TemplateQuestionGenerator)
            }
        };

        let retriever: Option<Arc<dyn ContextRetriever>> =
            HttpVectorRetriever::from_env().map(|r| Arc::new(r) as Arc<dyn ContextRetriever>);
        if retriever.is_none() {
            info!(target: "quizcoach_backend", "Vector retrieval disabled (no VECTOR_SEARCH_URL). Generation runs ungrounded.");
        }

        Self {
            engine: QuizEngine::new(QuizStore::new(), config, generator, retriever),
        }
    }
}
