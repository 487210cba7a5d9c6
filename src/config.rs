//! Engine tunables (environment) and generator prompts (TOML-overridable).
//!
//! See `EngineConfig` for the env variables and `Prompts` for the TOML schema.

use serde::Deserialize;
use tracing::{error, info};

/// Knobs governing session policy. All have working defaults; every value is
/// clamped to stay usable (streak thresholds never drop below 1).
#[derive(Clone, Debug)]
pub struct EngineConfig {
  /// Consecutive correct answers promoting practice difficulty one level.
  pub practice_increase_streak: u32,
  /// Consecutive incorrect answers demoting practice difficulty one level.
  pub practice_decrease_streak: u32,
  /// Questions that must be served between missed-question replays.
  pub review_gap: u32,
  /// Fraction of known content units after which the exclusion set resets.
  pub coverage_reset_threshold: f32,
  /// Grounding passages requested per generation.
  pub context_sample_size: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      practice_increase_streak: 3,
      practice_decrease_streak: 3,
      review_gap: 2,
      coverage_reset_threshold: 0.8,
      context_sample_size: 4,
    }
  }
}

impl EngineConfig {
  pub fn from_env() -> Self {
    let defaults = Self::default();
    Self {
      practice_increase_streak: env_u32("QUIZ_PRACTICE_INCREASE_STREAK", defaults.practice_increase_streak).max(1),
      practice_decrease_streak: env_u32("QUIZ_PRACTICE_DECREASE_STREAK", defaults.practice_decrease_streak).max(1),
      review_gap: env_u32("QUIZ_REVIEW_GAP", defaults.review_gap),
      coverage_reset_threshold: env_f32("QUIZ_COVERAGE_RESET_THRESHOLD", defaults.coverage_reset_threshold)
        .clamp(0.0, 1.0),
      context_sample_size: env_u32("QUIZ_CONTEXT_SAMPLE_SIZE", defaults.context_sample_size as u32).max(1) as usize,
    }
  }
}

fn env_u32(key: &str, default: u32) -> u32 {
  std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
  std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Optional TOML config (prompt overrides) loaded from QUIZ_CONFIG_PATH.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct QuizConfigFile {
  #[serde(default)]
  pub prompts: Prompts,
}

/// Prompts used by the LLM question generator. Defaults produce strict-JSON
/// multiple-choice questions; override in TOML to tune tone/structure.
#[derive(Clone, Debug, Deserialize)]
pub struct Prompts {
  pub question_system: String,
  pub question_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      question_system: "You are an instructional design assistant. \
Write a single multiple-choice question that checks conceptual understanding. \
Return ONLY a JSON object with keys: prompt (string), choices (array of 4 distinct strings), \
correct_answer (string exactly matching one choice), correct_rationale (string), \
incorrect_rationales (object keyed by choice with short explanation). \
Keep the distractors plausible but definitively incorrect. \
Do not include any text before or after the JSON object and do not wrap it in Markdown fences."
        .into(),
      question_user_template: "Topic: {topic}\nDifficulty: {difficulty}\nQuestion Number: {order}\n{context_block}Follow the format instructions strictly.".into(),
    }
  }
}

/// Attempt to load `QuizConfigFile` from QUIZ_CONFIG_PATH. On any parsing/IO
/// error, returns None.
pub fn load_quiz_config_from_env() -> Option<QuizConfigFile> {
  let path = std::env::var("QUIZ_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<QuizConfigFile>(&s) {
      Ok(cfg) => {
        info!(target: "quizcoach_backend", %path, "Loaded quiz config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "quizcoach_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "quizcoach_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}
