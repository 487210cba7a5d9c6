//! Multiple-choice question generation.
//!
//! The engine consumes generators through the narrow `QuestionGenerator`
//! trait. The production implementation calls an OpenAI-compatible
//! chat.completions endpoint and requests a strict JSON object; a template
//! implementation keeps local development working without an API key.
//!
//! NOTE: We never log the API key and we keep payload truncations short.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::Prompts;
use crate::domain::Difficulty;
use crate::retriever::RetrievedContext;
use crate::util::{fill_template, trunc_for_log};

/// A well-formed question as returned by a generator: at least two distinct
/// choices, the correct answer among them, and a rationale for every
/// distractor (backfilled when the model omits one).
#[derive(Clone, Debug)]
pub struct GeneratedQuestion {
  pub prompt: String,
  pub choices: Vec<String>,
  pub correct_answer: String,
  pub rationale: String,
  pub incorrect_rationales: HashMap<String, String>,
  /// Metadata of the first grounding passage, for downstream attribution.
  pub source_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum GenerationError {
  #[error("model returned an empty response")]
  Empty,
  #[error("model returned invalid question format: {0}")]
  InvalidFormat(String),
  #[error("generator returned unusable output: {0}")]
  Unusable(String),
  #[error("model call failed: {0}")]
  Upstream(String),
}

#[async_trait]
pub trait QuestionGenerator: Send + Sync {
  async fn generate(
    &self,
    topic: &str,
    difficulty: Difficulty,
    order: u32,
    contexts: &[RetrievedContext],
  ) -> Result<GeneratedQuestion, GenerationError>;
}

// ---- OpenAI-compatible implementation ----

#[derive(Clone)]
pub struct OpenAiGenerator {
  client: reqwest::Client,
  api_key: String,
  base_url: String,
  model: String,
  prompts: Prompts,
}

/// Shape the model is asked to produce.
#[derive(Deserialize)]
struct RawQuestion {
  #[serde(default)]
  prompt: String,
  #[serde(default)]
  choices: Vec<String>,
  #[serde(default)]
  correct_answer: String,
  #[serde(default)]
  correct_rationale: String,
  #[serde(default)]
  incorrect_rationales: HashMap<String, String>,
}

impl OpenAiGenerator {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env(prompts: Prompts) -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let model =
      std::env::var("OPENAI_QUESTION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(20))
      .build()
      .ok()?;

    Some(Self { client, api_key, base_url, model, prompts })
  }

  /// JSON-object chat completion returning the raw content string.
  #[instrument(level = "info", skip(self, system, user), fields(model = %self.model))]
  async fn chat_json(&self, system: &str, user: &str) -> Result<String, GenerationError> {
    let url = format!("{}/chat/completions", self.base_url);
    let req = ChatCompletionRequest {
      model: self.model.clone(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature: 0.4,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
    };

    let res = self
      .client
      .post(&url)
      .header(USER_AGENT, "quizcoach-backend/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req)
      .send()
      .await
      .map_err(|e| GenerationError::Upstream(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      return Err(GenerationError::Upstream(format!("HTTP {}: {}", status, msg)));
    }

    let body: ChatCompletionResponse =
      res.json().await.map_err(|e| GenerationError::Upstream(e.to_string()))?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }

    Ok(
      body
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default(),
    )
  }
}

#[async_trait]
impl QuestionGenerator for OpenAiGenerator {
  #[instrument(level = "info", skip(self, contexts), fields(%topic, difficulty = %difficulty.as_str(), order, context_count = contexts.len()))]
  async fn generate(
    &self,
    topic: &str,
    difficulty: Difficulty,
    order: u32,
    contexts: &[RetrievedContext],
  ) -> Result<GeneratedQuestion, GenerationError> {
    let context_block = render_context_block(contexts);
    let user = fill_template(
      &self.prompts.question_user_template,
      &[
        ("topic", topic),
        ("difficulty", difficulty.as_str()),
        ("order", &order.to_string()),
        ("context_block", &context_block),
      ],
    );

    let start = std::time::Instant::now();
    let content = self.chat_json(&self.prompts.question_system, &user).await?;
    let elapsed = start.elapsed();

    let raw = match parse_model_response(&content) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(?elapsed, content = %trunc_for_log(&content, 160), error = %e, "Failed to parse question JSON");
        return Err(e);
      }
    };

    let question = validate_generated(raw, topic, contexts)?;
    info!(
      ?elapsed,
      prompt_preview = %trunc_for_log(&question.prompt, 60),
      choice_count = question.choices.len(),
      "Question successfully generated"
    );
    Ok(question)
  }
}

/// Parse the model content into a `RawQuestion`, tolerating Markdown fences
/// and stray prose around the JSON object.
fn parse_model_response(content: &str) -> Result<RawQuestion, GenerationError> {
  let mut text = content.trim().to_string();
  if text.is_empty() {
    return Err(GenerationError::Empty);
  }

  if text.starts_with("```") {
    text = strip_markdown_fence(&text);
  }

  // Try the first-{..last-} slice first, then the whole text.
  let start = text.find('{');
  let end = text.rfind('}');
  let candidate = match (start, end) {
    (Some(s), Some(e)) if e > s => Some(&text[s..=e]),
    _ => None,
  };

  for snippet in candidate.into_iter().chain(std::iter::once(text.as_str())) {
    if let Ok(raw) = serde_json::from_str::<RawQuestion>(snippet) {
      return Ok(raw);
    }
  }

  Err(GenerationError::InvalidFormat("no JSON object could be decoded".into()))
}

/// Remove a leading ```lang fence and the trailing fence, if present.
fn strip_markdown_fence(raw: &str) -> String {
  let mut text = raw.trim();
  if let Some(rest) = text.strip_prefix("```") {
    text = match rest.find('\n') {
      Some(idx) => &rest[idx + 1..],
      None => rest,
    };
  }
  let text = match text.rfind("```") {
    Some(idx) => &text[..idx],
    None => text,
  };
  text.trim().to_string()
}

/// Enforce the question invariants and backfill what the model omitted.
fn validate_generated(
  raw: RawQuestion,
  topic: &str,
  contexts: &[RetrievedContext],
) -> Result<GeneratedQuestion, GenerationError> {
  let prompt = raw.prompt.trim().to_string();
  let choices: Vec<String> = raw
    .choices
    .iter()
    .map(|c| c.trim().to_string())
    .filter(|c| !c.is_empty())
    .collect();
  let distinct: HashSet<&String> = choices.iter().collect();
  if choices.len() < 2 || distinct.len() != choices.len() {
    return Err(GenerationError::Unusable("fewer than two distinct choices".into()));
  }

  let correct_answer = raw.correct_answer.trim().to_string();
  if !choices.iter().any(|c| *c == correct_answer) {
    return Err(GenerationError::Unusable("correct answer missing from choices".into()));
  }

  let mut incorrect_rationales: HashMap<String, String> = raw
    .incorrect_rationales
    .into_iter()
    .map(|(choice, text)| (choice.trim().to_string(), text.trim().to_string()))
    .filter(|(choice, text)| !text.is_empty() && choices.iter().any(|c| c == choice))
    .collect();

  // Every distractor must carry a rationale even when the model skipped it.
  for choice in &choices {
    if *choice == correct_answer {
      continue;
    }
    incorrect_rationales
      .entry(choice.clone())
      .or_insert_with(|| "This option does not correctly address the prompt.".into());
  }

  let rationale = {
    let trimmed = raw.correct_rationale.trim();
    if trimmed.is_empty() {
      format!("The correct choice best represents the topic {}.", topic)
    } else {
      trimmed.to_string()
    }
  };

  Ok(GeneratedQuestion {
    prompt,
    choices,
    correct_answer,
    rationale,
    incorrect_rationales,
    source_metadata: contexts.first().map(|c| c.metadata.clone()),
  })
}

/// Render grounding passages as numbered sources with slide attribution.
fn render_context_block(contexts: &[RetrievedContext]) -> String {
  if contexts.is_empty() {
    return String::new();
  }
  let mut block = String::from("Source material (ground the question in it):\n");
  for (idx, ctx) in contexts.iter().enumerate() {
    let slide = ctx.metadata.get("slide_number").and_then(|v| v.as_u64());
    let title = ctx.metadata.get("slide_title").and_then(|v| v.as_str());
    match (slide, title) {
      (Some(n), Some(t)) => block.push_str(&format!("Source {} (slide {}: {}):\n", idx + 1, n, t)),
      (Some(n), None) => block.push_str(&format!("Source {} (slide {}):\n", idx + 1, n)),
      _ => block.push_str(&format!("Source {}:\n", idx + 1)),
    }
    block.push_str(ctx.text.trim());
    block.push('\n');
  }
  block
}

// ---- Template fallback (no API key configured) ----

/// Deterministic generator producing topic-templated questions. Keeps the
/// engine usable in local development; the first choice is always correct.
#[derive(Clone, Default)]
pub struct TemplateQuestionGenerator;

#[async_trait]
impl QuestionGenerator for TemplateQuestionGenerator {
  async fn generate(
    &self,
    topic: &str,
    _difficulty: Difficulty,
    _order: u32,
    contexts: &[RetrievedContext],
  ) -> Result<GeneratedQuestion, GenerationError> {
    let correct_answer = format!("The option summarizing {} fundamentals.", topic);
    let distractors = vec![
      format!("An idea mostly unrelated to {}.", topic),
      format!("A misconception commonly seen about {}.", topic),
      format!("A detail that only loosely connects to {}.", topic),
    ];
    let incorrect_rationales = HashMap::from([
      (distractors[0].clone(), format!("This option does not focus on {} and goes off-topic.", topic)),
      (distractors[1].clone(), format!("This reflects a common misunderstanding of {}.", topic)),
      (
        distractors[2].clone(),
        format!("This detail is tangential and does not capture the core of {}.", topic),
      ),
    ]);
    let mut choices = vec![correct_answer.clone()];
    choices.extend(distractors);

    Ok(GeneratedQuestion {
      prompt: format!("Which option best represents a key idea from the topic '{}'?", topic),
      choices,
      correct_answer,
      rationale: format!("The correct answer highlights the fundamental concept within {}.", topic),
      incorrect_rationales,
      source_metadata: contexts.first().map(|c| c.metadata.clone()),
    })
  }
}

// ---- Chat DTOs ----

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from an OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}
