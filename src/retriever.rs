//! Context retrieval for grounded question generation.
//!
//! The engine talks to a vector-similarity service through the narrow
//! `ContextRetriever` trait: given a document and an exclusion set of already
//! used slides, return a small sample of grounding passages plus a flag
//! telling the caller to reset its exclusion set because coverage is
//! exhausted. Retrieval failures never fail question delivery; the engine
//! degrades to ungrounded generation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::domain::Difficulty;

/// Chunk of source material returned from the vector index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievedContext {
  pub text: String,
  #[serde(default)]
  pub metadata: serde_json::Value,
}

/// Result of one retrieval round.
#[derive(Clone, Debug, Default)]
pub struct ContextFetch {
  pub contexts: Vec<RetrievedContext>,
  /// True when the caller should clear its used-slide set: either the
  /// exclusion ratio reached the coverage threshold, or the filtered query
  /// came back empty and an unfiltered retry had to be made.
  pub coverage_reset_needed: bool,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
  #[error("vector search HTTP {status}: {message}")]
  Http { status: u16, message: String },
  #[error("vector search request failed: {0}")]
  Transport(String),
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
  async fn fetch(
    &self,
    document_id: &str,
    topic: &str,
    difficulty: Difficulty,
    exclude_slide_ids: &[String],
    total_slide_count: Option<u32>,
    coverage_threshold: f32,
    sample_size: usize,
  ) -> Result<ContextFetch, RetrievalError>;
}

/// HTTP client for a vector-search sidecar that embeds the query server-side.
#[derive(Clone)]
pub struct HttpVectorRetriever {
  client: reqwest::Client,
  base_url: String,
  api_key: Option<String>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
  document_id: &'a str,
  query: String,
  top_k: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  exclude_slide_ids: Option<&'a [String]>,
}

#[derive(Deserialize)]
struct SearchResponse {
  #[serde(default)]
  matches: Vec<SearchMatch>,
}

#[derive(Deserialize)]
struct SearchMatch {
  #[serde(default)]
  text: String,
  #[serde(default)]
  metadata: serde_json::Value,
}

impl HttpVectorRetriever {
  /// Construct the client if VECTOR_SEARCH_URL is set; otherwise None and
  /// the engine generates ungrounded questions.
  pub fn from_env() -> Option<Self> {
    let base_url = std::env::var("VECTOR_SEARCH_URL").ok()?;
    let api_key = std::env::var("VECTOR_SEARCH_API_KEY").ok();

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .ok()?;

    Some(Self { client, base_url, api_key })
  }

  async fn query(
    &self,
    document_id: &str,
    query: String,
    top_k: usize,
    exclude_slide_ids: Option<&[String]>,
  ) -> Result<Vec<RetrievedContext>, RetrievalError> {
    let url = format!("{}/search", self.base_url.trim_end_matches('/'));
    let req = SearchRequest { document_id, query, top_k, exclude_slide_ids };

    let mut builder = self
      .client
      .post(&url)
      .header(USER_AGENT, "quizcoach-backend/0.1")
      .header(CONTENT_TYPE, "application/json");
    if let Some(key) = &self.api_key {
      builder = builder.header(AUTHORIZATION, format!("Bearer {}", key));
    }

    let res = builder.json(&req).send().await.map_err(|e| RetrievalError::Transport(e.to_string()))?;
    if !res.status().is_success() {
      let status = res.status().as_u16();
      let message = res.text().await.unwrap_or_default();
      return Err(RetrievalError::Http { status, message });
    }

    let body: SearchResponse = res.json().await.map_err(|e| RetrievalError::Transport(e.to_string()))?;
    Ok(
      body
        .matches
        .into_iter()
        .filter(|m| !m.text.trim().is_empty())
        .map(|m| RetrievedContext { text: m.text, metadata: m.metadata })
        .collect(),
    )
  }
}

#[async_trait]
impl ContextRetriever for HttpVectorRetriever {
  #[instrument(level = "info", skip(self, exclude_slide_ids), fields(%document_id, %topic, excluded = exclude_slide_ids.len()))]
  async fn fetch(
    &self,
    document_id: &str,
    topic: &str,
    difficulty: Difficulty,
    exclude_slide_ids: &[String],
    total_slide_count: Option<u32>,
    coverage_threshold: f32,
    sample_size: usize,
  ) -> Result<ContextFetch, RetrievalError> {
    if document_id.is_empty() {
      return Ok(ContextFetch::default());
    }

    let query = build_query(topic, difficulty);

    if coverage_exhausted(exclude_slide_ids.len(), total_slide_count, coverage_threshold) {
      info!(target: "quiz", %document_id, "Coverage threshold reached; querying unfiltered and signalling reset");
      let mut contexts = self.query(document_id, query, sample_size, None).await?;
      contexts.truncate(sample_size);
      return Ok(ContextFetch { contexts, coverage_reset_needed: true });
    }

    let filter = (!exclude_slide_ids.is_empty()).then_some(exclude_slide_ids);
    let mut contexts = self.query(document_id, query.clone(), sample_size, filter).await?;
    let mut coverage_reset_needed = false;

    // A filtered query that finds nothing means the remaining slides carry no
    // retrievable content for this topic; retry unfiltered so the learner
    // still gets grounded questions, and tell the caller to start a new cycle.
    if contexts.is_empty() && filter.is_some() {
      info!(target: "quiz", %document_id, "Filtered retrieval empty; retrying unfiltered and signalling reset");
      contexts = self.query(document_id, query, sample_size, None).await?;
      coverage_reset_needed = true;
    }

    contexts.truncate(sample_size);
    Ok(ContextFetch { contexts, coverage_reset_needed })
  }
}

/// True when the exclusion set covers at least `threshold` of the known
/// content units. With no known total there is nothing to exhaust.
fn coverage_exhausted(excluded: usize, total: Option<u32>, threshold: f32) -> bool {
  match total {
    Some(total) if total > 0 && excluded > 0 => (excluded as f32) / (total as f32) >= threshold,
    _ => false,
  }
}

fn build_query(topic: &str, difficulty: Difficulty) -> String {
  let base_topic = if topic.is_empty() { "general concepts" } else { topic };
  format!(
    "{} key ideas suitable for a {} difficulty question. Return the most informative passages.",
    base_topic,
    difficulty.as_str()
  )
}
