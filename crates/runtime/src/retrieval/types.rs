//! Search API types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::vector::PointPayload;

/// Retrieval strategy for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    Dense,
    Sparse,
    Hybrid,
}

/// Payload filters a caller may apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub session_id: Option<String>,
    /// `thought`, `code`, or `doc`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

/// A search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub strategy: Option<RetrievalStrategy>,
    #[serde(default)]
    pub filters: Option<SearchFilters>,
    #[serde(default = "default_rerank")]
    pub rerank: bool,
    #[serde(default)]
    pub rerank_depth: Option<usize>,
    /// Treat the query as code, routing to the code embedder and tier.
    #[serde(default)]
    pub code_query: bool,
    /// Explicit opt-in to the LLM listwise tier.
    #[serde(default)]
    pub llm_rerank: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_rerank() -> bool {
    true
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: None,
            threshold: None,
            strategy: None,
            filters: None,
            rerank: true,
            rerank_depth: None,
            code_query: false,
            llm_rerank: false,
            user_id: None,
        }
    }
}

/// One search hit. `score` is the reranker score when reranking ran, else
/// the fused or similarity score; the components are preserved alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: Uuid,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rrf_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranker_score: Option<f32>,
    pub payload: PointPayload,
}

/// Why the engine declined to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbstentionReason {
    NoResults,
    LowRetrievalScore,
    NoScoreGap,
}

/// Abstention verdict returned with every search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstentionVerdict {
    pub should_abstain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AbstentionReason>,
    pub confidence: f32,
    pub details: String,
}

impl AbstentionVerdict {
    pub fn answer() -> Self {
        Self {
            should_abstain: false,
            reason: None,
            confidence: 0.0,
            details: String::new(),
        }
    }
}

/// A full search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub strategy: RetrievalStrategy,
    pub abstention: AbstentionVerdict,
}
