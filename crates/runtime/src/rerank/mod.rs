//! Tiered reranking.
//!
//! Candidates pass through one of four tiers: a fast cross-encoder by
//! default, a larger one for long or agentic queries, a code-specialized
//! one for code content, and an opt-in LLM listwise tier behind a per-user
//! rate limiter. Cross-encoder tiers batch candidates and score batches
//! with bounded concurrency; raw logits pass through a sigmoid into `0..1`.

pub mod breaker;
pub mod cache;
pub mod llm;
pub mod rate_limit;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use cache::{ModelCache, ModelKey, ModelLoader};
pub use llm::LlmListwiseReranker;
pub use rate_limit::SlidingWindowLimiter;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RerankConfig;
use crate::types::RerankError;

/// Reranker tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankTier {
    Fast,
    Accurate,
    Code,
    LlmListwise,
}

impl RerankTier {
    pub fn model_name(&self) -> &'static str {
        match self {
            Self::Fast => "cross-encoder/ms-marco-MiniLM-L6-v2",
            Self::Accurate => "BAAI/bge-reranker-base",
            Self::Code => "jinaai/jina-reranker-v2-base-code",
            Self::LlmListwise => "listwise",
        }
    }
}

/// Cross-encoder capability: `g(query, doc) -> score` over a batch.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Raw relevance logits, one per document.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError>;

    /// Endpoint identity for circuit breaking.
    fn endpoint(&self) -> &str;
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// HTTP cross-encoder speaking the common `/rerank` shape.
pub struct HttpCrossEncoder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpCrossEncoder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RerankError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RerankError::Backend(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        let url = format!("{}/rerank", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
        });
        let mut request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RerankError::Backend(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RerankError::Backend(format!(
                "reranker returned {}",
                response.status()
            )));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RerankError::MalformedResponse(e.to_string()))?;
        let results = json
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or_else(|| RerankError::MalformedResponse("missing 'results'".into()))?;
        let mut scores = vec![0.0f32; documents.len()];
        for item in results {
            let index = item.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let score = item
                .get("relevance_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0) as f32;
            if index < scores.len() {
                scores[index] = score;
            }
        }
        Ok(scores)
    }

    fn endpoint(&self) -> &str {
        &self.model
    }
}

/// Deterministic token-overlap scorer for tests and unconfigured
/// deployments. Emits logits: overlap count minus one.
pub struct MockCrossEncoder {
    name: String,
}

impl MockCrossEncoder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl CrossEncoder for MockCrossEncoder {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, RerankError> {
        let query_tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();
        Ok(documents
            .iter()
            .map(|doc| {
                let doc_lower = doc.to_lowercase();
                let overlap = query_tokens
                    .iter()
                    .filter(|token| doc_lower.contains(token.as_str()))
                    .count() as f32;
                // Exact phrase presence dominates token overlap.
                let phrase_bonus = if doc_lower.contains(&query.to_lowercase()) {
                    4.0
                } else {
                    0.0
                };
                overlap + phrase_bonus - 1.0
            })
            .collect())
    }

    fn endpoint(&self) -> &str {
        &self.name
    }
}

/// Inputs that pick a tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierHints<'a> {
    pub content_is_code: bool,
    pub explicit: Option<RerankTier>,
    pub user_id: Option<&'a str>,
}

/// The tiered reranker.
pub struct TieredReranker {
    cache: Arc<ModelCache>,
    breaker: CircuitBreakerRegistry,
    limiter: SlidingWindowLimiter,
    llm: Option<Arc<LlmListwiseReranker>>,
    config: RerankConfig,
}

impl TieredReranker {
    pub fn new(
        config: RerankConfig,
        loader: ModelLoader,
        llm: Option<Arc<LlmListwiseReranker>>,
    ) -> Self {
        Self {
            cache: Arc::new(ModelCache::new(loader, config.model_idle_timeout)),
            breaker: CircuitBreakerRegistry::default(),
            limiter: SlidingWindowLimiter::new(
                config.llm_window,
                config.llm_requests_per_window,
                config.llm_budget_cents,
            ),
            llm,
            config,
        }
    }

    /// Mock-backed reranker for tests.
    pub fn mock(config: RerankConfig) -> Self {
        let loader: ModelLoader = Arc::new(|model, _quant| {
            let model = model.to_string();
            Box::pin(async move {
                Ok(Arc::new(MockCrossEncoder::new(model)) as Arc<dyn CrossEncoder>)
            })
        });
        Self::new(config, loader, None)
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    /// Tier selection: explicit opt-in wins, then code content, then long
    /// or agentic queries, else fast.
    pub fn select_tier(&self, query: &str, hints: &TierHints<'_>) -> RerankTier {
        if let Some(explicit) = hints.explicit {
            return explicit;
        }
        if hints.content_is_code || looks_like_code(query) {
            return RerankTier::Code;
        }
        let words = query.split_whitespace().count();
        if words > self.config.accurate_query_words || is_agentic(query) {
            return RerankTier::Accurate;
        }
        RerankTier::Fast
    }

    /// Score `documents` against `query` using the chosen tier. Returns one
    /// score in `0..1` per document.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        hints: &TierHints<'_>,
    ) -> Result<Vec<f32>, RerankError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let tier = self.select_tier(query, hints);

        if tier == RerankTier::LlmListwise {
            let user_id = hints.user_id.unwrap_or("anonymous");
            self.limiter
                .check_and_record(user_id, self.config.llm_cost_per_request_cents)?;
            let llm = self
                .llm
                .as_ref()
                .ok_or_else(|| RerankError::Backend("listwise tier not configured".into()))?;
            return llm.rerank(query, documents).await;
        }

        let endpoint = tier.model_name();
        if !self.breaker.check(endpoint).await {
            return Err(RerankError::CircuitOpen {
                endpoint: endpoint.to_string(),
            });
        }

        let model = self.cache.get(endpoint, "int8").await?;
        let batches: Vec<Vec<String>> = documents
            .chunks(self.config.max_batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();

        let scored = stream::iter(batches.into_iter().map(|batch| {
            let model = Arc::clone(&model);
            let query = query.to_string();
            async move { model.score(&query, &batch).await }
        }))
        .buffered(self.config.max_concurrency)
        .try_concat()
        .await;

        match scored {
            Ok(logits) => {
                self.breaker.record_success(endpoint).await;
                Ok(logits.into_iter().map(sigmoid).collect())
            }
            Err(e) => {
                self.breaker.record_failure(endpoint).await;
                Err(e)
            }
        }
    }
}

fn looks_like_code(query: &str) -> bool {
    query.contains("::")
        || query.contains("fn ")
        || query.contains("=>")
        || query.contains("();")
        || query.contains("def ")
        || query.contains("impl ")
}

fn is_agentic(query: &str) -> bool {
    let lower = query.to_lowercase();
    ["step by step", "plan", "then", "first", "workflow"]
        .iter()
        .any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reranker() -> TieredReranker {
        TieredReranker::mock(RerankConfig::default())
    }

    #[test]
    fn tier_selection_rules() {
        let r = reranker();
        assert_eq!(
            r.select_tier("find the session", &TierHints::default()),
            RerankTier::Fast
        );
        assert_eq!(
            r.select_tier("impl Display for SessionId", &TierHints::default()),
            RerankTier::Code
        );
        let long = "word ".repeat(30);
        assert_eq!(r.select_tier(&long, &TierHints::default()), RerankTier::Accurate);
        assert_eq!(
            r.select_tier(
                "anything",
                &TierHints {
                    explicit: Some(RerankTier::LlmListwise),
                    ..Default::default()
                }
            ),
            RerankTier::LlmListwise
        );
    }

    #[tokio::test]
    async fn scores_are_sigmoid_bounded_and_ordered() {
        let r = reranker();
        let docs = vec![
            "OAuth2 implementation with refresh tokens".to_string(),
            "gardening tips".to_string(),
        ];
        let scores = r
            .rerank("OAuth2 implementation", &docs, &TierHints::default())
            .await
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn batching_preserves_document_order() {
        let config = RerankConfig {
            max_batch_size: 2,
            max_concurrency: 2,
            ..Default::default()
        };
        let r = TieredReranker::mock(config);
        let docs: Vec<String> = (0..7).map(|i| format!("document number {i}")).collect();
        let scores = r
            .rerank("document number 6", &docs, &TierHints::default())
            .await
            .unwrap();
        assert_eq!(scores.len(), 7);
        let best = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(best, 6);
    }

    #[tokio::test]
    async fn llm_tier_without_backend_is_rate_limited_then_errors() {
        let r = reranker();
        let hints = TierHints {
            explicit: Some(RerankTier::LlmListwise),
            user_id: Some("u1"),
            ..Default::default()
        };
        let err = r
            .rerank("query", &["doc".to_string()], &hints)
            .await
            .unwrap_err();
        // No LLM configured: admitted by the limiter, then backend error.
        assert!(matches!(err, RerankError::Backend(_)));
    }

    #[tokio::test]
    async fn over_quota_user_is_rejected_with_reset_time() {
        let config = RerankConfig {
            llm_requests_per_window: 1,
            ..Default::default()
        };
        let r = TieredReranker::mock(config);
        let hints = TierHints {
            explicit: Some(RerankTier::LlmListwise),
            user_id: Some("u1"),
            ..Default::default()
        };
        let _ = r.rerank("q", &["d".to_string()], &hints).await;
        let err = r.rerank("q", &["d".to_string()], &hints).await.unwrap_err();
        match err {
            RerankError::RateLimited {
                reason, reset_at, ..
            } => {
                assert!(reason.contains("Rate limit exceeded"));
                assert!(reset_at > crate::types::now_ms());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
