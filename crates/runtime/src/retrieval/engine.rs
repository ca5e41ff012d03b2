//! The retrieval engine.
//!
//! Query path: classify, embed with the `query:` prefix, fetch by strategy
//! (dense, sparse, or hybrid with oversampled prefetches fused by RRF),
//! rerank against a hard timeout with fused-order fallback, then evaluate
//! abstention. Results carry both the fused and reranker scores.

use std::sync::Arc;

use super::abstention::AbstentionDetector;
use super::classifier::classify;
use super::fusion::rrf_fuse;
use super::types::{
    RetrievalStrategy, SearchQuery, SearchResponse, SearchResult,
};
use crate::config::RetrievalConfig;
use crate::embed::{EmbedderSet, QUERY_PREFIX};
use crate::index::SparseEncoder;
use crate::rerank::{RerankTier, TieredReranker, TierHints};
use crate::storage::{PointFilter, ScoredHit, VectorIndex, VectorKind};
use crate::types::{RerankError, RetrievalError};

pub struct RetrievalEngine {
    vector: Arc<dyn VectorIndex>,
    embedders: EmbedderSet,
    sparse: SparseEncoder,
    reranker: Option<Arc<TieredReranker>>,
    abstention: Arc<dyn AbstentionDetector>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        embedders: EmbedderSet,
        reranker: Option<Arc<TieredReranker>>,
        abstention: Arc<dyn AbstentionDetector>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            vector,
            embedders,
            sparse: SparseEncoder::new(),
            reranker,
            abstention,
            config,
        }
    }

    fn filter_for(query: &SearchQuery) -> PointFilter {
        let Some(filters) = &query.filters else {
            return PointFilter::default();
        };
        PointFilter {
            session_id: filters.session_id.clone(),
            kind: filters.kind.clone(),
            time_range: filters.time_range.map(|r| (r.start, r.end)),
        }
    }

    async fn embed_query(&self, query: &SearchQuery) -> Result<(VectorKind, Vec<f32>), RetrievalError> {
        if query.code_query {
            let vector = self.embedders.code.embed(&query.text).await?;
            Ok((VectorKind::CodeDense, vector))
        } else {
            let prefixed = format!("{QUERY_PREFIX}{}", query.text);
            let vector = self.embedders.text.embed(&prefixed).await?;
            Ok((VectorKind::TextDense, vector))
        }
    }

    /// Execute a search request end to end.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, RetrievalError> {
        if query.text.trim().is_empty() {
            return Err(RetrievalError::InvalidQuery("empty query text".into()));
        }

        let strategy = query
            .strategy
            .unwrap_or_else(|| classify(&query.text).strategy);
        let limit = query.limit.unwrap_or(self.config.default_limit);
        let rerank_depth = query.rerank_depth.unwrap_or(self.config.rerank_depth);
        let rerank_wanted = query.rerank && self.config.rerank_enabled && self.reranker.is_some();
        let fetch_limit = if rerank_wanted {
            rerank_depth.max(limit)
        } else {
            limit
        };
        let filter = Self::filter_for(query);

        let mut candidates: Vec<SearchResult> = match strategy {
            RetrievalStrategy::Dense => {
                let (kind, vector) = self.embed_query(query).await?;
                let threshold = query.threshold.or(self.config.score_threshold);
                let hits = self
                    .vector
                    .search_dense(kind, vector, &filter, fetch_limit, threshold)
                    .await
                    .map_err(RetrievalError::Vector)?;
                hits.into_iter().map(|hit| plain_result(hit, None)).collect()
            }
            RetrievalStrategy::Sparse => {
                let sparse = self.sparse.encode(&query.text);
                let hits = self
                    .vector
                    .search_sparse(&sparse, &filter, fetch_limit)
                    .await
                    .map_err(RetrievalError::Vector)?;
                hits.into_iter().map(|hit| plain_result(hit, None)).collect()
            }
            RetrievalStrategy::Hybrid => {
                // Two oversampled prefetches fused by reciprocal rank.
                let prefetch = fetch_limit * 2;
                let (kind, vector) = self.embed_query(query).await?;
                let dense = self
                    .vector
                    .search_dense(kind, vector, &filter, prefetch, None)
                    .await
                    .map_err(RetrievalError::Vector)?;
                let sparse_query = self.sparse.encode(&query.text);
                let sparse = self
                    .vector
                    .search_sparse(&sparse_query, &filter, prefetch)
                    .await
                    .map_err(RetrievalError::Vector)?;
                rrf_fuse(&[dense, sparse], self.config.rrf_k)
                    .into_iter()
                    .take(fetch_limit)
                    .map(|fused| {
                        let rrf_score = fused.rrf_score;
                        plain_result(fused.hit, Some(rrf_score))
                    })
                    .collect()
            }
        };

        if rerank_wanted && !candidates.is_empty() {
            self.apply_rerank(query, &mut candidates, rerank_depth).await?;
        }

        candidates.truncate(limit);
        let scores: Vec<f32> = candidates.iter().map(|r| r.score).collect();
        let abstention = self.abstention.evaluate(&scores);

        Ok(SearchResponse {
            results: candidates,
            strategy,
            abstention,
        })
    }

    /// Rerank the head of the candidate list, racing the configured
    /// timeout. Timeouts, open circuits, and backend failures fall back to
    /// the fused order; quota rejections propagate.
    async fn apply_rerank(
        &self,
        query: &SearchQuery,
        candidates: &mut Vec<SearchResult>,
        depth: usize,
    ) -> Result<(), RetrievalError> {
        let reranker = self.reranker.as_ref().expect("caller checked");
        let head = depth.min(candidates.len());
        let documents: Vec<String> = candidates[..head]
            .iter()
            .map(|r| r.payload.content.clone())
            .collect();
        let hints = TierHints {
            content_is_code: query.code_query,
            explicit: query.llm_rerank.then_some(RerankTier::LlmListwise),
            user_id: query.user_id.as_deref(),
        };

        let outcome =
            tokio::time::timeout(self.config.rerank_timeout, reranker.rerank(&query.text, &documents, &hints))
                .await;
        match outcome {
            Ok(Ok(scores)) => {
                for (result, score) in candidates[..head].iter_mut().zip(&scores) {
                    result.reranker_score = Some(*score);
                    result.score = *score;
                }
                candidates.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            Ok(Err(e @ RerankError::RateLimited { .. })) => {
                return Err(RetrievalError::RerankRejected(e));
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Reranker failed, keeping fused order");
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.rerank_timeout.as_millis() as u64,
                    "Reranker timed out, keeping fused order"
                );
            }
        }
        Ok(())
    }
}

fn plain_result(hit: ScoredHit, rrf_score: Option<f32>) -> SearchResult {
    SearchResult {
        id: hit.id,
        score: rrf_score.unwrap_or(hit.score),
        rrf_score,
        reranker_score: None,
        payload: hit.payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RerankConfig;
    use crate::embed::PASSAGE_PREFIX;
    use crate::retrieval::abstention::ScoreBasedDetector;
    use crate::storage::vector::PointPayload;
    use crate::storage::{MemoryVectorIndex, VectorRecord};
    use uuid::Uuid;

    async fn seed(index: &MemoryVectorIndex, embedders: &EmbedderSet, docs: &[(&str, &str)]) {
        let sparse = SparseEncoder::new();
        let mut records = Vec::new();
        for (i, (kind, content)) in docs.iter().enumerate() {
            let prefixed = format!("{PASSAGE_PREFIX}{content}");
            records.push(VectorRecord {
                id: Uuid::from_u128(i as u128 + 1),
                text_dense: Some(embedders.text.embed(&prefixed).await.unwrap()),
                code_dense: None,
                sparse: Some(sparse.encode(content)),
                colbert: None,
                payload: PointPayload {
                    content: content.to_string(),
                    node_id: Uuid::from_u128(i as u128 + 1),
                    session_id: "s1".into(),
                    kind: kind.to_string(),
                    timestamp: 1_000 + i as i64,
                    file_path: None,
                },
            });
        }
        index.upsert(records).await.unwrap();
    }

    async fn engine_with_docs(docs: &[(&str, &str)]) -> RetrievalEngine {
        let index = Arc::new(MemoryVectorIndex::new());
        let embedders = EmbedderSet::mock(64, 64);
        seed(&index, &embedders, docs).await;
        RetrievalEngine::new(
            index,
            embedders,
            Some(Arc::new(TieredReranker::mock(RerankConfig::default()))),
            Arc::new(ScoreBasedDetector::default()),
            RetrievalConfig::default(),
        )
    }

    const DOCS: &[(&str, &str)] = &[
        ("doc", "OAuth2 implementation with token refresh and PKCE"),
        ("doc", "notes on OAuth2 scopes and consent screens"),
        ("doc", "how to braid bread dough"),
        ("doc", "retry budgets for flaky integration tests"),
        ("doc", "OAuth2 flows diagram and sequence charts"),
    ];

    #[tokio::test]
    async fn hybrid_search_ranks_literal_match_first_after_rerank() {
        let engine = engine_with_docs(DOCS).await;
        let mut query = SearchQuery::text("OAuth2 implementation");
        query.strategy = Some(RetrievalStrategy::Hybrid);
        let response = engine.search(&query).await.unwrap();

        assert!(!response.results.is_empty());
        assert!(response.results[0]
            .payload
            .content
            .contains("OAuth2 implementation"));
        let top = &response.results[0];
        assert!(top.rrf_score.is_some());
        assert!(top.reranker_score.is_some());
        assert_eq!(top.score, top.reranker_score.unwrap());
    }

    #[tokio::test]
    async fn dense_path_reports_similarity_scores() {
        let engine = engine_with_docs(DOCS).await;
        let mut query = SearchQuery::text("OAuth2 implementation");
        query.strategy = Some(RetrievalStrategy::Dense);
        query.rerank = false;
        let response = engine.search(&query).await.unwrap();
        assert!(response.results[0].rrf_score.is_none());
        assert!(response.results[0].reranker_score.is_none());
    }

    #[tokio::test]
    async fn filters_scope_the_search() {
        let engine = engine_with_docs(DOCS).await;
        let mut query = SearchQuery::text("OAuth2 implementation");
        query.strategy = Some(RetrievalStrategy::Sparse);
        query.rerank = false;
        query.filters = Some(crate::retrieval::SearchFilters {
            session_id: Some("other-session".into()),
            kind: None,
            time_range: None,
        });
        let response = engine.search(&query).await.unwrap();
        assert!(response.results.is_empty());
        assert!(response.abstention.should_abstain);
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let engine = engine_with_docs(DOCS).await;
        let query = SearchQuery::text("   ");
        assert!(matches!(
            engine.search(&query).await,
            Err(RetrievalError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn abstention_fires_on_empty_result_set() {
        let engine = engine_with_docs(&[]).await;
        let mut query = SearchQuery::text("anything at all");
        query.strategy = Some(RetrievalStrategy::Dense);
        let response = engine.search(&query).await.unwrap();
        assert!(response.abstention.should_abstain);
        assert_eq!(response.abstention.confidence, 1.0);
    }

    #[tokio::test]
    async fn over_quota_llm_rerank_propagates_rejection() {
        let index = Arc::new(MemoryVectorIndex::new());
        let embedders = EmbedderSet::mock(64, 64);
        seed(&index, &embedders, DOCS).await;
        let reranker = TieredReranker::mock(RerankConfig {
            llm_requests_per_window: 0,
            ..Default::default()
        });
        let engine = RetrievalEngine::new(
            index,
            embedders,
            Some(Arc::new(reranker)),
            Arc::new(ScoreBasedDetector::default()),
            RetrievalConfig::default(),
        );
        let mut query = SearchQuery::text("OAuth2 implementation");
        query.strategy = Some(RetrievalStrategy::Hybrid);
        query.llm_rerank = true;
        query.user_id = Some("u1".into());
        let err = engine.search(&query).await.unwrap_err();
        assert!(matches!(err, RetrievalError::RerankRejected(_)));
    }
}
