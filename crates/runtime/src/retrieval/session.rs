//! Two-stage session-aware retrieval.
//!
//! Stage one finds the sessions most relevant to the query; stage two
//! retrieves the best turns inside each of those sessions with a session
//! filter. Per-session failures never fail the batch, and every returned
//! row keeps its session context.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

use super::engine::RetrievalEngine;
use super::types::{SearchFilters, SearchQuery, SearchResult};
use crate::config::RetrievalConfig;
use crate::types::RetrievalError;

/// A stage-two row with its session context.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionScopedResult {
    pub session_id: String,
    pub result: SearchResult,
}

pub struct TwoStageRetriever {
    engine: Arc<RetrievalEngine>,
    config: RetrievalConfig,
}

impl TwoStageRetriever {
    pub fn new(engine: Arc<RetrievalEngine>, config: RetrievalConfig) -> Self {
        Self { engine, config }
    }

    /// Stage one: rank sessions by their best-matching content.
    async fn top_sessions(&self, query: &SearchQuery) -> Result<Vec<String>, RetrievalError> {
        let mut probe = query.clone();
        // Oversample so distinct sessions survive the dedup below.
        probe.limit = Some(self.config.top_sessions * self.config.turns_per_session * 2);
        probe.rerank = false;
        let response = self.engine.search(&probe).await?;

        let mut seen = HashSet::new();
        let mut sessions = Vec::new();
        for result in response.results {
            if seen.insert(result.payload.session_id.clone()) {
                sessions.push(result.payload.session_id);
                if sessions.len() == self.config.top_sessions {
                    break;
                }
            }
        }
        Ok(sessions)
    }

    async fn session_turns(
        &self,
        query: &SearchQuery,
        session_id: &str,
    ) -> Result<Vec<SessionScopedResult>, RetrievalError> {
        let mut scoped = query.clone();
        scoped.limit = Some(self.config.turns_per_session);
        let mut filters = query.filters.clone().unwrap_or(SearchFilters::default());
        filters.session_id = Some(session_id.to_string());
        scoped.filters = Some(filters);
        let response = self.engine.search(&scoped).await?;
        Ok(response
            .results
            .into_iter()
            .map(|result| SessionScopedResult {
                session_id: session_id.to_string(),
                result,
            })
            .collect())
    }

    /// Run both stages and merge to `final_top_k` rows.
    pub async fn search(
        &self,
        query: &SearchQuery,
        final_top_k: usize,
    ) -> Result<Vec<SessionScopedResult>, RetrievalError> {
        let sessions = self.top_sessions(query).await?;
        if sessions.is_empty() {
            return Ok(Vec::new());
        }

        let mut rows: Vec<SessionScopedResult> = Vec::new();
        if self.config.sessions_in_parallel {
            let futures = sessions
                .iter()
                .map(|session_id| self.session_turns(query, session_id));
            for (session_id, outcome) in sessions.iter().zip(join_all(futures).await) {
                match outcome {
                    Ok(mut session_rows) => rows.append(&mut session_rows),
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "Session retrieval failed, continuing batch");
                    }
                }
            }
        } else {
            for session_id in &sessions {
                match self.session_turns(query, session_id).await {
                    Ok(mut session_rows) => rows.append(&mut session_rows),
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "Session retrieval failed, continuing batch");
                    }
                }
            }
        }

        rows.sort_by(|a, b| {
            b.result
                .score
                .partial_cmp(&a.result.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(final_top_k);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RerankConfig;
    use crate::embed::{EmbedderSet, PASSAGE_PREFIX};
    use crate::index::SparseEncoder;
    use crate::rerank::TieredReranker;
    use crate::retrieval::abstention::ScoreBasedDetector;
    use crate::storage::vector::PointPayload;
    use crate::storage::{MemoryVectorIndex, VectorIndex, VectorRecord};
    use uuid::Uuid;

    async fn engine() -> Arc<RetrievalEngine> {
        let index = Arc::new(MemoryVectorIndex::new());
        let embedders = EmbedderSet::mock(64, 64);
        let sparse = SparseEncoder::new();
        let docs = [
            ("s1", "retry logic for the OAuth2 token endpoint"),
            ("s1", "OAuth2 refresh token rotation plan"),
            ("s2", "OAuth2 consent screen layout"),
            ("s3", "unrelated gardening discussion"),
        ];
        let mut records = Vec::new();
        for (i, (session, content)) in docs.iter().enumerate() {
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
                    session_id: session.to_string(),
                    kind: "doc".into(),
                    timestamp: i as i64,
                    file_path: None,
                },
            });
        }
        index.upsert(records).await.unwrap();
        Arc::new(RetrievalEngine::new(
            index,
            embedders,
            Some(Arc::new(TieredReranker::mock(RerankConfig::default()))),
            Arc::new(ScoreBasedDetector::default()),
            RetrievalConfig::default(),
        ))
    }

    #[tokio::test]
    async fn rows_keep_session_context() {
        let retriever = TwoStageRetriever::new(engine().await, RetrievalConfig::default());
        let mut query = SearchQuery::text("OAuth2 token");
        query.strategy = Some(crate::retrieval::RetrievalStrategy::Hybrid);
        let rows = retriever.search(&query, 10).await.unwrap();
        assert!(!rows.is_empty());
        for row in &rows {
            assert_eq!(row.session_id, row.result.payload.session_id);
        }
    }

    #[tokio::test]
    async fn final_top_k_bounds_the_merge() {
        let retriever = TwoStageRetriever::new(engine().await, RetrievalConfig::default());
        let mut query = SearchQuery::text("OAuth2 token");
        query.strategy = Some(crate::retrieval::RetrievalStrategy::Hybrid);
        let rows = retriever.search(&query, 2).await.unwrap();
        assert!(rows.len() <= 2);
    }

    #[tokio::test]
    async fn sequential_mode_matches_parallel() {
        let engine = engine().await;
        let mut sequential_config = RetrievalConfig::default();
        sequential_config.sessions_in_parallel = false;
        let parallel = TwoStageRetriever::new(Arc::clone(&engine), RetrievalConfig::default());
        let sequential = TwoStageRetriever::new(engine, sequential_config);

        let mut query = SearchQuery::text("OAuth2 token");
        query.strategy = Some(crate::retrieval::RetrievalStrategy::Hybrid);
        let a = parallel.search(&query, 5).await.unwrap();
        let b = sequential.search(&query, 5).await.unwrap();
        let ids = |rows: &[SessionScopedResult]| {
            rows.iter().map(|r| r.result.id).collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
    }
}
