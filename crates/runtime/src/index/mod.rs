//! Vector indexer.
//!
//! Consumes the durable node-created stream, embeds content along the code
//! or text path, and upserts multi-named-vector points keyed by node id.
//! Acknowledges each delivery only after a successful upsert.

pub mod chunker;
pub mod sparse;

pub use sparse::SparseEncoder;

use std::sync::Arc;
use uuid::Uuid;

use crate::embed::{mean_pooled, EmbedderSet, PASSAGE_PREFIX};
use crate::retry::RetryPolicy;
use crate::storage::{
    BlobStore, PointFilter, ScoredHit, Subscription, VectorIndex, VectorKind, VectorRecord,
};
use crate::storage::vector::PointPayload;
use crate::types::{EmbedError, IndexError, NodeCreated, NodeLabel};

const CODE_CHUNK_SIZE: usize = 6000;
const CODE_CHUNK_OVERLAP: usize = 500;
const CODE_MAX_CHUNKS: usize = 5;

/// Maps a node label onto the payload `type` facet.
fn kind_for(label: NodeLabel) -> &'static str {
    match label {
        NodeLabel::DiffHunk | NodeLabel::CodeArtifact => "code",
        NodeLabel::Reasoning => "thought",
        _ => "doc",
    }
}

fn is_code(label: NodeLabel) -> bool {
    matches!(label, NodeLabel::DiffHunk | NodeLabel::CodeArtifact)
}

/// The indexing service.
pub struct Indexer {
    vector: Arc<dyn VectorIndex>,
    blob: Arc<dyn BlobStore>,
    embedders: EmbedderSet,
    sparse: SparseEncoder,
    retry: RetryPolicy,
}

impl Indexer {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        blob: Arc<dyn BlobStore>,
        embedders: EmbedderSet,
    ) -> Self {
        Self {
            vector,
            blob,
            embedders,
            sparse: SparseEncoder::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Resolve the content for a notification: inline when present,
    /// otherwise fetched from blob storage.
    async fn resolve_content(&self, notification: &NodeCreated) -> Result<String, IndexError> {
        if let Some(content) = &notification.content {
            return Ok(content.clone());
        }
        let Some(uri) = &notification.payload_ref else {
            return Ok(String::new());
        };
        let bytes = self
            .blob
            .load(uri)
            .await
            .map_err(|e| IndexError::MalformedNotification(format!("blob load failed: {e}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Embed and upsert one node. Returns the point id, or `None` when the
    /// node was skipped (empty content).
    pub async fn index_node(&self, notification: &NodeCreated) -> Result<Option<Uuid>, IndexError> {
        let content = self.resolve_content(notification).await?;
        if content.trim().is_empty() {
            return Ok(None);
        }

        let mut record = VectorRecord {
            id: notification.node_id.0,
            text_dense: None,
            code_dense: None,
            sparse: Some(self.sparse.encode(&content)),
            colbert: None,
            payload: PointPayload {
                content: content.clone(),
                node_id: notification.node_id.0,
                session_id: notification.session_id.to_string(),
                kind: kind_for(notification.node_type).to_string(),
                timestamp: notification.timestamp,
                file_path: notification.file_path.clone(),
            },
        };

        if is_code(notification.node_type) {
            record.code_dense = Some(self.embed_code(&content).await?);
        } else {
            let prefixed = format!("{PASSAGE_PREFIX}{content}");
            record.text_dense = Some(self.embedders.text.embed(&prefixed).await?);
        }

        if let Some(colbert) = &self.embedders.colbert {
            record.colbert = Some(colbert.embed_tokens(&content).await?);
        }

        let id = record.id;
        self.retry
            .run(
                || {
                    let record = record.clone();
                    async move { self.vector.upsert(vec![record]).await }
                },
                |e| e.is_transient(),
            )
            .await
            .map_err(IndexError::Vector)?;
        Ok(Some(id))
    }

    /// Long patches are chunked, embedded separately, and mean-pooled.
    async fn embed_code(&self, content: &str) -> Result<Vec<f32>, EmbedError> {
        let chunks = chunker::chunk_text(content, CODE_CHUNK_SIZE, CODE_CHUNK_OVERLAP, CODE_MAX_CHUNKS);
        if chunks.len() == 1 {
            return self.embedders.code.embed(&chunks[0]).await;
        }
        let vectors = self.embedders.code.embed_batch(&chunks).await?;
        Ok(mean_pooled(&vectors))
    }

    /// Consume the node-created stream until the subscription closes.
    pub async fn run(&self, mut subscription: Subscription) {
        while let Some(delivery) = subscription.next().await {
            let notification: NodeCreated =
                match serde_json::from_slice(&delivery.record.value) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping malformed node-created notification");
                        let _ = delivery.ack().await;
                        continue;
                    }
                };
            match self.index_node(&notification).await {
                Ok(Some(id)) => {
                    tracing::debug!(point_id = %id, "Indexed node");
                }
                Ok(None) => {
                    tracing::debug!(node_id = %notification.node_id, "Skipped empty node");
                }
                Err(e) => {
                    tracing::warn!(node_id = %notification.node_id, error = %e, "Indexing failed, skipping node");
                }
            }
            if let Err(e) = delivery.ack().await {
                tracing::warn!(error = %e, "Indexer ack failed");
            }
        }
    }
}

/// Dense-similarity deduplicator consulted before indexing thoughts.
pub struct Deduplicator {
    vector: Arc<dyn VectorIndex>,
    embedders: EmbedderSet,
    threshold: f32,
}

impl Deduplicator {
    pub fn new(vector: Arc<dyn VectorIndex>, embedders: EmbedderSet, threshold: f32) -> Self {
        Self {
            vector,
            embedders,
            threshold,
        }
    }

    /// Returns the id of an existing near-duplicate, if any scores at or
    /// above the threshold.
    pub async fn find_duplicate(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<Option<Uuid>, IndexError> {
        let prefixed = format!("{PASSAGE_PREFIX}{content}");
        let embedding = self.embedders.text.embed(&prefixed).await?;
        let filter = PointFilter {
            session_id: Some(session_id.to_string()),
            kind: Some("thought".to_string()),
            time_range: None,
        };
        let hits: Vec<ScoredHit> = self
            .vector
            .search_dense(
                VectorKind::TextDense,
                embedding,
                &filter,
                1,
                Some(self.threshold),
            )
            .await
            .map_err(IndexError::Vector)?;
        Ok(hits.first().map(|hit| hit.id))
    }
}
