//! Hybrid vector store facade.
//!
//! One collection per deployment with named dense vectors (`text_dense`
//! 384d, `code_dense` 768d), a sparse field, and an optional late-interaction
//! `colbert` multi-vector (128d per token, MaxSim). Point ids equal source
//! node ids so re-indexing replaces in place.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use qdrant_client::config::QdrantConfig as ClientConfig;
use qdrant_client::qdrant::{
    condition::ConditionOneOf, r#match::MatchValue, points_selector::PointsSelectorOneOf,
    value::Kind, vectors::VectorsOptions, vectors_config, with_payload_selector::SelectorOptions,
    Condition, CreateCollection, CreateFieldIndexCollection, DeletePoints, Distance,
    FieldCondition, FieldType, Filter, Match, MultiVectorComparator, MultiVectorConfig, NamedVectors,
    PointId, PointStruct, PointsIdsList, PointsSelector, Range, SearchPoints, SparseIndices,
    SparseVectorConfig, SparseVectorParams, UpsertPoints, Value as QdrantValue, Vector,
    VectorParams, VectorParamsMap, Vectors, VectorsConfig, WithPayloadSelector,
};
use qdrant_client::Qdrant;

use crate::config::VectorConfig;
use crate::types::StorageError;

pub const VECTOR_TEXT_DENSE: &str = "text_dense";
pub const VECTOR_CODE_DENSE: &str = "code_dense";
pub const VECTOR_SPARSE: &str = "sparse";
pub const VECTOR_COLBERT: &str = "colbert";

fn map_qdrant_error(error: qdrant_client::QdrantError) -> StorageError {
    match error {
        qdrant_client::QdrantError::ResponseError { status, .. } => {
            match status.code() as i32 {
                // gRPC NotFound / DeadlineExceeded / Unavailable.
                5 => StorageError::NotFound(status.to_string()),
                4 => StorageError::Timeout(status.to_string()),
                14 => StorageError::ConnectionFailed(status.to_string()),
                _ => StorageError::Backend(status.to_string()),
            }
        }
        err @ qdrant_client::QdrantError::ConversionError { .. } => {
            StorageError::Serialization(err.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

/// Which named dense vector to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    TextDense,
    CodeDense,
}

impl VectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TextDense => VECTOR_TEXT_DENSE,
            Self::CodeDense => VECTOR_CODE_DENSE,
        }
    }
}

/// Sparse vector with strictly ascending indices.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    /// Dot product over the shared indices.
    pub fn dot(&self, other: &Self) -> f32 {
        let mut score = 0.0;
        let (mut i, mut j) = (0, 0);
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    score += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        score
    }
}

/// Indexed payload stored alongside every point.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PointPayload {
    pub content: String,
    pub node_id: Uuid,
    pub session_id: String,
    /// `thought`, `code`, or `doc`.
    pub kind: String,
    pub timestamp: i64,
    pub file_path: Option<String>,
}

/// A point to upsert. The id replaces any prior version.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: Uuid,
    pub text_dense: Option<Vec<f32>>,
    pub code_dense: Option<Vec<f32>>,
    pub sparse: Option<SparseVector>,
    pub colbert: Option<Vec<Vec<f32>>>,
    pub payload: PointPayload,
}

/// Payload filter for searches.
#[derive(Debug, Clone, Default)]
pub struct PointFilter {
    pub session_id: Option<String>,
    pub kind: Option<String>,
    pub time_range: Option<(i64, i64)>,
}

impl PointFilter {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.kind.is_none() && self.time_range.is_none()
    }

    fn matches(&self, payload: &PointPayload) -> bool {
        if let Some(session) = &self.session_id {
            if payload.session_id != *session {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if payload.kind != *kind {
                return false;
            }
        }
        if let Some((start, end)) = self.time_range {
            if payload.timestamp < start || payload.timestamp > end {
                return false;
            }
        }
        true
    }
}

/// A scored search hit.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub id: Uuid,
    pub score: f32,
    pub payload: PointPayload,
}

/// Vector index capability.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;
    async fn disconnect(&self) -> Result<(), StorageError>;
    fn is_connected(&self) -> bool;

    /// Ensure the collection exists with the expected schema. A mismatch is
    /// fatal unless the destructive migration flag was set, in which case
    /// the collection is deleted and recreated (idempotent).
    async fn ensure_collection(&self) -> Result<(), StorageError>;

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), StorageError>;

    async fn delete(&self, ids: Vec<Uuid>) -> Result<(), StorageError>;

    async fn search_dense(
        &self,
        kind: VectorKind,
        vector: Vec<f32>,
        filter: &PointFilter,
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredHit>, StorageError>;

    async fn search_sparse(
        &self,
        sparse: &SparseVector,
        filter: &PointFilter,
        limit: usize,
    ) -> Result<Vec<ScoredHit>, StorageError>;
}

// ---------------------------------------------------------------------------
// Qdrant backend
// ---------------------------------------------------------------------------

pub struct QdrantVectorIndex {
    client: RwLock<Option<Arc<Qdrant>>>,
    config: VectorConfig,
    connected: AtomicBool,
}

impl QdrantVectorIndex {
    pub fn new(config: VectorConfig) -> Self {
        Self {
            client: RwLock::new(None),
            config,
            connected: AtomicBool::new(false),
        }
    }

    async fn get_client(&self) -> Result<Arc<Qdrant>, StorageError> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }
        let mut guard = self.client.write().await;
        if let Some(client) = guard.as_ref() {
            return Ok(Arc::clone(client));
        }
        let mut client_config = ClientConfig::from_url(&self.config.url);
        if let Some(api_key) = &self.config.api_key {
            client_config.api_key = Some(api_key.clone());
        }
        let client = Arc::new(Qdrant::new(client_config).map_err(map_qdrant_error)?);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    fn expected_dense_params(&self) -> Vec<(&'static str, u64)> {
        let mut params = vec![
            (VECTOR_TEXT_DENSE, self.config.text_dimension as u64),
            (VECTOR_CODE_DENSE, self.config.code_dimension as u64),
        ];
        if let Some(dim) = self.config.colbert_dimension {
            params.push((VECTOR_COLBERT, dim as u64));
        }
        params
    }

    fn vectors_config(&self) -> VectorsConfig {
        let mut map = HashMap::new();
        for (name, size) in self.expected_dense_params() {
            let multivector_config = (name == VECTOR_COLBERT).then(|| MultiVectorConfig {
                comparator: MultiVectorComparator::MaxSim as i32,
            });
            map.insert(
                name.to_string(),
                VectorParams {
                    size,
                    distance: Distance::Cosine as i32,
                    hnsw_config: None,
                    quantization_config: None,
                    on_disk: None,
                    datatype: None,
                    multivector_config,
                },
            );
        }
        VectorsConfig {
            config: Some(vectors_config::Config::ParamsMap(VectorParamsMap { map })),
        }
    }

    async fn create_collection(&self, client: &Qdrant) -> Result<(), StorageError> {
        let mut sparse_map = HashMap::new();
        sparse_map.insert(VECTOR_SPARSE.to_string(), SparseVectorParams::default());

        let create = CreateCollection {
            collection_name: self.config.collection.clone(),
            vectors_config: Some(self.vectors_config()),
            hnsw_config: None,
            wal_config: None,
            optimizers_config: None,
            shard_number: None,
            on_disk_payload: None,
            timeout: Some(self.config.timeout_seconds),
            replication_factor: None,
            write_consistency_factor: None,
            init_from_collection: None,
            quantization_config: None,
            sharding_method: None,
            sparse_vectors_config: Some(SparseVectorConfig { map: sparse_map }),
            strict_mode_config: None,
        };
        client
            .create_collection(create)
            .await
            .map_err(map_qdrant_error)?;

        for field in ["session_id", "type"] {
            client
                .create_field_index(CreateFieldIndexCollection {
                    collection_name: self.config.collection.clone(),
                    wait: Some(true),
                    field_name: field.to_string(),
                    field_type: Some(FieldType::Keyword as i32),
                    field_index_params: None,
                    ordering: None,
                })
                .await
                .map_err(map_qdrant_error)?;
        }
        client
            .create_field_index(CreateFieldIndexCollection {
                collection_name: self.config.collection.clone(),
                wait: Some(true),
                field_name: "timestamp".to_string(),
                field_type: Some(FieldType::Integer as i32),
                field_index_params: None,
                ordering: None,
            })
            .await
            .map_err(map_qdrant_error)?;
        tracing::info!(collection = %self.config.collection, "Vector collection created");
        Ok(())
    }

    /// Compare the live schema's named dense vectors against expectations.
    async fn schema_matches(&self, client: &Qdrant) -> Result<bool, StorageError> {
        let info = client
            .collection_info(&self.config.collection)
            .await
            .map_err(map_qdrant_error)?;
        let params = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);
        let Some(vectors_config::Config::ParamsMap(map)) = params else {
            return Ok(false);
        };
        for (name, size) in self.expected_dense_params() {
            match map.map.get(name) {
                Some(p) if p.size == size && p.distance == Distance::Cosine as i32 => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn build_filter(filter: &PointFilter) -> Option<Filter> {
        if filter.is_empty() {
            return None;
        }
        let mut must = Vec::new();
        if let Some(session_id) = &filter.session_id {
            must.push(keyword_condition("session_id", session_id));
        }
        if let Some(kind) = &filter.kind {
            must.push(keyword_condition("type", kind));
        }
        if let Some((start, end)) = filter.time_range {
            must.push(Condition {
                condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
                    key: "timestamp".to_string(),
                    r#match: None,
                    range: Some(Range {
                        lt: None,
                        gt: None,
                        gte: Some(start as f64),
                        lte: Some(end as f64),
                    }),
                    geo_bounding_box: None,
                    geo_radius: None,
                    values_count: None,
                    geo_polygon: None,
                    datetime_range: None,
                    is_empty: None,
                    is_null: None,
                })),
            });
        }
        Some(Filter {
            should: vec![],
            min_should: None,
            must,
            must_not: vec![],
        })
    }

    fn payload_map(payload: &PointPayload) -> HashMap<String, QdrantValue> {
        let mut map = HashMap::new();
        map.insert(
            "content".to_string(),
            QdrantValue::from(payload.content.clone()),
        );
        map.insert(
            "node_id".to_string(),
            QdrantValue::from(payload.node_id.to_string()),
        );
        map.insert(
            "session_id".to_string(),
            QdrantValue::from(payload.session_id.clone()),
        );
        map.insert("type".to_string(), QdrantValue::from(payload.kind.clone()));
        map.insert(
            "timestamp".to_string(),
            QdrantValue::from(payload.timestamp),
        );
        if let Some(path) = &payload.file_path {
            map.insert("file_path".to_string(), QdrantValue::from(path.clone()));
        }
        map
    }

    fn payload_from_map(map: &HashMap<String, QdrantValue>) -> Option<PointPayload> {
        let get_str = |key: &str| -> Option<String> {
            map.get(key).and_then(|v| match &v.kind {
                Some(Kind::StringValue(s)) => Some(s.clone()),
                _ => None,
            })
        };
        let get_i64 = |key: &str| -> Option<i64> {
            map.get(key).and_then(|v| match &v.kind {
                Some(Kind::IntegerValue(i)) => Some(*i),
                Some(Kind::DoubleValue(d)) => Some(*d as i64),
                _ => None,
            })
        };
        Some(PointPayload {
            content: get_str("content").unwrap_or_default(),
            node_id: get_str("node_id").and_then(|s| Uuid::parse_str(&s).ok())?,
            session_id: get_str("session_id").unwrap_or_default(),
            kind: get_str("type").unwrap_or_default(),
            timestamp: get_i64("timestamp").unwrap_or_default(),
            file_path: get_str("file_path"),
        })
    }

    fn record_to_point(record: &VectorRecord) -> PointStruct {
        let mut named = HashMap::new();
        if let Some(dense) = &record.text_dense {
            named.insert(
                VECTOR_TEXT_DENSE.to_string(),
                Vector {
                    data: dense.clone(),
                    ..Default::default()
                },
            );
        }
        if let Some(dense) = &record.code_dense {
            named.insert(
                VECTOR_CODE_DENSE.to_string(),
                Vector {
                    data: dense.clone(),
                    ..Default::default()
                },
            );
        }
        if let Some(sparse) = &record.sparse {
            named.insert(
                VECTOR_SPARSE.to_string(),
                Vector {
                    data: sparse.values.clone(),
                    indices: Some(SparseIndices {
                        data: sparse.indices.clone(),
                    }),
                    ..Default::default()
                },
            );
        }
        if let Some(token_vectors) = &record.colbert {
            let count = token_vectors.len() as u32;
            named.insert(
                VECTOR_COLBERT.to_string(),
                Vector {
                    data: token_vectors.iter().flatten().copied().collect(),
                    vectors_count: Some(count),
                    ..Default::default()
                },
            );
        }
        PointStruct {
            id: Some(PointId::from(record.id.to_string())),
            payload: Self::payload_map(&record.payload),
            vectors: Some(Vectors {
                vectors_options: Some(VectorsOptions::Vectors(NamedVectors { vectors: named })),
            }),
        }
    }

    fn hits_from_response(
        points: Vec<qdrant_client::qdrant::ScoredPoint>,
    ) -> Vec<ScoredHit> {
        points
            .into_iter()
            .filter_map(|point| {
                let id = point.id.as_ref().and_then(|id| match &id.point_id_options {
                    Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(s)) => {
                        Uuid::parse_str(s).ok()
                    }
                    _ => None,
                })?;
                let payload = Self::payload_from_map(&point.payload)?;
                Some(ScoredHit {
                    id,
                    score: point.score,
                    payload,
                })
            })
            .collect()
    }
}

fn keyword_condition(key: &str, value: &str) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            r#match: Some(Match {
                match_value: Some(MatchValue::Keyword(value.to_string())),
            }),
            range: None,
            geo_bounding_box: None,
            geo_radius: None,
            values_count: None,
            geo_polygon: None,
            datetime_range: None,
            is_empty: None,
            is_null: None,
        })),
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn connect(&self) -> Result<(), StorageError> {
        self.get_client().await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        self.client.write().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_collection(&self) -> Result<(), StorageError> {
        let client = self.get_client().await?;
        let exists = client
            .collection_exists(&self.config.collection)
            .await
            .map_err(map_qdrant_error)?;
        if !exists {
            return self.create_collection(&client).await;
        }
        if self.schema_matches(&client).await? {
            return Ok(());
        }
        if !self.config.recreate_on_mismatch {
            return Err(StorageError::SchemaMismatch {
                name: self.config.collection.clone(),
                reason: "vector schema differs; set the migration flag to recreate".into(),
            });
        }
        tracing::warn!(
            collection = %self.config.collection,
            "Vector schema mismatch, deleting and recreating collection"
        );
        client
            .delete_collection(&self.config.collection)
            .await
            .map_err(map_qdrant_error)?;
        self.create_collection(&client).await
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let client = self.get_client().await?;
        let points: Vec<PointStruct> = records.iter().map(Self::record_to_point).collect();
        client
            .upsert_points(UpsertPoints {
                collection_name: self.config.collection.clone(),
                wait: Some(true),
                points,
                ordering: None,
                shard_key_selector: None,
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(())
    }

    async fn delete(&self, ids: Vec<Uuid>) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let client = self.get_client().await?;
        client
            .delete_points(DeletePoints {
                collection_name: self.config.collection.clone(),
                wait: Some(true),
                points: Some(PointsSelector {
                    points_selector_one_of: Some(PointsSelectorOneOf::Points(PointsIdsList {
                        ids: ids
                            .into_iter()
                            .map(|id| PointId::from(id.to_string()))
                            .collect(),
                    })),
                }),
                ordering: None,
                shard_key_selector: None,
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(())
    }

    async fn search_dense(
        &self,
        kind: VectorKind,
        vector: Vec<f32>,
        filter: &PointFilter,
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredHit>, StorageError> {
        let client = self.get_client().await?;
        let response = client
            .search_points(SearchPoints {
                collection_name: self.config.collection.clone(),
                vector,
                vector_name: Some(kind.name().to_string()),
                filter: Self::build_filter(filter),
                limit: limit as u64,
                with_payload: Some(WithPayloadSelector {
                    selector_options: Some(SelectorOptions::Enable(true)),
                }),
                params: None,
                score_threshold,
                offset: None,
                with_vectors: None,
                read_consistency: None,
                shard_key_selector: None,
                sparse_indices: None,
                timeout: None,
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(Self::hits_from_response(response.result))
    }

    async fn search_sparse(
        &self,
        sparse: &SparseVector,
        filter: &PointFilter,
        limit: usize,
    ) -> Result<Vec<ScoredHit>, StorageError> {
        let client = self.get_client().await?;
        let response = client
            .search_points(SearchPoints {
                collection_name: self.config.collection.clone(),
                vector: sparse.values.clone(),
                vector_name: Some(VECTOR_SPARSE.to_string()),
                filter: Self::build_filter(filter),
                limit: limit as u64,
                with_payload: Some(WithPayloadSelector {
                    selector_options: Some(SelectorOptions::Enable(true)),
                }),
                params: None,
                score_threshold: None,
                offset: None,
                with_vectors: None,
                read_consistency: None,
                shard_key_selector: None,
                sparse_indices: Some(SparseIndices {
                    data: sparse.indices.clone(),
                }),
                timeout: None,
            })
            .await
            .map_err(map_qdrant_error)?;
        Ok(Self::hits_from_response(response.result))
    }
}

// ---------------------------------------------------------------------------
// In-memory backend for tests
// ---------------------------------------------------------------------------

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// In-memory `VectorIndex` with real cosine and sparse dot-product scoring.
#[derive(Default)]
pub struct MemoryVectorIndex {
    points: Mutex<HashMap<Uuid, VectorRecord>>,
    connected: AtomicBool,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        let index = Self::default();
        index.connected.store(true, Ordering::SeqCst);
        index
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<VectorRecord> {
        self.points.lock().get(&id).cloned()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn connect(&self) -> Result<(), StorageError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ensure_collection(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), StorageError> {
        let mut points = self.points.lock();
        for record in records {
            points.insert(record.id, record);
        }
        Ok(())
    }

    async fn delete(&self, ids: Vec<Uuid>) -> Result<(), StorageError> {
        let mut points = self.points.lock();
        for id in ids {
            points.remove(&id);
        }
        Ok(())
    }

    async fn search_dense(
        &self,
        kind: VectorKind,
        vector: Vec<f32>,
        filter: &PointFilter,
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredHit>, StorageError> {
        let points = self.points.lock();
        let mut hits: Vec<ScoredHit> = points
            .values()
            .filter(|record| filter.matches(&record.payload))
            .filter_map(|record| {
                let stored = match kind {
                    VectorKind::TextDense => record.text_dense.as_ref()?,
                    VectorKind::CodeDense => record.code_dense.as_ref()?,
                };
                let score = cosine(stored, &vector);
                if let Some(threshold) = score_threshold {
                    if score < threshold {
                        return None;
                    }
                }
                Some(ScoredHit {
                    id: record.id,
                    score,
                    payload: record.payload.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn search_sparse(
        &self,
        sparse: &SparseVector,
        filter: &PointFilter,
        limit: usize,
    ) -> Result<Vec<ScoredHit>, StorageError> {
        let points = self.points.lock();
        let mut hits: Vec<ScoredHit> = points
            .values()
            .filter(|record| filter.matches(&record.payload))
            .filter_map(|record| {
                let stored = record.sparse.as_ref()?;
                let score = stored.dot(sparse);
                if score <= 0.0 {
                    return None;
                }
                Some(ScoredHit {
                    id: record.id,
                    score,
                    payload: record.payload.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u128, session: &str, kind: &str, dense: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: Uuid::from_u128(id),
            text_dense: Some(dense),
            code_dense: None,
            sparse: Some(SparseVector {
                indices: vec![1, 5],
                values: vec![0.5, 1.0],
            }),
            colbert: None,
            payload: PointPayload {
                content: "content".into(),
                node_id: Uuid::from_u128(id),
                session_id: session.into(),
                kind: kind.into(),
                timestamp: 1_000,
                file_path: None,
            },
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![record(1, "s", "thought", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert(vec![record(1, "s", "doc", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(Uuid::from_u128(1)).unwrap().payload.kind, "doc");
    }

    #[tokio::test]
    async fn dense_search_orders_by_cosine() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![
                record(1, "s", "thought", vec![1.0, 0.0]),
                record(2, "s", "thought", vec![0.6, 0.8]),
            ])
            .await
            .unwrap();
        let hits = index
            .search_dense(
                VectorKind::TextDense,
                vec![1.0, 0.0],
                &PointFilter::default(),
                10,
                None,
            )
            .await
            .unwrap();
        assert_eq!(hits[0].id, Uuid::from_u128(1));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn filters_restrict_hits() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![
                record(1, "a", "thought", vec![1.0, 0.0]),
                record(2, "b", "thought", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let filter = PointFilter {
            session_id: Some("a".into()),
            ..Default::default()
        };
        let hits = index
            .search_dense(VectorKind::TextDense, vec![1.0, 0.0], &filter, 10, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload.session_id, "a");
    }

    #[test]
    fn sparse_dot_product_aligns_indices() {
        let a = SparseVector {
            indices: vec![1, 3, 7],
            values: vec![1.0, 2.0, 3.0],
        };
        let b = SparseVector {
            indices: vec![3, 7, 9],
            values: vec![0.5, 1.0, 4.0],
        };
        assert_eq!(a.dot(&b), 2.0 * 0.5 + 3.0 * 1.0);
    }
}
