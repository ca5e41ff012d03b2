//! Runtime configuration.
//!
//! Environment-first with an optional TOML file override, mirroring the
//! deployment surface: `REDIS_URL` (streams, pub/sub), `FALKORDB_URL`
//! (graph), `BLOB_STORAGE_PATH` or `GCS_BUCKET` (blob), `DATABASE_URL`
//! (relational), plus the embedding/vector endpoints. `NATS_URL` and
//! `REDPANDA_BROKERS` are recognized and recorded so alternate broker
//! backends can be wired without config changes.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::types::ConfigError;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub broker: BrokerConfig,
    pub graph: GraphConfig,
    pub blob: BlobConfig,
    pub vector: VectorConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub parser: ParserConfig,
    pub aggregator: AggregatorConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
}

impl RuntimeConfig {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = non_empty_var("REDIS_URL") {
            config.broker.redis_url = url.clone();
            config.graph.redis_fallback_url = Some(url);
        }
        config.broker.nats_url = non_empty_var("NATS_URL");
        config.broker.redpanda_brokers = non_empty_var("REDPANDA_BROKERS");

        if let Some(url) = non_empty_var("FALKORDB_URL") {
            config.graph.url = url;
        }

        if let Some(path) = non_empty_var("BLOB_STORAGE_PATH") {
            config.blob.backend = BlobBackend::Filesystem { base_path: path };
        } else if let Some(bucket) = non_empty_var("GCS_BUCKET") {
            config.blob.backend = BlobBackend::Gcs {
                bucket,
                access_token: non_empty_var("GCS_ACCESS_TOKEN"),
            };
        }

        config.database.url = non_empty_var("DATABASE_URL");

        if let Some(url) = non_empty_var("QDRANT_URL") {
            config.vector.url = url;
        }
        config.vector.api_key = non_empty_var("QDRANT_API_KEY");
        if let Some(flag) = non_empty_var("VECTOR_SCHEMA_MIGRATE") {
            config.vector.recreate_on_mismatch = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        if let Some(url) = non_empty_var("EMBEDDING_API_BASE_URL") {
            config.embedding.base_url = url;
        }
        config.embedding.api_key = non_empty_var("EMBEDDING_API_KEY");

        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and overlay it on the environment-derived config.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.partitions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "broker.partitions".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.retrieval.rrf_k == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retrieval.rrf_k".into(),
                reason: "must be positive".into(),
            });
        }
        if self.rerank.max_batch_size == 0 || self.rerank.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rerank.max_batch_size".into(),
                reason: "batch size and concurrency must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Message broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Redis Streams backend URL.
    pub redis_url: String,
    /// Partitions per topic; session ids hash onto these.
    pub partitions: u32,
    /// Recognized for alternate backends; unused by the Redis backend.
    pub nats_url: Option<String>,
    pub redpanda_brokers: Option<String>,
    /// Consumer-group readiness poll interval.
    #[serde(with = "humantime_serde")]
    pub readiness_poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".into(),
            partitions: 8,
            nats_url: None,
            redpanda_brokers: None,
            readiness_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Graph store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// FalkorDB endpoint (RESP protocol).
    pub url: String,
    /// Logical graph name; one per deployment.
    pub graph_name: String,
    /// Used when `FALKORDB_URL` is unset but `REDIS_URL` is.
    pub redis_fallback_url: Option<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6380".into(),
            graph_name: "engram".into(),
            redis_fallback_url: None,
        }
    }
}

/// Blob storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobBackend {
    Filesystem {
        base_path: String,
    },
    Gcs {
        bucket: String,
        access_token: Option<String>,
    },
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    pub backend: BlobBackend,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: BlobBackend::Filesystem {
                base_path: "./data/blobs".into(),
            },
        }
    }
}

/// Vector store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub text_dimension: usize,
    pub code_dimension: usize,
    /// Per-token dimension for the optional late-interaction field.
    pub colbert_dimension: Option<usize>,
    /// Destructive schema recreate is only permitted when this is set.
    pub recreate_on_mismatch: bool,
    pub timeout_seconds: u64,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".into(),
            api_key: None,
            collection: "engram_memory".into(),
            text_dimension: 384,
            code_dimension: 768,
            colbert_dimension: None,
            recreate_on_mismatch: false,
            timeout_seconds: 30,
        }
    }
}

/// Relational store configuration (auth/client registry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
        }
    }
}

/// Embedding service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub text_model: String,
    pub code_model: String,
    pub timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            api_key: None,
            text_model: "intfloat/e5-small-v2".into(),
            code_model: "jinaai/jina-embeddings-v2-base-code".into(),
            timeout_seconds: 30,
        }
    }
}

/// Parser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Idle TTL for streaming reassembly buffers.
    #[serde(with = "humantime_serde")]
    pub buffer_ttl: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            buffer_ttl: Duration::from_secs(600),
        }
    }
}

/// Memory aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Payloads larger than this many bytes are externalized to blob storage.
    pub inline_payload_max: usize,
    /// Turns idle longer than this are closed.
    #[serde(with = "humantime_serde")]
    pub idle_close_after: Duration,
    /// Dense-similarity threshold for thought deduplication.
    pub dedup_threshold: f32,
    pub dedup_enabled: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            inline_payload_max: 16 * 1024,
            idle_close_after: Duration::from_secs(30 * 60),
            dedup_threshold: 0.95,
            dedup_enabled: false,
        }
    }
}

/// Retrieval engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub rerank_depth: usize,
    pub rrf_k: u32,
    /// Optional similarity floor applied to single-vector searches only.
    pub score_threshold: Option<f32>,
    pub min_retrieval_score: f32,
    pub gap_detection_threshold: f32,
    pub min_score_gap: f32,
    #[serde(with = "humantime_serde")]
    pub rerank_timeout: Duration,
    pub rerank_enabled: bool,
    /// Two-stage session retrieval.
    pub top_sessions: usize,
    pub turns_per_session: usize,
    pub sessions_in_parallel: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            rerank_depth: 30,
            rrf_k: 60,
            score_threshold: None,
            min_retrieval_score: 0.3,
            gap_detection_threshold: 0.5,
            min_score_gap: 0.1,
            rerank_timeout: Duration::from_millis(500),
            rerank_enabled: true,
            top_sessions: 5,
            turns_per_session: 3,
            sessions_in_parallel: true,
        }
    }
}

/// Tiered reranker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    /// Queries longer than this many words route to the accurate tier.
    pub accurate_query_words: usize,
    #[serde(with = "humantime_serde")]
    pub model_idle_timeout: Duration,
    /// Sliding-window limiter for the LLM-listwise tier.
    pub llm_requests_per_window: u32,
    #[serde(with = "humantime_serde")]
    pub llm_window: Duration,
    /// Hard budget in cents.
    pub llm_budget_cents: u64,
    pub llm_cost_per_request_cents: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            max_concurrency: 4,
            accurate_query_words: 24,
            model_idle_timeout: Duration::from_secs(300),
            llm_requests_per_window: 100,
            llm_window: Duration::from_secs(3600),
            llm_budget_cents: 1000,
            llm_cost_per_request_cents: 2,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
