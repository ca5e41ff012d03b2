//! Engram runtime.
//!
//! The memory substrate for long-running agent sessions: ingestion of
//! provider event streams, turn reconstruction into a bitemporal graph,
//! hybrid vector indexing, reranked retrieval, and time-travel rehydration
//! of the working tree.

pub mod config;
pub mod embed;
pub mod index;
pub mod ingest;
pub mod memory;
pub mod parser;
pub mod rehydrate;
pub mod rerank;
pub mod retrieval;
pub mod retry;
pub mod storage;
pub mod types;

// Re-export the surface most callers need.
pub use config::RuntimeConfig;
pub use embed::{Embedder, EmbedderSet, HttpEmbedder, MockEmbedder};
pub use index::{Deduplicator, Indexer, SparseEncoder};
pub use ingest::{IncomingEvent, IngestOutcome, Ingestor};
pub use memory::MemoryAggregator;
pub use parser::ParserService;
pub use rehydrate::{CancelToken, Rehydrator, VirtualFileSystem};
pub use rerank::{RerankTier, TieredReranker};
pub use retrieval::{
    RetrievalEngine, RetrievalStrategy, ScoreBasedDetector, SearchQuery, SearchResponse,
    TwoStageRetriever,
};
pub use types::{EngramError, EventPayload, Provider, SessionId, TypedEvent};

use std::sync::Arc;
use std::time::Duration;

use crate::config::BlobBackend;
use crate::rerank::{CrossEncoder, HttpCrossEncoder, ModelLoader};
use crate::storage::{
    standard_streams, BlobStore, Database, FalkorGraph, FsBlobStore, GcsBlobStore,
    GraphRepository, MemoryBlobStore, MemoryBroker, MemoryGraph, MemoryPubSub, MemoryVectorIndex,
    MessageBroker, PubSub, QdrantVectorIndex, RedisPubSub, RedisStreamsBroker, VectorIndex,
    TOPIC_NODES_CREATED,
};
use crate::types::StorageError;

/// The assembled runtime: storage facades plus the pipeline services that
/// consume them. Components are process-scoped and passed as explicit
/// dependencies; nothing here is a global.
pub struct EngramRuntime {
    pub config: RuntimeConfig,
    pub broker: Arc<dyn MessageBroker>,
    pub graph: Arc<dyn GraphRepository>,
    pub blob: Arc<dyn BlobStore>,
    pub pubsub: Arc<dyn PubSub>,
    pub vector: Arc<dyn VectorIndex>,
    pub database: Option<Arc<Database>>,
    pub ingestor: Arc<Ingestor>,
    pub parser: Arc<ParserService>,
    pub aggregator: Arc<MemoryAggregator>,
    pub indexer: Arc<Indexer>,
    pub retrieval: Arc<RetrievalEngine>,
    pub session_retrieval: Arc<TwoStageRetriever>,
    pub rehydrator: Arc<Rehydrator>,
    reranker: Arc<TieredReranker>,
}

impl EngramRuntime {
    /// Connect every production backend named in the configuration.
    pub async fn connect(config: RuntimeConfig) -> Result<Self, EngramError> {
        let broker: Arc<dyn MessageBroker> = Arc::new(RedisStreamsBroker::new(
            config.broker.redis_url.clone(),
            config.broker.partitions,
        ));
        broker.connect().await.map_err(EngramError::Storage)?;

        let graph: Arc<dyn GraphRepository> = Arc::new(FalkorGraph::new(
            config.graph.url.clone(),
            config.graph.graph_name.clone(),
        ));
        graph.connect().await.map_err(EngramError::Storage)?;

        let blob: Arc<dyn BlobStore> = match &config.blob.backend {
            BlobBackend::Filesystem { base_path } => Arc::new(FsBlobStore::new(base_path)),
            BlobBackend::Gcs {
                bucket,
                access_token,
            } => Arc::new(GcsBlobStore::new(bucket.clone(), access_token.clone())),
            BlobBackend::Memory => Arc::new(MemoryBlobStore::new()),
        };

        let pubsub: Arc<dyn PubSub> = Arc::new(
            RedisPubSub::new(config.broker.redis_url.clone())
                .await
                .map_err(EngramError::Storage)?,
        );
        pubsub.connect().await.map_err(EngramError::Storage)?;

        let vector: Arc<dyn VectorIndex> =
            Arc::new(QdrantVectorIndex::new(config.vector.clone()));
        vector.connect().await.map_err(EngramError::Storage)?;

        let database = match &config.database.url {
            Some(url) => Some(Arc::new(
                Database::connect(url, config.database.max_connections)
                    .await
                    .map_err(EngramError::Storage)?,
            )),
            None => None,
        };

        let embedders = EmbedderSet {
            text: Arc::new(
                HttpEmbedder::new(
                    &config.embedding,
                    &config.embedding.text_model,
                    config.vector.text_dimension,
                )
                .map_err(EngramError::Embed)?,
            ),
            code: Arc::new(
                HttpEmbedder::new(
                    &config.embedding,
                    &config.embedding.code_model,
                    config.vector.code_dimension,
                )
                .map_err(EngramError::Embed)?,
            ),
            colbert: None,
        };

        let rerank_base = config.embedding.base_url.clone();
        let rerank_key = config.embedding.api_key.clone();
        let loader: ModelLoader = Arc::new(move |model, _quantization| {
            let base = rerank_base.clone();
            let key = rerank_key.clone();
            let model = model.to_string();
            Box::pin(async move {
                Ok(Arc::new(HttpCrossEncoder::new(
                    base,
                    key,
                    model,
                    Duration::from_secs(10),
                )?) as Arc<dyn CrossEncoder>)
            })
        });
        let reranker = Arc::new(TieredReranker::new(config.rerank.clone(), loader, None));

        Ok(Self::assemble(
            config, broker, graph, blob, pubsub, vector, database, embedders, reranker,
        ))
    }

    /// Fully in-memory runtime: every backend is the test fake and the
    /// embedders are deterministic mocks. Used by tests and local
    /// development without external services.
    pub async fn in_memory(config: RuntimeConfig) -> Result<Self, EngramError> {
        let broker: Arc<dyn MessageBroker> =
            Arc::new(MemoryBroker::new(config.broker.partitions));
        broker.connect().await.map_err(EngramError::Storage)?;
        let graph: Arc<dyn GraphRepository> = Arc::new(MemoryGraph::new());
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let vector: Arc<dyn VectorIndex> = Arc::new(MemoryVectorIndex::new());
        let embedders = EmbedderSet::mock(
            config.vector.text_dimension.min(128),
            config.vector.code_dimension.min(128),
        );
        let reranker = Arc::new(TieredReranker::mock(config.rerank.clone()));
        Ok(Self::assemble(
            config, broker, graph, blob, pubsub, vector, None, embedders, reranker,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: RuntimeConfig,
        broker: Arc<dyn MessageBroker>,
        graph: Arc<dyn GraphRepository>,
        blob: Arc<dyn BlobStore>,
        pubsub: Arc<dyn PubSub>,
        vector: Arc<dyn VectorIndex>,
        database: Option<Arc<Database>>,
        embedders: EmbedderSet,
        reranker: Arc<TieredReranker>,
    ) -> Self {
        let ingestor = Arc::new(Ingestor::new(Arc::clone(&broker)));
        let parser = Arc::new(ParserService::new(&config.parser, Arc::clone(&broker)));

        let dedup = config.aggregator.dedup_enabled.then(|| {
            Arc::new(Deduplicator::new(
                Arc::clone(&vector),
                embedders.clone(),
                config.aggregator.dedup_threshold,
            ))
        });
        let aggregator = Arc::new(MemoryAggregator::new(
            config.aggregator.clone(),
            Arc::clone(&graph),
            Arc::clone(&blob),
            Arc::clone(&broker),
            Arc::clone(&pubsub),
            dedup,
        ));
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&vector),
            Arc::clone(&blob),
            embedders.clone(),
        ));
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::clone(&vector),
            embedders,
            Some(Arc::clone(&reranker)),
            Arc::new(ScoreBasedDetector::new(retrieval::ScoreThresholds {
                min_retrieval_score: config.retrieval.min_retrieval_score,
                gap_detection_threshold: config.retrieval.gap_detection_threshold,
                min_score_gap: config.retrieval.min_score_gap,
            })),
            config.retrieval.clone(),
        ));
        let session_retrieval = Arc::new(TwoStageRetriever::new(
            Arc::clone(&retrieval),
            config.retrieval.clone(),
        ));
        let rehydrator = Arc::new(Rehydrator::new(Arc::clone(&graph), Arc::clone(&blob)));

        Self {
            config,
            broker,
            graph,
            blob,
            pubsub,
            vector,
            database,
            ingestor,
            parser,
            aggregator,
            indexer,
            retrieval,
            session_retrieval,
            rehydrator,
            reranker,
        }
    }

    /// Provision streams and the vector collection, then start the pipeline
    /// consumers. Returns the task handles so the host can join or abort.
    pub async fn start(&self) -> Result<Vec<tokio::task::JoinHandle<()>>, EngramError> {
        self.broker
            .ensure_streams(&standard_streams())
            .await
            .map_err(EngramError::Storage)?;
        self.vector
            .ensure_collection()
            .await
            .map_err(EngramError::Storage)?;

        let mut handles = Vec::new();

        let parser = Arc::clone(&self.parser);
        handles.push(tokio::spawn(async move {
            if let Err(e) = parser.run().await {
                tracing::error!(error = %e, "Parser loop exited");
            }
        }));

        let aggregator = Arc::clone(&self.aggregator);
        handles.push(tokio::spawn(async move {
            if let Err(e) = aggregator.run().await {
                tracing::error!(error = %e, "Aggregator loop exited");
            }
        }));

        let indexer = Arc::clone(&self.indexer);
        let subscription = self
            .broker
            .subscribe(TOPIC_NODES_CREATED, "indexer")
            .await
            .map_err(EngramError::Storage)?;
        handles.push(tokio::spawn(async move {
            indexer.run(subscription).await;
        }));

        // Idle reranker models unload on a timer.
        let cache = Arc::clone(self.reranker.cache());
        let idle = self.config.rerank.model_idle_timeout;
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(idle.max(Duration::from_secs(30)));
            loop {
                tick.tick().await;
                cache.evict_idle();
            }
        }));

        tracing::info!("Engram runtime started");
        Ok(handles)
    }

    /// Wait until the pipeline consumer groups are STABLE.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), StorageError> {
        self.broker
            .wait_for_groups_ready(storage::TOPIC_EVENTS_RAW, &["parser"], 1, timeout)
            .await?;
        self.broker
            .wait_for_groups_ready(storage::TOPIC_EVENTS_PARSED, &["aggregator"], 1, timeout)
            .await?;
        self.broker
            .wait_for_groups_ready(TOPIC_NODES_CREATED, &["indexer"], 1, timeout)
            .await
    }

    /// Shut down in reverse dependency order. Idempotent.
    pub async fn shutdown(&self) -> Result<(), EngramError> {
        tracing::info!("Engram runtime shutting down");
        if let Some(database) = &self.database {
            database.disconnect().await;
        }
        self.vector.disconnect().await.map_err(EngramError::Storage)?;
        self.pubsub.disconnect().await.map_err(EngramError::Storage)?;
        self.graph.disconnect().await.map_err(EngramError::Storage)?;
        self.broker.disconnect().await.map_err(EngramError::Storage)?;
        tracing::info!("Engram runtime shutdown complete");
        Ok(())
    }
}
