//! Storage facades: broker, graph, blob, pub/sub, relational, and vector.
//!
//! Every facade shares the same lifecycle contract (`connect`, `disconnect`,
//! `is_connected`, all idempotent) and is defined as a small capability
//! trait so tests can inject in-memory fakes.

pub mod blob;
pub mod broker;
pub mod broker_memory;
pub mod broker_redis;
pub mod graph;
pub mod graph_falkor;
pub mod graph_memory;
pub mod pubsub;
pub mod relational;
pub mod vector;

pub use blob::{BlobStore, FsBlobStore, GcsBlobStore, MemoryBlobStore};
pub use broker::{
    partition_for, standard_streams, BrokerRecord, Delivery, MessageBroker, Retention, StreamSpec,
    Subscription, DLQ_INGESTION, DLQ_MEMORY, TOPIC_EVENTS_PARSED, TOPIC_EVENTS_RAW,
    TOPIC_NODES_CREATED, TOPIC_TURNS_FINALIZED,
};
pub use broker_memory::MemoryBroker;
pub use broker_redis::RedisStreamsBroker;
pub use graph::{GraphRepository, UpsertOutcome};
pub use graph_falkor::{FalkorGraph, GraphClient};
pub use graph_memory::MemoryGraph;
pub use pubsub::{MemoryPubSub, PubSub, RedisPubSub, Subscription as PubSubSubscription};
pub use relational::Database;
pub use vector::{
    MemoryVectorIndex, PointFilter, QdrantVectorIndex, ScoredHit, SparseVector, VectorIndex,
    VectorKind, VectorRecord,
};
