//! Error types for the memory runtime.
//!
//! Errors fall into five classes: validation (rejected at the boundary,
//! never retried), transient I/O (retried with capped back-off), permanent
//! I/O (dead-lettered), logical inconsistency (fail fast), and budget or
//! rate-limit rejections (structured reason plus reset time).

use thiserror::Error;

use super::{EventId, SessionId};

/// Top-level runtime error composing the per-subsystem taxonomies.
#[derive(Error, Debug)]
pub enum EngramError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Aggregation error: {0}")]
    Aggregate(#[from] AggregateError),

    #[error("Indexing error: {0}")]
    Index(#[from] IndexError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Rerank error: {0}")]
    Rerank(#[from] RerankError),

    #[error("Rehydration error: {0}")]
    Rehydration(#[from] RehydrationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Embedding error: {0}")]
    Embed(#[from] EmbedError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration errors.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config file: {0}")]
    Parse(String),
}

/// Storage facade errors, shared by broker, graph, blob, pub/sub, relational,
/// and vector backends.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Path violation: {0}")]
    PathViolation(String),

    #[error("Schema mismatch for {name}: {reason}")]
    SchemaMismatch { name: String, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Storage is shutting down")]
    ShuttingDown,
}

impl StorageError {
    /// Whether the pipeline may retry the operation with back-off.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::Backend(_) | Self::NotConnected
        )
    }
}

/// Ingestion boundary errors.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Validation failed [{code}]: {reason}")]
    Validation { code: &'static str, reason: String },

    #[error("Publish failed after {attempts} attempts: {source}")]
    PublishFailed {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("Dead-letter publish failed: {0}")]
    DeadLetterFailed(#[source] StorageError),
}

/// Parser errors.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unknown provider for event {event_id}")]
    UnknownProvider { event_id: EventId },

    #[error("Malformed payload for event {event_id}: {reason}")]
    MalformedPayload { event_id: EventId, reason: String },

    #[error("Invalid session id in headers: {0}")]
    InvalidSessionId(String),
}

/// Memory aggregator errors.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Invalid event for session {session_id}: {reason}")]
    InvalidEvent {
        session_id: SessionId,
        reason: String,
    },

    #[error("Graph write failed: {0}")]
    Graph(#[source] StorageError),

    #[error("Blob write failed: {0}")]
    Blob(#[source] StorageError),

    #[error("Notification publish failed: {0}")]
    Notify(#[source] StorageError),
}

impl AggregateError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidEvent { .. } => false,
            Self::Graph(e) | Self::Blob(e) | Self::Notify(e) => e.is_transient(),
        }
    }
}

/// Indexer errors.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Embedding failed: {0}")]
    Embed(#[from] EmbedError),

    #[error("Vector upsert failed: {0}")]
    Vector(#[source] StorageError),

    #[error("Malformed notification: {0}")]
    MalformedNotification(String),
}

/// Embedding service errors.
#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("Embedding request failed: {0}")]
    RequestFailed(String),

    #[error("Embedding backend returned {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Malformed embedding response: {0}")]
    MalformedResponse(String),
}

/// Retrieval engine errors. Abstention is not an error; it is a normal
/// result.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Vector store error: {0}")]
    Vector(#[source] StorageError),

    #[error("Embedding error: {0}")]
    Embed(#[from] EmbedError),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Budget and quota rejections surface to the caller; other reranker
    /// failures fall back to the fused ranking instead.
    #[error("Rerank rejected: {0}")]
    RerankRejected(#[source] RerankError),
}

/// Reranker errors.
#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Rate limit exceeded for {user_id}: {reason}")]
    RateLimited {
        user_id: String,
        reason: String,
        /// Epoch milliseconds at which the window rolls over.
        reset_at: i64,
    },

    #[error("Reranker timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Reranker circuit open for '{endpoint}'")]
    CircuitOpen { endpoint: String },

    #[error("Reranker backend error: {0}")]
    Backend(String),

    #[error("Malformed reranker response: {0}")]
    MalformedResponse(String),
}

/// Rehydration errors.
#[derive(Error, Debug)]
pub enum RehydrationError {
    #[error("Snapshot {uri} unreadable: {reason}")]
    SnapshotUnreadable { uri: String, reason: String },

    #[error("All {failed} diffs failed to apply")]
    AllDiffsFailed { failed: usize },

    #[error("Rehydration cancelled")]
    Cancelled,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Graph error: {0}")]
    Graph(#[source] StorageError),

    #[error("Blob error: {0}")]
    Blob(#[source] StorageError),
}

/// Patch application errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Invalid hunk: {0}")]
    InvalidHunk(String),

    #[error("Search block not found in {path}")]
    SearchNotFound { path: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unsupported patch format")]
    UnsupportedFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StorageError::Timeout("x".into()).is_transient());
        assert!(StorageError::ConnectionFailed("x".into()).is_transient());
        assert!(!StorageError::Serialization("x".into()).is_transient());
        assert!(!StorageError::PathViolation("x".into()).is_transient());
    }

    #[test]
    fn rate_limit_message_names_the_reason() {
        let err = RerankError::RateLimited {
            user_id: "u1".into(),
            reason: "Rate limit exceeded: 100 requests per hour".into(),
            reset_at: 1_700_000_000_000,
        };
        assert!(err.to_string().contains("Rate limit exceeded"));
    }
}
