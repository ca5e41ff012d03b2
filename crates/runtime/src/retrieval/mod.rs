//! Hybrid retrieval: classification, fusion, reranking, abstention, and
//! session-aware two-stage search.

pub mod abstention;
pub mod classifier;
pub mod engine;
pub mod fusion;
pub mod session;
pub mod types;

pub use abstention::{AbstentionDetector, ScoreBasedDetector, ScoreThresholds};
pub use classifier::{classify, Classification};
pub use engine::RetrievalEngine;
pub use fusion::{rrf_fuse, FusedHit, DEFAULT_RRF_K};
pub use session::{SessionScopedResult, TwoStageRetriever};
pub use types::{
    AbstentionReason, AbstentionVerdict, RetrievalStrategy, SearchFilters, SearchQuery,
    SearchResponse, SearchResult, TimeRange,
};
