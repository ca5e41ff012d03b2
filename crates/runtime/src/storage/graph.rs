//! Typed repository over the bitemporal memory graph.
//!
//! The aggregator and rehydrator consume this trait rather than raw Cypher,
//! so tests inject `MemoryGraph` while deployments use `FalkorGraph`. All
//! write operations are idempotent on node id: re-applying the same record
//! is a no-op, and a changed record closes the open version and appends a
//! new one (corrections never overwrite).

use async_trait::async_trait;

use crate::types::{
    DiffHunkRecord, NodeId, PayloadRef, ReasoningRecord, SessionId, SessionRecord, SnapshotRecord,
    StorageError, ToolCallRecord, ToolCallStatus, TurnRecord,
};

/// What an idempotent upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First version of this node.
    Created,
    /// An open version with identical properties already existed.
    Unchanged,
    /// The open version was closed and a new version appended.
    Corrected,
}

#[async_trait]
pub trait GraphRepository: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError>;
    async fn disconnect(&self) -> Result<(), StorageError>;
    fn is_connected(&self) -> bool;

    async fn upsert_session(
        &self,
        record: &SessionRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError>;

    async fn upsert_turn(&self, record: &TurnRecord, at: i64)
        -> Result<UpsertOutcome, StorageError>;

    async fn append_reasoning(
        &self,
        record: &ReasoningRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError>;

    async fn upsert_tool_call(
        &self,
        record: &ToolCallRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError>;

    /// Record the matching result for a pending tool call. Returns the node
    /// id of the updated call, or `None` when no call with `call_id` exists
    /// in the session.
    async fn complete_tool_call(
        &self,
        session_id: SessionId,
        call_id: &str,
        result: PayloadRef,
        status: ToolCallStatus,
        at: i64,
    ) -> Result<Option<NodeId>, StorageError>;

    async fn append_diff(
        &self,
        record: &DiffHunkRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError>;

    async fn record_snapshot(
        &self,
        record: &SnapshotRecord,
        at: i64,
    ) -> Result<(), StorageError>;

    async fn session(&self, id: SessionId) -> Result<Option<SessionRecord>, StorageError>;

    /// Highest turn ordinal recorded for the session, if any.
    async fn max_turn_ordinal(&self, session_id: SessionId) -> Result<Option<u32>, StorageError>;

    async fn turns_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<TurnRecord>, StorageError>;

    /// Latest snapshot with `vt <= at`.
    async fn latest_snapshot_at(
        &self,
        session_id: SessionId,
        at: i64,
    ) -> Result<Option<SnapshotRecord>, StorageError>;

    /// Diffs with `after < vt_start <= until`, ordered by `vt_start`
    /// ascending with node-id lexicographic tiebreak.
    async fn diffs_between(
        &self,
        session_id: SessionId,
        after: i64,
        until: i64,
    ) -> Result<Vec<DiffHunkRecord>, StorageError>;

    /// Number of versions of `id` whose transaction interval is open.
    /// At most one by construction; exposed so tests can assert it.
    async fn open_version_count(&self, id: NodeId) -> Result<usize, StorageError>;
}

/// Sort diffs into their total order: `vt_start` ascending, node id
/// lexicographic on ties.
pub fn sort_diffs(diffs: &mut [DiffHunkRecord]) {
    diffs.sort_by(|a, b| {
        a.vt_start
            .cmp(&b.vt_start)
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });
}
