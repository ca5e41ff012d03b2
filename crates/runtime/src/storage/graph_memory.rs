//! In-memory graph repository with full bitemporal semantics.
//!
//! Backs tests and single-process development. Version chains live in plain
//! vectors guarded by a mutex; the open version is always the last entry
//! with an open transaction interval.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::graph::{sort_diffs, GraphRepository, UpsertOutcome};
use crate::types::{
    Bitemporal, DiffHunkRecord, NodeId, PayloadRef, ReasoningRecord, SessionId, SessionRecord,
    SnapshotRecord, StorageError, ToolCallRecord, ToolCallStatus, TurnRecord,
};

#[derive(Debug, Clone)]
struct Versioned<T> {
    data: T,
    validity: Bitemporal,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Vec<Versioned<SessionRecord>>>,
    turns: HashMap<NodeId, Vec<Versioned<TurnRecord>>>,
    reasonings: HashMap<NodeId, Vec<Versioned<ReasoningRecord>>>,
    tool_calls: HashMap<NodeId, Vec<Versioned<ToolCallRecord>>>,
    diffs: HashMap<NodeId, Vec<Versioned<DiffHunkRecord>>>,
    snapshots: HashMap<NodeId, Vec<Versioned<SnapshotRecord>>>,
}

fn upsert_versions<T: Clone + PartialEq>(
    versions: &mut Vec<Versioned<T>>,
    record: &T,
    at: i64,
) -> UpsertOutcome {
    if let Some(open) = versions.iter_mut().rev().find(|v| v.validity.is_open()) {
        if open.data == *record {
            return UpsertOutcome::Unchanged;
        }
        open.validity.close_tt(at);
        versions.push(Versioned {
            data: record.clone(),
            validity: Bitemporal::open_at(at),
        });
        return UpsertOutcome::Corrected;
    }
    versions.push(Versioned {
        data: record.clone(),
        validity: Bitemporal::open_at(at),
    });
    UpsertOutcome::Created
}

fn open_of<T: Clone>(versions: &[Versioned<T>]) -> Option<T> {
    versions
        .iter()
        .rev()
        .find(|v| v.validity.is_open())
        .map(|v| v.data.clone())
}

/// In-memory `GraphRepository` implementation.
#[derive(Default)]
pub struct MemoryGraph {
    tables: Mutex<Tables>,
    connected: AtomicBool,
}

impl MemoryGraph {
    pub fn new() -> Self {
        let graph = Self::default();
        graph.connected.store(true, Ordering::SeqCst);
        graph
    }
}

#[async_trait]
impl GraphRepository for MemoryGraph {
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

    async fn upsert_session(
        &self,
        record: &SessionRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut tables = self.tables.lock();
        let versions = tables.sessions.entry(record.id).or_default();
        Ok(upsert_versions(versions, record, at))
    }

    async fn upsert_turn(
        &self,
        record: &TurnRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut tables = self.tables.lock();
        let versions = tables.turns.entry(record.id).or_default();
        Ok(upsert_versions(versions, record, at))
    }

    async fn append_reasoning(
        &self,
        record: &ReasoningRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut tables = self.tables.lock();
        let versions = tables.reasonings.entry(record.id).or_default();
        Ok(upsert_versions(versions, record, at))
    }

    async fn upsert_tool_call(
        &self,
        record: &ToolCallRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut tables = self.tables.lock();
        let versions = tables.tool_calls.entry(record.id).or_default();
        Ok(upsert_versions(versions, record, at))
    }

    async fn complete_tool_call(
        &self,
        session_id: SessionId,
        call_id: &str,
        result: PayloadRef,
        status: ToolCallStatus,
        at: i64,
    ) -> Result<Option<NodeId>, StorageError> {
        let mut tables = self.tables.lock();
        let turn_ids: Vec<NodeId> = tables
            .turns
            .iter()
            .filter(|(_, versions)| {
                open_of(versions).map(|t| t.session_id == session_id).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut target = None;
        for versions in tables.tool_calls.values_mut() {
            let Some(open) = open_of(versions) else { continue };
            if open.call_id == call_id && turn_ids.contains(&open.turn_id) {
                let mut updated = open.clone();
                updated.result = Some(result.clone());
                updated.status = status;
                upsert_versions(versions, &updated, at);
                target = Some(updated.id);
                break;
            }
        }
        Ok(target)
    }

    async fn append_diff(
        &self,
        record: &DiffHunkRecord,
        at: i64,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut tables = self.tables.lock();
        let versions = tables.diffs.entry(record.id).or_default();
        Ok(upsert_versions(versions, record, at))
    }

    async fn record_snapshot(
        &self,
        record: &SnapshotRecord,
        at: i64,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let versions = tables.snapshots.entry(record.id).or_default();
        upsert_versions(versions, record, at);
        Ok(())
    }

    async fn session(&self, id: SessionId) -> Result<Option<SessionRecord>, StorageError> {
        let tables = self.tables.lock();
        Ok(tables.sessions.get(&id).and_then(|v| open_of(v)))
    }

    async fn max_turn_ordinal(&self, session_id: SessionId) -> Result<Option<u32>, StorageError> {
        let tables = self.tables.lock();
        Ok(tables
            .turns
            .values()
            .filter_map(|v| open_of(v))
            .filter(|t| t.session_id == session_id)
            .map(|t| t.ordinal)
            .max())
    }

    async fn turns_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<TurnRecord>, StorageError> {
        let tables = self.tables.lock();
        let mut turns: Vec<TurnRecord> = tables
            .turns
            .values()
            .filter_map(|v| open_of(v))
            .filter(|t| t.session_id == session_id)
            .collect();
        turns.sort_by_key(|t| t.ordinal);
        Ok(turns)
    }

    async fn latest_snapshot_at(
        &self,
        session_id: SessionId,
        at: i64,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        let tables = self.tables.lock();
        Ok(tables
            .snapshots
            .values()
            .filter_map(|v| open_of(v))
            .filter(|s| s.session_id == session_id && s.vt <= at)
            .max_by_key(|s| s.vt))
    }

    async fn diffs_between(
        &self,
        session_id: SessionId,
        after: i64,
        until: i64,
    ) -> Result<Vec<DiffHunkRecord>, StorageError> {
        let tables = self.tables.lock();
        let mut diffs: Vec<DiffHunkRecord> = tables
            .diffs
            .values()
            .filter_map(|v| open_of(v))
            .filter(|d| d.session_id == session_id && d.vt_start > after && d.vt_start <= until)
            .collect();
        sort_diffs(&mut diffs);
        Ok(diffs)
    }

    async fn open_version_count(&self, id: NodeId) -> Result<usize, StorageError> {
        let tables = self.tables.lock();
        let mut open = 0usize;
        if let Some(v) = tables.turns.get(&id) {
            open += v.iter().filter(|x| x.validity.is_open()).count();
        }
        if let Some(v) = tables.reasonings.get(&id) {
            open += v.iter().filter(|x| x.validity.is_open()).count();
        }
        if let Some(v) = tables.tool_calls.get(&id) {
            open += v.iter().filter(|x| x.validity.is_open()).count();
        }
        if let Some(v) = tables.diffs.get(&id) {
            open += v.iter().filter(|x| x.validity.is_open()).count();
        }
        if let Some(v) = tables.snapshots.get(&id) {
            open += v.iter().filter(|x| x.validity.is_open()).count();
        }
        if let Some(v) = tables.sessions.get(&SessionId(id.0)) {
            open += v.iter().filter(|x| x.validity.is_open()).count();
        }
        Ok(open)
    }
}
