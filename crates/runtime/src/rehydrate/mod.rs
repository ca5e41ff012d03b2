//! Time-travel rehydration.
//!
//! Reconstructs the virtual file system of a session at any wall-clock
//! instant: load the latest snapshot at or before the target time, then
//! apply the ordered diff chain up to it. Individual diff failures are
//! tolerated; the call fails only when every diff failed. Cancellation is
//! honored between diffs.

pub mod patch;
pub mod vfs;

pub use patch::{apply_patch, detect, FileLocks, PatchKind};
pub use vfs::{VfsNode, VirtualFileSystem};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::storage::{BlobStore, GraphRepository};
use crate::types::{
    now_ms, DiffHunkRecord, NodeId, PayloadRef, RehydrationError, SessionId, SnapshotRecord,
};

/// Cooperative cancellation handle checked between diffs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome details alongside the reconstructed VFS.
#[derive(Debug, Clone, Default)]
pub struct RehydrationReport {
    pub snapshot_vt: Option<i64>,
    pub diffs_applied: usize,
    pub diffs_failed: usize,
    pub diffs_skipped: usize,
}

pub struct Rehydrator {
    graph: Arc<dyn GraphRepository>,
    blob: Arc<dyn BlobStore>,
    locks: FileLocks,
}

impl Rehydrator {
    pub fn new(graph: Arc<dyn GraphRepository>, blob: Arc<dyn BlobStore>) -> Self {
        Self {
            graph,
            blob,
            locks: FileLocks::new(),
        }
    }

    async fn load_snapshot(
        &self,
        snapshot: &SnapshotRecord,
    ) -> Result<VirtualFileSystem, RehydrationError> {
        let bytes = self
            .blob
            .load(&snapshot.blob_uri)
            .await
            .map_err(RehydrationError::Blob)?;
        VirtualFileSystem::from_snapshot_bytes(&bytes, &snapshot.blob_uri)
    }

    async fn patch_text(&self, diff: &DiffHunkRecord) -> Result<Option<String>, RehydrationError> {
        match &diff.patch {
            None => Ok(None),
            Some(PayloadRef::Inline(text)) => Ok(Some(text.clone())),
            Some(PayloadRef::Blob(uri)) => {
                let bytes = self.blob.load(uri).await.map_err(RehydrationError::Blob)?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
        }
    }

    /// `rehydrate(session, target_time) -> VFS`.
    pub async fn rehydrate(
        &self,
        session_id: SessionId,
        target_time: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<(VirtualFileSystem, RehydrationReport), RehydrationError> {
        let target = target_time.unwrap_or_else(now_ms);
        let mut report = RehydrationReport::default();

        let snapshot = self
            .graph
            .latest_snapshot_at(session_id, target)
            .await
            .map_err(RehydrationError::Graph)?;
        let (mut vfs, after) = match &snapshot {
            Some(snapshot) => {
                report.snapshot_vt = Some(snapshot.vt);
                (self.load_snapshot(snapshot).await?, snapshot.vt)
            }
            None => (VirtualFileSystem::new(), i64::MIN),
        };

        let diffs = self
            .graph
            .diffs_between(session_id, after, target)
            .await
            .map_err(RehydrationError::Graph)?;

        for diff in &diffs {
            if cancel.is_cancelled() {
                return Err(RehydrationError::Cancelled);
            }
            let Some(file_path) = diff.file_path.as_deref() else {
                report.diffs_skipped += 1;
                continue;
            };
            let patch = match self.patch_text(diff).await {
                Ok(Some(patch)) => patch,
                Ok(None) => {
                    report.diffs_skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.diffs_failed += 1;
                    tracing::warn!(diff_id = %diff.id, error = %e, "Diff payload unavailable");
                    continue;
                }
            };

            let _guard = self.locks.lock(file_path).await;
            match apply_patch(&mut vfs, file_path, &patch, diff.vt_start) {
                Ok(()) => report.diffs_applied += 1,
                Err(e) => {
                    report.diffs_failed += 1;
                    tracing::warn!(
                        diff_id = %diff.id,
                        file_path,
                        error = %e,
                        "Diff failed to apply during rehydration"
                    );
                }
            }
        }

        if report.diffs_applied == 0 && report.diffs_failed > 0 {
            return Err(RehydrationError::AllDiffsFailed {
                failed: report.diffs_failed,
            });
        }
        Ok((vfs, report))
    }

    /// Persist a snapshot of the VFS and record it in the graph.
    pub async fn snapshot(
        &self,
        session_id: SessionId,
        vfs: &VirtualFileSystem,
        vt: i64,
    ) -> Result<SnapshotRecord, RehydrationError> {
        let bytes = vfs.to_snapshot_bytes()?;
        let blob_uri = self
            .blob
            .save(&bytes)
            .await
            .map_err(RehydrationError::Blob)?;
        let record = SnapshotRecord {
            id: NodeId::new(),
            session_id,
            blob_uri,
            vt,
        };
        self.graph
            .record_snapshot(&record, vt)
            .await
            .map_err(RehydrationError::Graph)?;
        Ok(record)
    }
}
