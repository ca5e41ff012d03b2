//! Time-travel rehydration scenarios.

use std::sync::Arc;

use engram_runtime::rehydrate::{CancelToken, Rehydrator, VirtualFileSystem};
use engram_runtime::storage::{BlobStore, GraphRepository, MemoryBlobStore, MemoryGraph};
use engram_runtime::types::{DiffHunkRecord, NodeId, PayloadRef, SessionId};

async fn seed_diff(
    graph: &MemoryGraph,
    session: SessionId,
    id: u128,
    vt: i64,
    file_path: &str,
    patch: &str,
) {
    graph
        .append_diff(
            &DiffHunkRecord {
                id: NodeId(uuid::Uuid::from_u128(id)),
                turn_id: NodeId::new(),
                session_id: session,
                file_path: Some(file_path.to_string()),
                patch: Some(PayloadRef::Inline(patch.to_string())),
                vt_start: vt,
            },
            vt,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn valid_diff_applies_while_malformed_one_is_tolerated() {
    let graph = Arc::new(MemoryGraph::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let rehydrator = Rehydrator::new(
        Arc::clone(&graph) as Arc<dyn GraphRepository>,
        Arc::clone(&blob) as Arc<dyn BlobStore>,
    );
    let session = SessionId::new();

    // Snapshot at T=1000 with one file.
    let mut vfs = VirtualFileSystem::new();
    vfs.write_file("app.py", "def handler():\n    return legacy()", 900)
        .unwrap();
    rehydrator.snapshot(session, &vfs, 1_000).await.unwrap();

    // One valid and one malformed diff recorded between the snapshot and
    // the target time.
    seed_diff(
        &graph,
        session,
        1,
        1_200,
        "app.py",
        "@@ -1,2 +1,2 @@\n def handler():\n-    return legacy()\n+    return modern()",
    )
    .await;
    seed_diff(
        &graph,
        session,
        2,
        1_300,
        "app.py",
        "@@ -40,3 +40,3 @@\n nonsense far past the end",
    )
    .await;

    let (rebuilt, report) = rehydrator
        .rehydrate(session, Some(1_500), &CancelToken::new())
        .await
        .expect("call succeeds despite the malformed diff");

    assert_eq!(report.diffs_applied, 1);
    assert_eq!(report.diffs_failed, 1);
    assert_eq!(
        rebuilt.read_file("app.py"),
        Some("def handler():\n    return modern()")
    );
}

#[tokio::test]
async fn rehydration_state_is_a_function_of_the_diff_sequence() {
    let graph = Arc::new(MemoryGraph::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let rehydrator = Rehydrator::new(
        Arc::clone(&graph) as Arc<dyn GraphRepository>,
        Arc::clone(&blob) as Arc<dyn BlobStore>,
    );
    let session = SessionId::new();

    seed_diff(&graph, session, 1, 1_000, "log.txt", "@@ -0,0 +1,1 @@\n+first").await;
    seed_diff(
        &graph,
        session,
        2,
        2_000,
        "log.txt",
        "<<<<<<< SEARCH\nfirst\n=======\nfirst\nsecond\n>>>>>>> REPLACE\n",
    )
    .await;

    // Rehydrating twice at the same instant yields identical state.
    let (a, _) = rehydrator
        .rehydrate(session, Some(3_000), &CancelToken::new())
        .await
        .unwrap();
    let (b, _) = rehydrator
        .rehydrate(session, Some(3_000), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.read_file("log.txt"), Some("first\nsecond"));

    // An earlier instant sees only the prefix of the chain.
    let (earlier, _) = rehydrator
        .rehydrate(session, Some(1_500), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(earlier.read_file("log.txt"), Some("first"));
}

#[tokio::test]
async fn snapshot_round_trip_through_blob_storage() {
    let graph = Arc::new(MemoryGraph::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let rehydrator = Rehydrator::new(
        Arc::clone(&graph) as Arc<dyn GraphRepository>,
        Arc::clone(&blob) as Arc<dyn BlobStore>,
    );
    let session = SessionId::new();

    let mut vfs = VirtualFileSystem::new();
    vfs.write_file("src/main.rs", "fn main() {}", 100).unwrap();
    vfs.write_file("docs/notes.md", "# notes", 200).unwrap();
    vfs.make_dir("empty/dir").unwrap();

    let record = rehydrator.snapshot(session, &vfs, 5_000).await.unwrap();

    // Saving identical content again is idempotent at the blob layer.
    let bytes = vfs.to_snapshot_bytes().unwrap();
    let second_uri = blob.save(&bytes).await.unwrap();
    assert_eq!(second_uri, record.blob_uri);

    let (restored, report) = rehydrator
        .rehydrate(session, Some(6_000), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.snapshot_vt, Some(5_000));
    assert_eq!(restored, vfs);
    assert_eq!(
        restored.list_files(),
        vec!["docs/notes.md".to_string(), "src/main.rs".to_string()]
    );
}

#[tokio::test]
async fn rehydrating_an_unknown_session_yields_an_empty_tree() {
    let graph = Arc::new(MemoryGraph::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let rehydrator = Rehydrator::new(
        graph as Arc<dyn GraphRepository>,
        blob as Arc<dyn BlobStore>,
    );
    let (vfs, report) = rehydrator
        .rehydrate(SessionId::new(), None, &CancelToken::new())
        .await
        .unwrap();
    assert!(vfs.list_files().is_empty());
    assert_eq!(report.diffs_applied, 0);
    assert!(report.snapshot_vt.is_none());
}
