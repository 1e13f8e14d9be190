//! End-to-end background sync tests.
//!
//! Reconciliation passes over the in-memory store and index, with repairs
//! flowing back through the update pipeline.

use std::sync::Arc;
use std::time::Duration;

use e2e_tests::{key, FlakySource, TestHarness};
use index_sync_reconcile::{
    BackgroundSync, BackgroundSyncHandle, BookmarkStore, HealthLevel, InMemoryBookmarkStore,
    JsonFileBookmarkStore, SyncState,
};
use index_sync_types::UpdateReason;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn wait_for_passes(handle: &BackgroundSyncHandle, passes: u64) {
    for _ in 0..100 {
        let status = handle.status().await.unwrap();
        if status.passes_completed >= passes && status.state == SyncState::Sleeping {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("background sync did not complete {passes} passes");
}

#[tokio::test(start_paused = true)]
async fn test_pass_reports_missing_and_stale_entities() {
    let harness = TestHarness::new();

    // store: k1 r1, k2 r1, k3 r1; index: k1 r1, k3 r2
    for name in ["k1", "k2", "k3"] {
        harness.store.put(name, 1, json!({"title": name}));
    }
    harness.index.seed("k1", 1, None, json!({"title": "k1"}));
    harness.index.seed("k3", 2, None, json!({"title": "k3"}));

    let bookmarks = Arc::new(InMemoryBookmarkStore::new());
    let shutdown = CancellationToken::new();
    let (handle, task) = BackgroundSync::spawn(
        TestHarness::sync_settings(),
        harness.sync_collaborators(bookmarks.clone()),
        shutdown.clone(),
    );

    handle.start().await.unwrap();
    wait_for_passes(&handle, 1).await;

    assert_eq!(harness.repairs.keys(), vec!["ns:k2", "ns:k3"]);
    for request in harness.repairs.requests() {
        assert!(request.invalidate_entity);
        assert_eq!(request.reason, UpdateReason::BackgroundSync);
    }

    // a completed pass resets the bookmark
    let bookmark = bookmarks.get().await.unwrap().unwrap();
    assert!(bookmark.last_key.is_empty());
    let status = handle.status().await.unwrap();
    assert_eq!(status.level, HealthLevel::Info);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repairs_make_index_consistent() {
    let harness = TestHarness::new();

    // 1. Drift of every kind
    harness.store.put("k1", 1, json!({"title": "one"}));
    harness.store.put("k2", 1, json!({"title": "two"}));
    harness.store.put("k3", 2, json!({"title": "three v2"}));
    harness
        .store
        .put_with_policy("k4", 1, Some(2), json!({"title": "four"}));

    harness.index.seed("k1", 1, None, json!({"title": "one"}));
    harness.index.seed("k3", 1, None, json!({"title": "three"}));
    harness.index.seed("k4", 1, Some(1), json!({"title": "four"}));
    harness.index.seed("k5", 1, None, json!({"title": "orphan"}));
    assert_eq!(harness.drift().await, vec!["ns:k2", "ns:k3", "ns:k4", "ns:k5"]);

    // 2. Pipeline consumes the repair requests
    let shutdown = CancellationToken::new();
    let pipeline = harness.pipeline();
    let queue = harness.queue.clone();
    let pipeline_cancel = shutdown.clone();
    let pipeline_task =
        tokio::spawn(async move { pipeline.run(queue, pipeline_cancel).await });

    // 3. One reconciliation pass
    let (handle, sync_task) = BackgroundSync::spawn(
        TestHarness::sync_settings(),
        harness.sync_collaborators(Arc::new(InMemoryBookmarkStore::new())),
        shutdown.clone(),
    );
    handle.start().await.unwrap();
    wait_for_passes(&handle, 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // 4. Index matches the store
    assert!(harness.drift().await.is_empty());
    assert_eq!(harness.index.keys(), vec!["ns:k1", "ns:k2", "ns:k3", "ns:k4"]);
    assert_eq!(harness.index.get("k4").unwrap().policy_revision, Some(2));
    assert_eq!(
        Some(harness.index.get("k3").unwrap().document),
        harness.store.document("k3")
    );

    // 5. The next pass finds nothing
    let before = harness.repairs.requests().len();
    handle.start().await.unwrap();
    wait_for_passes(&handle, 2).await;
    assert_eq!(harness.repairs.requests().len(), before);

    shutdown.cancel();
    sync_task.await.unwrap();
    pipeline_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_flaky_scan_resumes_without_gaps() {
    let harness = TestHarness::new();
    for i in 0..10 {
        let name = format!("k{i}");
        harness.store.put(&name, 1, json!({"n": i}));
        // every third entity is stale in the index
        let revision = if i % 3 == 0 { 0 } else { 1 };
        harness.index.seed(&name, revision, None, json!({"n": i}));
    }

    // 1. The index scan breaks twice, after three elements each time
    let flaky = Arc::new(FlakySource::new(harness.index.clone(), 3, 2));
    let mut collaborators = harness.sync_collaborators(Arc::new(InMemoryBookmarkStore::new()));
    collaborators.indexed = flaky.clone();

    let shutdown = CancellationToken::new();
    let (handle, task) =
        BackgroundSync::spawn(TestHarness::sync_settings(), collaborators, shutdown.clone());
    handle.start().await.unwrap();
    wait_for_passes(&handle, 1).await;

    // 2. Each restart picks up after the last delivered key
    assert_eq!(
        flaky.openings(),
        vec![None, Some(key("k2")), Some(key("k5"))]
    );

    // 3. Every stale key is reported exactly once
    assert_eq!(harness.repairs.keys(), vec!["ns:k0", "ns:k3", "ns:k6", "ns:k9"]);
    let status = handle.status().await.unwrap();
    assert_eq!(status.level, HealthLevel::Info);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_interrupted_pass_resumes_from_persisted_bookmark() {
    let harness = TestHarness::new();
    for i in 0..40 {
        let name = format!("k{i:02}");
        harness.store.put(&name, 1, json!({"n": i}));
        harness.index.seed(&name, 1, None, json!({"n": i}));
    }
    harness.store.set_scan_delay(Duration::from_millis(100));

    let mut settings = TestHarness::sync_settings();
    settings.quiet_period_secs = 1;

    // 1. First run persists progress every second, then stops
    let shutdown = CancellationToken::new();
    let (handle, task) = BackgroundSync::spawn(
        settings.clone(),
        harness.sync_collaborators(Arc::new(JsonFileBookmarkStore::new(harness.bookmark_path()))),
        shutdown.clone(),
    );
    handle.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    handle.stop().await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, SyncState::Sleeping);
    assert_eq!(status.passes_completed, 0);
    shutdown.cancel();
    task.await.unwrap();

    let bookmark = JsonFileBookmarkStore::new(harness.bookmark_path())
        .get()
        .await
        .unwrap()
        .unwrap();
    assert!(!bookmark.last_key.is_empty());
    assert_eq!(status.bookmark.last_key, bookmark.last_key);

    // 2. A new process continues after the bookmark
    let shutdown = CancellationToken::new();
    let (handle, task) = BackgroundSync::spawn(
        settings,
        harness.sync_collaborators(Arc::new(JsonFileBookmarkStore::new(harness.bookmark_path()))),
        shutdown.clone(),
    );
    handle.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let openings = harness.store.openings();
    assert_eq!(openings.first(), Some(&None));
    assert_eq!(openings.last(), Some(&Some(bookmark.last_key.clone())));

    shutdown.cancel();
    task.await.unwrap();
    assert!(harness.repairs.requests().is_empty());
}
