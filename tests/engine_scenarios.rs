use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rescope_lib::processor::SilentObserver;
use rescope_lib::store::{
    ListPage, MapOwnerLookup, MemoryStore, ObjectStore, OwnerLookup, PointerSink, PointerUpdate,
};
use rescope_lib::tracker::RunStatus;
use rescope_lib::{AppResult, MigrationTracker, Orchestrator, RunOptions};
use tempfile::tempdir;

struct RecordingSink {
    updates: Mutex<Vec<PointerUpdate>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
        }
    }

    fn updates(&self) -> Vec<PointerUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PointerSink for RecordingSink {
    async fn apply(&self, update: &PointerUpdate) -> AppResult<()> {
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

struct RejectingSink;

#[async_trait]
impl PointerSink for RejectingSink {
    async fn apply(&self, _update: &PointerUpdate) -> AppResult<()> {
        Err(rescope_lib::AppError::new(
            rescope_lib::codes::POINTER_REJECTED,
            "pointer store unavailable",
        ))
    }
}

/// Sink that requests cancellation of its own run from inside `apply`, which
/// lands the stop after the final batch has already drained.
#[derive(Default)]
struct StoppingSink {
    orchestrator: Mutex<Option<Arc<Orchestrator>>>,
}

#[async_trait]
impl PointerSink for StoppingSink {
    async fn apply(&self, _update: &PointerUpdate) -> AppResult<()> {
        let orchestrator = self.orchestrator.lock().unwrap().clone();
        if let Some(orchestrator) = orchestrator {
            orchestrator.stop().await?;
        }
        Ok(())
    }
}

/// Owner lookup that errors on every query, as a stand-in for an unreachable
/// owner table.
struct FailingOwners;

#[async_trait]
impl OwnerLookup for FailingOwners {
    async fn owner_for_legacy_key(&self, _key: &str) -> AppResult<Option<String>> {
        Err(rescope_lib::AppError::new(
            rescope_lib::codes::STORE_PERMANENT,
            "owner table unavailable",
        ))
    }
}

/// Store that refuses writes under the snapshot prefix.
struct BackupRejectingStore {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl ObjectStore for BackupRejectingStore {
    async fn list(&self, prefix: &str, token: Option<&str>) -> AppResult<ListPage> {
        self.inner.list(prefix, token).await
    }

    async fn get(&self, key: &str) -> AppResult<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AppResult<String> {
        if key.starts_with("migration-backups/") {
            return Err(rescope_lib::AppError::new(
                rescope_lib::codes::STORE_PERMANENT,
                "snapshot prefix is read-only",
            ));
        }
        self.inner.put(key, bytes, content_type).await
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.inner.delete(key).await
    }

    async fn head(&self, key: &str) -> AppResult<bool> {
        self.inner.head(key).await
    }
}

/// Store wrapper that slows every call down and records the maximum number of
/// concurrent in-flight operations.
struct DelayStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl DelayStore {
    fn new(inner: Arc<MemoryStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn max_seen(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for DelayStore {
    async fn list(&self, prefix: &str, token: Option<&str>) -> AppResult<ListPage> {
        self.inner.list(prefix, token).await
    }

    async fn get(&self, key: &str) -> AppResult<Vec<u8>> {
        self.enter().await;
        let result = self.inner.get(key).await;
        self.exit();
        result
    }

    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> AppResult<String> {
        self.enter().await;
        let result = self.inner.put(key, bytes, content_type).await;
        self.exit();
        result
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.inner.delete(key).await
    }

    async fn head(&self, key: &str) -> AppResult<bool> {
        self.inner.head(key).await
    }
}

async fn open_tracker(dir: &tempfile::TempDir) -> MigrationTracker {
    MigrationTracker::open(&dir.path().join("tracker.sqlite3"))
        .await
        .expect("open tracker")
}

fn owners_for(pairs: &[(&str, &str)]) -> MapOwnerLookup {
    let mut owners = MapOwnerLookup::default();
    for (item, owner) in pairs {
        owners.insert(item, owner);
    }
    owners
}

fn quick_options() -> RunOptions {
    RunOptions {
        per_call_timeout: Duration::from_secs(5),
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn migrates_single_receipt_end_to_end() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"original bytes");
    let original = store.get("receipts/42/a.png").await.unwrap();

    let sink = Arc::new(RecordingSink::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("42", "7")])),
        sink.clone(),
        open_tracker(&dir).await,
    );

    let summary = orchestrator.start(quick_options()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.total_items, 1);
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.error_count, 0);

    let migrated = store.get("users/7/receipts/42/a.png").await.unwrap();
    assert_eq!(migrated, original);
    // Legacy copy removed during cleanup, after the acknowledged swap.
    assert!(!store.head("receipts/42/a.png").await.unwrap());

    let updates = sink.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].old_ref, "receipts/42/a.png");
    assert_eq!(updates[0].new_ref, "users/7/receipts/42/a.png");
    assert_eq!(updates[0].owner_id, "7");
}

#[tokio::test]
async fn corrupted_upload_fails_verification_and_preserves_source() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"original bytes");
    store.corrupt_next_put("users/7/receipts/42/a.png");

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("42", "7")])),
        Arc::new(RecordingSink::new()),
        open_tracker(&dir).await,
    );

    let summary = orchestrator.start(quick_options()).await.unwrap();
    assert_eq!(summary.error_count, 1);
    assert_eq!(summary.success_count, 0);
    assert_eq!(summary.failed_items.len(), 1);
    assert!(summary.failed_items[0].error.contains("INTEGRITY/HASH_MISMATCH"));
    // Old object untouched; nothing was deleted.
    assert!(store.head("receipts/42/a.png").await.unwrap());
}

#[tokio::test]
async fn dry_run_counts_without_mutating() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut pairs = Vec::new();
    let ids: Vec<String> = (0..10).map(|idx| idx.to_string()).collect();
    for id in &ids {
        store.insert(&format!("receipts/{id}/scan.pdf"), b"doc");
        pairs.push((id.as_str(), "7"));
    }
    let before = store.keys();

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&pairs)),
        Arc::new(RecordingSink::new()),
        open_tracker(&dir).await,
    )
    .with_observer(Arc::new(SilentObserver));

    let mut options = quick_options();
    options.dry_run = true;
    let summary = orchestrator.start(options).await.unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.total_items, 10);
    assert_eq!(summary.success_count, 0);
    assert_eq!(store.keys(), before);
}

#[tokio::test]
async fn ownerless_objects_are_orphans_not_failures() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"owned");
    store.insert("receipts/99/lost.png", b"ownerless");

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("42", "7")])),
        Arc::new(RecordingSink::new()),
        open_tracker(&dir).await,
    );

    let summary = orchestrator.start(quick_options()).await.unwrap();
    assert_eq!(summary.total_items, 1);
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.error_count, 0);
    assert_eq!(summary.orphan_count, 1);
    // Orphan stays where it was.
    assert!(store.head("receipts/99/lost.png").await.unwrap());
}

#[tokio::test]
async fn rerun_skips_already_verified_targets() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/1/a.png", b"one");
    let tracker = open_tracker(&dir).await;

    // First run: pointer swap is rejected, so cleanup leaves the legacy
    // object behind even though the copy verified.
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("1", "7")])),
        Arc::new(RejectingSink),
        tracker.clone(),
    );
    let summary = orchestrator.start(quick_options()).await.unwrap();
    assert_eq!(summary.success_count, 1);
    assert!(store.head("receipts/1/a.png").await.unwrap());
    assert!(store.head("users/7/receipts/1/a.png").await.unwrap());

    // Second run over the same store plus one new object: the verified
    // target is excluded from the new run's total.
    store.insert("receipts/2/b.png", b"two");
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("1", "7"), ("2", "8")])),
        Arc::new(RecordingSink::new()),
        tracker,
    );
    let summary = orchestrator.start(quick_options()).await.unwrap();
    assert_eq!(summary.total_items, 1);
    assert_eq!(summary.success_count, 1);
    assert!(store.head("users/8/receipts/2/b.png").await.unwrap());
}

#[tokio::test]
async fn transient_store_errors_are_retried() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"flaky");
    store.fail_gets("receipts/42/a.png", 2);

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("42", "7")])),
        Arc::new(RecordingSink::new()),
        open_tracker(&dir).await,
    );

    let mut options = quick_options();
    options.retry.base_delay = Duration::from_millis(5);
    let summary = orchestrator.start(options).await.unwrap();
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.error_count, 0);
}

#[tokio::test]
async fn retry_ceiling_marks_item_failed() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"flaky");
    store.fail_gets("receipts/42/a.png", 50);

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("42", "7")])),
        Arc::new(RecordingSink::new()),
        open_tracker(&dir).await,
    );

    let mut options = quick_options();
    options.retry.base_delay = Duration::from_millis(1);
    options.retry.max_delay = Duration::from_millis(2);
    let summary = orchestrator.start(options).await.unwrap();
    assert_eq!(summary.error_count, 1);
    assert!(summary.failed_items[0].error.contains("STORE/TRANSIENT"));
    assert!(store.head("receipts/42/a.png").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_transfers_respect_concurrency_bound() {
    let dir = tempdir().unwrap();
    let inner = Arc::new(MemoryStore::new());
    let mut pairs = Vec::new();
    let ids: Vec<String> = (0..12).map(|idx| idx.to_string()).collect();
    for id in &ids {
        inner.insert(&format!("receipts/{id}/a.png"), b"img");
        pairs.push((id.as_str(), "7"));
    }
    let store = Arc::new(DelayStore::new(inner, Duration::from_millis(15)));

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&pairs)),
        Arc::new(RecordingSink::new()),
        open_tracker(&dir).await,
    );

    let mut options = quick_options();
    options.batch_size = 12;
    options.max_concurrency = 3;
    let summary = orchestrator.start(options).await.unwrap();
    assert_eq!(summary.success_count, 12);
    assert!(
        store.max_seen() <= 3,
        "observed {} concurrent transfers",
        store.max_seen()
    );
}

async fn wait_for_state(
    orchestrator: &Orchestrator,
    wanted: RunStatus,
    deadline: Duration,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(Some(progress)) = orchestrator.progress().await {
            if progress.state == wanted {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_blocks_new_items_and_resume_continues() {
    let dir = tempdir().unwrap();
    let inner = Arc::new(MemoryStore::new());
    let mut pairs = Vec::new();
    let ids: Vec<String> = (0..8).map(|idx| idx.to_string()).collect();
    for id in &ids {
        inner.insert(&format!("receipts/{id}/a.png"), b"img");
        pairs.push((id.as_str(), "7"));
    }
    let store = Arc::new(DelayStore::new(inner, Duration::from_millis(25)));

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(owners_for(&pairs)),
        Arc::new(RecordingSink::new()),
        open_tracker(&dir).await,
    ));

    let mut options = quick_options();
    options.batch_size = 2;
    options.max_concurrency = 2;
    let run = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.start(options).await })
    };

    assert!(wait_for_state(&orchestrator, RunStatus::Migrating, Duration::from_secs(5)).await);
    orchestrator.pause().await.unwrap();

    // Let in-flight items drain, then confirm nothing new starts.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let processed_then = orchestrator.progress().await.unwrap().unwrap().processed;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let processed_now = orchestrator.progress().await.unwrap().unwrap().processed;
    assert_eq!(processed_then, processed_now);
    assert!(processed_now < 8);

    orchestrator.resume().await.unwrap();
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.success_count, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_cancels_run_without_leaving_items_in_progress() {
    let dir = tempdir().unwrap();
    let inner = Arc::new(MemoryStore::new());
    let mut pairs = Vec::new();
    let ids: Vec<String> = (0..20).map(|idx| idx.to_string()).collect();
    for id in &ids {
        inner.insert(&format!("receipts/{id}/a.png"), b"img");
        pairs.push((id.as_str(), "7"));
    }
    let store = Arc::new(DelayStore::new(inner, Duration::from_millis(25)));
    let tracker = open_tracker(&dir).await;

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(owners_for(&pairs)),
        Arc::new(RecordingSink::new()),
        tracker.clone(),
    ));

    let mut options = quick_options();
    options.batch_size = 1;
    options.max_concurrency = 2;
    let run = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.start(options).await })
    };

    assert!(wait_for_state(&orchestrator, RunStatus::Migrating, Duration::from_secs(5)).await);
    orchestrator.stop().await.unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert!(summary.processed_items < 20);

    // Every item reached a terminal or untouched state; none stuck mid-flight.
    let run_id = summary.run_id;
    let pending = tracker.pending_items(&run_id).await.unwrap().len() as i64;
    let verified = tracker.verified_items(&run_id).await.unwrap().len() as i64;
    let failed = tracker.failed_items(&run_id).await.unwrap().len() as i64;
    assert_eq!(pending + verified + failed, 20);
}

#[tokio::test]
async fn backup_failure_fails_the_run_before_any_transfer() {
    let dir = tempdir().unwrap();
    let inner = Arc::new(MemoryStore::new());
    inner.insert("receipts/42/a.png", b"original");
    let tracker = open_tracker(&dir).await;

    let orchestrator = Orchestrator::new(
        Arc::new(BackupRejectingStore {
            inner: inner.clone(),
        }),
        Arc::new(owners_for(&[("42", "7")])),
        Arc::new(RecordingSink::new()),
        tracker.clone(),
    );

    let err = orchestrator.start(quick_options()).await.unwrap_err();
    assert_eq!(err.code(), rescope_lib::codes::BACKUP_FAILED);

    let run = tracker.latest_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.processed_items, 0);
    // Nothing was transferred or deleted.
    assert!(inner.head("receipts/42/a.png").await.unwrap());
    assert!(!inner.head("users/7/receipts/42/a.png").await.unwrap());
}

#[tokio::test]
async fn discovery_error_marks_run_failed() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"original");
    let tracker = open_tracker(&dir).await;

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(FailingOwners),
        Arc::new(RecordingSink::new()),
        tracker.clone(),
    );

    let err = orchestrator.start(quick_options()).await.unwrap_err();
    assert_eq!(err.code(), rescope_lib::codes::STORE_PERMANENT);

    // The run reaches a terminal state instead of sticking in discovery.
    let run = tracker.latest_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(store.head("receipts/42/a.png").await.unwrap());
}

#[tokio::test]
async fn stop_after_final_batch_cancels_before_cleanup() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"original");

    let sink = Arc::new(StoppingSink::default());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("42", "7")])),
        sink.clone(),
        open_tracker(&dir).await,
    ));
    *sink.orchestrator.lock().unwrap() = Some(Arc::clone(&orchestrator));

    let summary = orchestrator.start(quick_options()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.success_count, 1);
    // Copy verified and acknowledged, but a cancelled run never cleans up.
    assert!(store.head("receipts/42/a.png").await.unwrap());
    assert!(store.head("users/7/receipts/42/a.png").await.unwrap());
}

#[tokio::test]
async fn progress_falls_back_to_latest_run_when_idle() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"original");

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("42", "7")])),
        Arc::new(RecordingSink::new()),
        open_tracker(&dir).await,
    );

    let summary = orchestrator.start(quick_options()).await.unwrap();
    let progress = orchestrator.progress().await.unwrap().unwrap();
    assert_eq!(progress.run_id, summary.run_id);
    assert_eq!(progress.state, RunStatus::Completed);
    assert_eq!(progress.processed, 1);
}

#[tokio::test]
async fn rejected_pointer_update_blocks_deletion() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.insert("receipts/42/a.png", b"original");

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(owners_for(&[("42", "7")])),
        Arc::new(RejectingSink),
        open_tracker(&dir).await,
    );

    let summary = orchestrator.start(quick_options()).await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.success_count, 1);
    // Copy verified but never acknowledged: the legacy object survives.
    assert!(store.head("receipts/42/a.png").await.unwrap());
    assert!(store.head("users/7/receipts/42/a.png").await.unwrap());
}
