use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Semaphore};

use crate::retry::RetryPolicy;
use crate::store::{ObjectStore, PointerSink, PointerUpdate};
use crate::tracker::{MigrationItem, MigrationTracker, Progress};
use crate::{codes, AppError, AppResult};

const CONTENT_TYPE: &str = "application/octet-stream";

/// Cooperative pause/cancel flags shared between the control surface and the
/// worker tasks. Workers check them at safe points only, never mid-transfer.
#[derive(Clone)]
pub struct ControlHandle {
    pause_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        let (pause_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Self { pause_tx, cancel_tx }
    }

    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    pub fn stop(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Blocks until the pause flag clears or the run is cancelled. Called
    /// from the batch control loop, so paused runs hold no concurrency slots.
    pub async fn wait_while_paused(&self) {
        let mut pause_rx = self.pause_tx.subscribe();
        let mut cancel_rx = self.cancel_tx.subscribe();
        while *pause_rx.borrow() && !*cancel_rx.borrow() {
            tokio::select! {
                _ = pause_rx.changed() => {}
                _ = cancel_rx.changed() => {}
            }
        }
    }
}

/// Receives throttled progress snapshots; hosts forward these to whatever
/// surface renders them.
pub trait ProgressObserver: Send + Sync {
    fn emit(&self, progress: &Progress);
}

/// Observer that drops every snapshot.
pub struct SilentObserver;

impl ProgressObserver for SilentObserver {
    fn emit(&self, _progress: &Progress) {}
}

/// Observer that logs snapshots through tracing.
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn emit(&self, progress: &Progress) {
        tracing::info!(
            target: "rescope",
            event = "migration_progress",
            run_id = %progress.run_id,
            state = progress.state.as_str(),
            total = progress.total,
            processed = progress.processed,
            success = progress.success,
            error = progress.error,
        );
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub per_call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 5,
            per_call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub attempted: u64,
    pub verified: u64,
    pub failed: u64,
    pub cancelled: bool,
}

enum ItemOutcome {
    Verified,
    Failed,
}

/// Drives pending items through download, hash, upload, re-download, verify,
/// and pointer emission. Batches run sequentially; items inside a batch run
/// in parallel up to `max_concurrency`.
pub struct BatchProcessor {
    store: Arc<dyn ObjectStore>,
    pointers: Arc<dyn PointerSink>,
    tracker: MigrationTracker,
    control: ControlHandle,
    options: BatchOptions,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        pointers: Arc<dyn PointerSink>,
        tracker: MigrationTracker,
        control: ControlHandle,
        options: BatchOptions,
    ) -> Self {
        Self {
            store,
            pointers,
            tracker,
            control,
            options,
        }
    }

    pub async fn run(
        &self,
        run_id: &str,
        items: Vec<MigrationItem>,
        observer: Arc<dyn ProgressObserver>,
    ) -> AppResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let batch_size = self.options.batch_size.max(1);

        'batches: for batch in items.chunks(batch_size) {
            if self.control.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            self.control.wait_while_paused().await;

            let mut handles = Vec::with_capacity(batch.len());
            for item in batch {
                if self.control.is_cancelled() {
                    outcome.cancelled = true;
                    break;
                }
                self.control.wait_while_paused().await;
                if self.control.is_cancelled() {
                    outcome.cancelled = true;
                    break;
                }

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| AppError::new(codes::RUN_CANCELLED, "Worker pool closed."))?;
                let store = Arc::clone(&self.store);
                let pointers = Arc::clone(&self.pointers);
                let tracker = self.tracker.clone();
                let options = self.options.clone();
                let run_id = run_id.to_string();
                let item = item.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    process_one(&store, &pointers, &tracker, &options, &run_id, &item).await
                }));
            }

            for handle in handles {
                let result = handle.await.map_err(|err| {
                    AppError::new("PROCESSOR/TASK", "Worker task panicked.")
                        .with_context("error", err.to_string())
                })?;
                outcome.attempted += 1;
                match result? {
                    ItemOutcome::Verified => outcome.verified += 1,
                    ItemOutcome::Failed => outcome.failed += 1,
                }
            }

            let progress = self.tracker.progress(run_id).await?;
            observer.emit(&progress);

            if outcome.cancelled {
                break 'batches;
            }
        }

        Ok(outcome)
    }
}

/// One item, start to terminal state. Per-item errors are absorbed into the
/// tracker; only tracker failures propagate.
async fn process_one(
    store: &Arc<dyn ObjectStore>,
    pointers: &Arc<dyn PointerSink>,
    tracker: &MigrationTracker,
    options: &BatchOptions,
    run_id: &str,
    item: &MigrationItem,
) -> AppResult<ItemOutcome> {
    tracker.begin_item(item.id).await?;

    match transfer_and_verify(store, options, item).await {
        Ok((hash, size)) => {
            tracker.mark_verified(item.id, run_id, &hash, size).await?;
            let update = PointerUpdate {
                old_ref: item.old_key.clone(),
                new_ref: item.new_key.clone(),
                owner_id: item.owner_id.clone(),
            };
            match pointers.apply(&update).await {
                Ok(()) => tracker.mark_pointer_acked(item.id).await?,
                Err(err) => {
                    // The copy is good but the caller never acknowledged the
                    // swap, so the item stays ineligible for cleanup.
                    tracing::warn!(
                        target: "rescope",
                        event = "pointer_update_rejected",
                        old_key = %item.old_key,
                        error = %err,
                    );
                }
            }
            Ok(ItemOutcome::Verified)
        }
        Err(err) => {
            tracing::warn!(
                target: "rescope",
                event = "item_failed",
                old_key = %item.old_key,
                code = err.code(),
                error = %err,
            );
            tracker.mark_failed(item.id, run_id, &err).await?;
            Ok(ItemOutcome::Failed)
        }
    }
}

async fn transfer_and_verify(
    store: &Arc<dyn ObjectStore>,
    options: &BatchOptions,
    item: &MigrationItem,
) -> AppResult<(String, i64)> {
    let bytes = with_retry(options, "download_source", || store.get(&item.old_key)).await?;
    let source_hash = hash_bytes(&bytes);

    with_retry(options, "upload_target", || {
        store.put(&item.new_key, &bytes, CONTENT_TYPE)
    })
    .await?;

    let written = with_retry(options, "readback_target", || store.get(&item.new_key)).await?;
    let target_hash = hash_bytes(&written);

    if source_hash != target_hash {
        return Err(AppError::new(
            codes::HASH_MISMATCH,
            "Transferred object does not match the source.",
        )
        .with_context("old_key", item.old_key.clone())
        .with_context("new_key", item.new_key.clone())
        .with_context("source_hash", source_hash)
        .with_context("target_hash", target_hash));
    }

    Ok((source_hash, bytes.len() as i64))
}

pub(crate) fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

async fn with_retry<T, F, Fut>(options: &BatchOptions, operation: &str, mut call: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut attempt = 0_u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(options.per_call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::new(codes::STORE_TIMEOUT, "Store call timed out.")
                .with_context("operation", operation.to_string())),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => match options.retry.next_delay(attempt) {
                Some(delay) => {
                    tracing::debug!(
                        target: "rescope",
                        event = "store_retry",
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(err.with_context("attempts", attempt.to_string()));
                }
            },
            Err(err) => return Err(err),
        }
    }
}
