use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup;
use crate::discovery::DiscoveryScanner;
use crate::processor::{
    BatchOptions, BatchProcessor, ControlHandle, LogObserver, ProgressObserver,
};
use crate::retry::RetryPolicy;
use crate::store::{ObjectStore, OwnerLookup, PointerSink};
use crate::tracker::{MigrationTracker, Progress, RunStatus};
use crate::validate::{IntegrityValidator, ValidationReport};
use crate::{codes, AppError, AppResult};

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_MAX_CONCURRENCY: usize = 5;
const HARD_MAX_CONCURRENCY: usize = 32;
const HARD_MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub per_call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            per_call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl RunOptions {
    /// Applies `RESCOPE_BATCH_SIZE` / `RESCOPE_MAX_CONCURRENCY` overrides,
    /// clamped to hard ceilings.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = env::var("RESCOPE_BATCH_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            options.batch_size = value.min(HARD_MAX_BATCH_SIZE);
        }
        if let Some(value) = env::var("RESCOPE_MAX_CONCURRENCY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            options.max_concurrency = value.min(HARD_MAX_CONCURRENCY);
        }
        options
    }

    fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size.clamp(1, HARD_MAX_BATCH_SIZE),
            max_concurrency: self.max_concurrency.clamp(1, HARD_MAX_CONCURRENCY),
            per_call_timeout: self.per_call_timeout,
            retry: self.retry,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItemDetail {
    pub old_key: String,
    pub error: String,
}

/// Final report handed back to the caller when a run reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub dry_run: bool,
    pub total_items: i64,
    pub processed_items: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub orphan_count: i64,
    pub failed_items: Vec<FailedItemDetail>,
    pub validation: Option<ValidationReport>,
}

struct ActiveRun {
    run_id: String,
    control: ControlHandle,
}

/// Ties discovery, backup, transfer, validation, and cleanup into one run.
/// One run at a time; the control surface operates on the active run.
pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    owners: Arc<dyn OwnerLookup>,
    pointers: Arc<dyn PointerSink>,
    tracker: MigrationTracker,
    observer: Arc<dyn ProgressObserver>,
    active: Mutex<Option<ActiveRun>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        owners: Arc<dyn OwnerLookup>,
        pointers: Arc<dyn PointerSink>,
        tracker: MigrationTracker,
    ) -> Self {
        Self {
            store,
            owners,
            pointers,
            tracker,
            observer: Arc::new(LogObserver),
            active: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runs one end-to-end migration. Returns `Ok` for runs that reach
    /// Completed or Cancelled; run-fatal conditions (validation errors,
    /// backup failure) mark the run Failed and surface as errors.
    pub async fn start(&self, options: RunOptions) -> AppResult<RunSummary> {
        let control = ControlHandle::new();
        {
            let mut active = self.active.lock().expect("orchestrator state poisoned");
            if active.is_some() {
                return Err(AppError::new(
                    codes::RUN_ACTIVE,
                    "A migration run is already in progress.",
                ));
            }
            *active = Some(ActiveRun {
                run_id: String::new(),
                control: control.clone(),
            });
        }

        let run = match self.tracker.create_run().await {
            Ok(run) => run,
            Err(err) => {
                self.active
                    .lock()
                    .expect("orchestrator state poisoned")
                    .take();
                return Err(err);
            }
        };
        if let Some(active) = self
            .active
            .lock()
            .expect("orchestrator state poisoned")
            .as_mut()
        {
            active.run_id = run.id.clone();
        }

        let result = self.execute(&run.id, &options, &control).await;
        self.active
            .lock()
            .expect("orchestrator state poisoned")
            .take();
        result
    }

    /// Runs the phases and routes every fatal exit through `fail`, so a run
    /// that errors out never lingers in a non-terminal state.
    async fn execute(
        &self,
        run_id: &str,
        options: &RunOptions,
        control: &ControlHandle,
    ) -> AppResult<RunSummary> {
        match self.execute_inner(run_id, options, control).await {
            Ok(summary) => Ok(summary),
            Err(err) => Err(self.fail(run_id, err).await),
        }
    }

    async fn execute_inner(
        &self,
        run_id: &str,
        options: &RunOptions,
        control: &ControlHandle,
    ) -> AppResult<RunSummary> {
        let validator = IntegrityValidator::new(Arc::clone(&self.store), self.tracker.clone());

        self.tracker
            .set_run_status(run_id, RunStatus::PreflightValidation)
            .await?;
        let preflight = validator.preflight().await?;
        if !preflight.ok() {
            return Err(
                AppError::new(codes::VALIDATION_FAILED, "Preflight validation failed.")
                    .with_context("errors", preflight.errors.join("; ")),
            );
        }

        self.tracker
            .set_run_status(run_id, RunStatus::Discovering)
            .await?;
        let scanner = DiscoveryScanner::new(Arc::clone(&self.store), Arc::clone(&self.owners));
        let verified = self.tracker.verified_new_keys().await?;
        let discovery = scanner.discover(&verified).await?;
        self.tracker
            .record_orphans(run_id, discovery.orphan_count, &discovery.orphan_sample)
            .await?;
        if !discovery.duplicate_targets.is_empty() {
            return Err(AppError::new(
                codes::VALIDATION_FAILED,
                "Distinct legacy keys map to the same scoped key.",
            )
            .with_context("targets", discovery.duplicate_targets.join(", ")));
        }
        self.tracker.record_items(run_id, &discovery.candidates).await?;

        if options.dry_run {
            self.tracker
                .set_run_status(run_id, RunStatus::Completed)
                .await?;
            tracing::info!(
                target: "rescope",
                event = "dry_run_complete",
                run_id,
                candidates = discovery.candidates.len(),
            );
            return self.summary(run_id, true, None).await;
        }

        self.tracker
            .set_run_status(run_id, RunStatus::BackingUp)
            .await?;
        backup::create_backup(self.store.as_ref(), run_id, &discovery.candidates).await?;

        self.tracker
            .set_run_status(run_id, RunStatus::Migrating)
            .await?;
        let processor = BatchProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.pointers),
            self.tracker.clone(),
            control.clone(),
            options.batch_options(),
        );
        let pending = self.tracker.pending_items(run_id).await?;
        let outcome = processor
            .run(run_id, pending, Arc::clone(&self.observer))
            .await?;

        // A stop that lands after the final batch still cancels the run; the
        // flag is re-checked before postflight and again before cleanup.
        if outcome.cancelled || control.is_cancelled() {
            self.tracker
                .set_run_status(run_id, RunStatus::Cancelled)
                .await?;
            tracing::info!(target: "rescope", event = "run_cancelled", run_id);
            return self.summary(run_id, false, None).await;
        }

        self.tracker
            .set_run_status(run_id, RunStatus::PostflightValidation)
            .await?;
        let postflight = validator.postflight(run_id).await?;
        if !postflight.ok() {
            return Err(
                AppError::new(codes::VALIDATION_FAILED, "Postflight validation failed.")
                    .with_context("errors", postflight.errors.join("; ")),
            );
        }

        if control.is_cancelled() {
            self.tracker
                .set_run_status(run_id, RunStatus::Cancelled)
                .await?;
            tracing::info!(target: "rescope", event = "run_cancelled", run_id);
            return self.summary(run_id, false, Some(postflight)).await;
        }

        self.tracker
            .set_run_status(run_id, RunStatus::Cleaning)
            .await?;
        self.cleanup(run_id).await?;

        self.tracker
            .set_run_status(run_id, RunStatus::Completed)
            .await?;
        self.summary(run_id, false, Some(postflight)).await
    }

    /// Deletes legacy copies of items that are verified and whose pointer
    /// swap has been acknowledged. Requires the run snapshot to exist.
    async fn cleanup(&self, run_id: &str) -> AppResult<()> {
        backup::load_backup(self.store.as_ref(), run_id).await?;
        let eligible = self.tracker.cleanup_eligible_items(run_id).await?;
        let mut deleted = 0_u64;
        for item in &eligible {
            match self.store.delete(&item.old_key).await {
                Ok(()) => deleted += 1,
                Err(err) => {
                    // The scoped copy is intact; a lingering legacy object is
                    // harmless and picked up by the next run's discovery skip.
                    tracing::warn!(
                        target: "rescope",
                        event = "cleanup_delete_failed",
                        old_key = %item.old_key,
                        error = %err,
                    );
                }
            }
        }
        tracing::info!(
            target: "rescope",
            event = "cleanup_complete",
            run_id,
            eligible = eligible.len(),
            deleted,
        );
        Ok(())
    }

    async fn fail(&self, run_id: &str, err: AppError) -> AppError {
        if let Err(status_err) = self.tracker.set_run_status(run_id, RunStatus::Failed).await {
            tracing::error!(
                target: "rescope",
                event = "run_status_update_failed",
                run_id,
                error = %status_err,
            );
        }
        tracing::error!(
            target: "rescope",
            event = "run_failed",
            run_id,
            code = err.code(),
            error = %err,
        );
        err
    }

    async fn summary(
        &self,
        run_id: &str,
        dry_run: bool,
        validation: Option<ValidationReport>,
    ) -> AppResult<RunSummary> {
        let run = self.tracker.get_run(run_id).await?;
        let failed_items = self
            .tracker
            .failed_items(run_id)
            .await?
            .into_iter()
            .map(|item| FailedItemDetail {
                old_key: item.old_key,
                error: item.error_message.unwrap_or_default(),
            })
            .collect();
        Ok(RunSummary {
            run_id: run.id,
            status: run.status,
            dry_run,
            total_items: run.total_items,
            processed_items: run.processed_items,
            success_count: run.success_count,
            error_count: run.error_count,
            orphan_count: run.orphan_count,
            failed_items,
            validation,
        })
    }

    /// Pauses the active run at the next safe point.
    pub async fn pause(&self) -> AppResult<()> {
        let run_id = {
            let active = self.active.lock().expect("orchestrator state poisoned");
            let Some(active) = active.as_ref() else {
                return Err(AppError::new(codes::RUN_ACTIVE, "No active run to pause."));
            };
            active.control.pause();
            active.run_id.clone()
        };
        self.tracker.set_run_status(&run_id, RunStatus::Paused).await
    }

    pub async fn resume(&self) -> AppResult<()> {
        let run_id = {
            let active = self.active.lock().expect("orchestrator state poisoned");
            let Some(active) = active.as_ref() else {
                return Err(AppError::new(codes::RUN_ACTIVE, "No active run to resume."));
            };
            active.control.resume();
            active.run_id.clone()
        };
        self.tracker
            .set_run_status(&run_id, RunStatus::Migrating)
            .await
    }

    /// Requests cancellation; in-flight items finish to a terminal state.
    pub async fn stop(&self) -> AppResult<()> {
        let run_id = {
            let active = self.active.lock().expect("orchestrator state poisoned");
            let Some(active) = active.as_ref() else {
                return Err(AppError::new(codes::RUN_ACTIVE, "No active run to stop."));
            };
            active.control.stop();
            active.run_id.clone()
        };
        self.tracker
            .set_run_status(&run_id, RunStatus::Cancelling)
            .await
    }

    /// Progress of the active run, falling back to the most recent one.
    pub async fn progress(&self) -> AppResult<Option<Progress>> {
        // The active slot is reserved before the run row exists; an empty id
        // means registration is still in flight.
        let active_id = self
            .active
            .lock()
            .expect("orchestrator state poisoned")
            .as_ref()
            .map(|active| active.run_id.clone())
            .filter(|run_id| !run_id.is_empty());
        match active_id {
            Some(run_id) => self.tracker.progress(&run_id).await.map(Some),
            None => match self.tracker.latest_run().await? {
                Some(run) => self.tracker.progress(&run.id).await.map(Some),
                None => Ok(None),
            },
        }
    }

    /// Standalone integrity check: preflight when no run is named, otherwise
    /// postflight reconciliation of that run.
    pub async fn validate_integrity(&self, run_id: Option<&str>) -> AppResult<ValidationReport> {
        let validator = IntegrityValidator::new(Arc::clone(&self.store), self.tracker.clone());
        match run_id {
            Some(run_id) => validator.postflight(run_id).await,
            None => validator.preflight().await,
        }
    }
}
