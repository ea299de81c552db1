use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::{AppError, AppResult};

/// Lifecycle of one engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    PreflightValidation,
    Discovering,
    BackingUp,
    Migrating,
    Paused,
    Cancelling,
    PostflightValidation,
    Cleaning,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::PreflightValidation => "preflight_validation",
            RunStatus::Discovering => "discovering",
            RunStatus::BackingUp => "backing_up",
            RunStatus::Migrating => "migrating",
            RunStatus::Paused => "paused",
            RunStatus::Cancelling => "cancelling",
            RunStatus::PostflightValidation => "postflight_validation",
            RunStatus::Cleaning => "cleaning",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl FromStr for RunStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let status = match value {
            "idle" => RunStatus::Idle,
            "preflight_validation" => RunStatus::PreflightValidation,
            "discovering" => RunStatus::Discovering,
            "backing_up" => RunStatus::BackingUp,
            "migrating" => RunStatus::Migrating,
            "paused" => RunStatus::Paused,
            "cancelling" => RunStatus::Cancelling,
            "postflight_validation" => RunStatus::PostflightValidation,
            "cleaning" => RunStatus::Cleaning,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            other => {
                return Err(AppError::new("TRACKER/BAD_STATUS", "Unknown run status.")
                    .with_context("status", other.to_string()))
            }
        };
        Ok(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Verified,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Verified => "verified",
            ItemStatus::Failed => "failed",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let status = match value {
            "pending" => ItemStatus::Pending,
            "in_progress" => ItemStatus::InProgress,
            "verified" => ItemStatus::Verified,
            "failed" => ItemStatus::Failed,
            other => {
                return Err(AppError::new("TRACKER/BAD_STATUS", "Unknown item status.")
                    .with_context("status", other.to_string()))
            }
        };
        Ok(status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: String,
    pub status: RunStatus,
    pub total_items: i64,
    pub processed_items: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub orphan_count: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationItem {
    pub id: i64,
    pub run_id: String,
    pub old_key: String,
    pub new_key: String,
    pub owner_id: String,
    pub size_bytes: i64,
    pub status: ItemStatus,
    pub content_hash: Option<String>,
    pub error_message: Option<String>,
    pub pointer_acked: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Candidate produced by discovery, before it has a tracker row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateItem {
    pub old_key: String,
    pub new_key: String,
    pub owner_id: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub run_id: String,
    pub state: RunStatus,
    pub total: i64,
    pub processed: i64,
    pub success: i64,
    pub error: i64,
    pub orphans: i64,
    pub throughput_per_sec: f64,
}

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS migration_runs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    total_items INTEGER NOT NULL DEFAULT 0,
    processed_items INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    orphan_count INTEGER NOT NULL DEFAULT 0,
    orphan_sample TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE TABLE IF NOT EXISTS migration_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES migration_runs(id),
    old_key TEXT NOT NULL,
    new_key TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    content_hash TEXT,
    error_message TEXT,
    pointer_acked INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    completed_at TEXT,
    UNIQUE(run_id, old_key)
);
CREATE INDEX IF NOT EXISTS migration_items_run_status_idx
    ON migration_items(run_id, status);
CREATE INDEX IF NOT EXISTS migration_items_new_key_idx
    ON migration_items(new_key);
";

/// Durable record of runs and items. All mutations flow through this type so
/// concurrent workers never race on the same row; counters are bumped with
/// relative SQL updates, never read-modify-write in process memory.
#[derive(Clone)]
pub struct MigrationTracker {
    pool: SqlitePool,
}

impl MigrationTracker {
    pub async fn open(db_path: &Path) -> AppResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "tracker_create_dir")
                    .with_context("path", parent.display().to_string())
            })?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(opts).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "tracker_open")
                .with_context("path", db_path.display().to_string())
        })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .ok();
        let tracker = Self { pool };
        tracker.ensure_schema().await?;
        Ok(tracker)
    }

    async fn ensure_schema(&self) -> AppResult<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| {
                    AppError::from(err).with_context("operation", "tracker_schema")
                })?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_run(&self) -> AppResult<MigrationRun> {
        let run = MigrationRun {
            id: Uuid::now_v7().to_string(),
            status: RunStatus::Idle,
            total_items: 0,
            processed_items: 0,
            success_count: 0,
            error_count: 0,
            orphan_count: 0,
            started_at: Utc::now(),
            completed_at: None,
        };
        sqlx::query(
            "INSERT INTO migration_runs (id, status, started_at) VALUES (?1, ?2, ?3)",
        )
        .bind(&run.id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_create_run"))?;
        Ok(run)
    }

    pub async fn set_run_status(&self, run_id: &str, status: RunStatus) -> AppResult<()> {
        let completed_at = status.is_terminal().then(Utc::now);
        sqlx::query(
            "UPDATE migration_runs SET status = ?1, \
             completed_at = COALESCE(?2, completed_at) WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "tracker_set_status")
                .with_context("run_id", run_id.to_string())
        })?;
        Ok(())
    }

    pub async fn record_orphans(
        &self,
        run_id: &str,
        count: i64,
        sample: &[String],
    ) -> AppResult<()> {
        let sample_json = serde_json::to_string(sample)?;
        sqlx::query(
            "UPDATE migration_runs SET orphan_count = ?1, orphan_sample = ?2 WHERE id = ?3",
        )
        .bind(count)
        .bind(sample_json)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_record_orphans"))?;
        Ok(())
    }

    /// Persists discovery output as pending items and fixes the run total.
    pub async fn record_items(&self, run_id: &str, items: &[CandidateItem]) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "tracker_record_items"))?;
        for item in items {
            sqlx::query(
                "INSERT INTO migration_items (run_id, old_key, new_key, owner_id, size_bytes) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(run_id)
            .bind(&item.old_key)
            .bind(&item.new_key)
            .bind(&item.owner_id)
            .bind(item.size_bytes)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "tracker_insert_item")
                    .with_context("old_key", item.old_key.clone())
            })?;
        }
        sqlx::query("UPDATE migration_runs SET total_items = ?1 WHERE id = ?2")
            .bind(items.len() as i64)
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "tracker_set_total"))?;
        tx.commit()
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "tracker_record_items"))?;
        Ok(())
    }

    pub async fn pending_items(&self, run_id: &str) -> AppResult<Vec<MigrationItem>> {
        self.items_with_status(run_id, ItemStatus::Pending).await
    }

    pub async fn begin_item(&self, item_id: i64) -> AppResult<()> {
        sqlx::query(
            "UPDATE migration_items SET status = 'in_progress', started_at = ?1 \
             WHERE id = ?2 AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_begin_item"))?;
        Ok(())
    }

    /// Terminal success: records the verified hash and bumps run counters in
    /// the same transaction so `processed = success + error` always holds.
    pub async fn mark_verified(
        &self,
        item_id: i64,
        run_id: &str,
        hash: &str,
        size_bytes: i64,
    ) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "tracker_mark_verified"))?;
        sqlx::query(
            "UPDATE migration_items SET status = 'verified', content_hash = ?1, \
             size_bytes = ?2, error_message = NULL, completed_at = ?3 WHERE id = ?4",
        )
        .bind(hash)
        .bind(size_bytes)
        .bind(Utc::now())
        .bind(item_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_mark_verified"))?;
        sqlx::query(
            "UPDATE migration_runs SET processed_items = processed_items + 1, \
             success_count = success_count + 1 WHERE id = ?1",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_mark_verified"))?;
        tx.commit()
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "tracker_mark_verified"))?;
        Ok(())
    }

    pub async fn mark_failed(&self, item_id: i64, run_id: &str, error: &AppError) -> AppResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "tracker_mark_failed"))?;
        sqlx::query(
            "UPDATE migration_items SET status = 'failed', error_message = ?1, \
             completed_at = ?2 WHERE id = ?3",
        )
        .bind(error.to_string())
        .bind(Utc::now())
        .bind(item_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_mark_failed"))?;
        sqlx::query(
            "UPDATE migration_runs SET processed_items = processed_items + 1, \
             error_count = error_count + 1 WHERE id = ?1",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_mark_failed"))?;
        tx.commit()
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "tracker_mark_failed"))?;
        Ok(())
    }

    pub async fn mark_pointer_acked(&self, item_id: i64) -> AppResult<()> {
        sqlx::query("UPDATE migration_items SET pointer_acked = 1 WHERE id = ?1")
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                AppError::from(err).with_context("operation", "tracker_mark_pointer_acked")
            })?;
        Ok(())
    }

    /// Scoped keys verified in any run; discovery uses this for idempotent
    /// skips when the engine is re-run over a partially migrated store.
    pub async fn verified_new_keys(&self) -> AppResult<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT new_key FROM migration_items WHERE status = 'verified'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_verified_keys"))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("new_key").ok())
            .collect())
    }

    pub async fn get_run(&self, run_id: &str) -> AppResult<MigrationRun> {
        let row = sqlx::query(
            "SELECT id, status, total_items, processed_items, success_count, error_count, \
             orphan_count, started_at, completed_at FROM migration_runs WHERE id = ?1",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "tracker_get_run")
                .with_context("run_id", run_id.to_string())
        })?;
        Self::run_from_row(&row)
    }

    pub async fn latest_run(&self) -> AppResult<Option<MigrationRun>> {
        let row = sqlx::query(
            "SELECT id, status, total_items, processed_items, success_count, error_count, \
             orphan_count, started_at, completed_at FROM migration_runs \
             ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_latest_run"))?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    pub async fn progress(&self, run_id: &str) -> AppResult<Progress> {
        let run = self.get_run(run_id).await?;
        let elapsed = (Utc::now() - run.started_at).num_milliseconds().max(1) as f64 / 1000.0;
        Ok(Progress {
            run_id: run.id,
            state: run.status,
            total: run.total_items,
            processed: run.processed_items,
            success: run.success_count,
            error: run.error_count,
            orphans: run.orphan_count,
            throughput_per_sec: run.processed_items as f64 / elapsed,
        })
    }

    pub async fn verified_items(&self, run_id: &str) -> AppResult<Vec<MigrationItem>> {
        self.items_with_status(run_id, ItemStatus::Verified).await
    }

    pub async fn failed_items(&self, run_id: &str) -> AppResult<Vec<MigrationItem>> {
        self.items_with_status(run_id, ItemStatus::Failed).await
    }

    /// Items safe to strip of their legacy copy: verified AND the caller has
    /// acknowledged the pointer swap.
    pub async fn cleanup_eligible_items(&self, run_id: &str) -> AppResult<Vec<MigrationItem>> {
        let rows = sqlx::query(
            "SELECT * FROM migration_items \
             WHERE run_id = ?1 AND status = 'verified' AND pointer_acked = 1 ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "tracker_cleanup_items"))?;
        rows.iter().map(Self::item_from_row).collect()
    }

    async fn items_with_status(
        &self,
        run_id: &str,
        status: ItemStatus,
    ) -> AppResult<Vec<MigrationItem>> {
        let mut rows = sqlx::query(
            "SELECT * FROM migration_items WHERE run_id = ?1 AND status = ?2 ORDER BY id",
        )
        .bind(run_id)
        .bind(status.as_str())
        .fetch(&self.pool);
        let mut items = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "tracker_items_with_status")
                .with_context("status", status.as_str().to_string())
        })? {
            items.push(Self::item_from_row(&row)?);
        }
        Ok(items)
    }

    fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<MigrationRun> {
        let status: String = row.try_get("status").map_err(AppError::from)?;
        Ok(MigrationRun {
            id: row.try_get("id").map_err(AppError::from)?,
            status: status.parse()?,
            total_items: row.try_get("total_items").map_err(AppError::from)?,
            processed_items: row.try_get("processed_items").map_err(AppError::from)?,
            success_count: row.try_get("success_count").map_err(AppError::from)?,
            error_count: row.try_get("error_count").map_err(AppError::from)?,
            orphan_count: row.try_get("orphan_count").map_err(AppError::from)?,
            started_at: row.try_get("started_at").map_err(AppError::from)?,
            completed_at: row.try_get("completed_at").map_err(AppError::from)?,
        })
    }

    fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<MigrationItem> {
        let status: String = row.try_get("status").map_err(AppError::from)?;
        Ok(MigrationItem {
            id: row.try_get("id").map_err(AppError::from)?,
            run_id: row.try_get("run_id").map_err(AppError::from)?,
            old_key: row.try_get("old_key").map_err(AppError::from)?,
            new_key: row.try_get("new_key").map_err(AppError::from)?,
            owner_id: row.try_get("owner_id").map_err(AppError::from)?,
            size_bytes: row.try_get("size_bytes").map_err(AppError::from)?,
            status: status.parse()?,
            content_hash: row.try_get("content_hash").map_err(AppError::from)?,
            error_message: row.try_get("error_message").map_err(AppError::from)?,
            pointer_acked: row.try_get::<i64, _>("pointer_acked").map_err(AppError::from)? != 0,
            started_at: row.try_get("started_at").map_err(AppError::from)?,
            completed_at: row.try_get("completed_at").map_err(AppError::from)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_tracker() -> (tempfile::TempDir, MigrationTracker) {
        let dir = tempdir().expect("tempdir");
        let tracker = MigrationTracker::open(&dir.path().join("tracker.sqlite3"))
            .await
            .expect("open tracker");
        (dir, tracker)
    }

    fn candidate(idx: u32) -> CandidateItem {
        CandidateItem {
            old_key: format!("receipts/{idx}/a.png"),
            new_key: format!("users/7/receipts/{idx}/a.png"),
            owner_id: "7".into(),
            size_bytes: 3,
        }
    }

    #[tokio::test]
    async fn counters_track_terminal_transitions() {
        let (_dir, tracker) = open_tracker().await;
        let run = tracker.create_run().await.unwrap();
        tracker
            .record_items(&run.id, &[candidate(1), candidate(2)])
            .await
            .unwrap();

        let items = tracker.pending_items(&run.id).await.unwrap();
        assert_eq!(items.len(), 2);

        tracker.begin_item(items[0].id).await.unwrap();
        tracker
            .mark_verified(items[0].id, &run.id, "abc123", 3)
            .await
            .unwrap();
        tracker
            .mark_failed(
                items[1].id,
                &run.id,
                &AppError::new("INTEGRITY/HASH_MISMATCH", "mismatch"),
            )
            .await
            .unwrap();

        let run = tracker.get_run(&run.id).await.unwrap();
        assert_eq!(run.total_items, 2);
        assert_eq!(run.processed_items, 2);
        assert_eq!(run.success_count, 1);
        assert_eq!(run.error_count, 1);
        assert_eq!(run.processed_items, run.success_count + run.error_count);
    }

    #[tokio::test]
    async fn cleanup_requires_pointer_ack() {
        let (_dir, tracker) = open_tracker().await;
        let run = tracker.create_run().await.unwrap();
        tracker.record_items(&run.id, &[candidate(1)]).await.unwrap();
        let item = &tracker.pending_items(&run.id).await.unwrap()[0];

        tracker
            .mark_verified(item.id, &run.id, "abc", 3)
            .await
            .unwrap();
        assert!(tracker
            .cleanup_eligible_items(&run.id)
            .await
            .unwrap()
            .is_empty());

        tracker.mark_pointer_acked(item.id).await.unwrap();
        let eligible = tracker.cleanup_eligible_items(&run.id).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].old_key, "receipts/1/a.png");
    }

    #[tokio::test]
    async fn verified_keys_span_runs() {
        let (_dir, tracker) = open_tracker().await;
        let first = tracker.create_run().await.unwrap();
        tracker.record_items(&first.id, &[candidate(1)]).await.unwrap();
        let item = &tracker.pending_items(&first.id).await.unwrap()[0];
        tracker
            .mark_verified(item.id, &first.id, "abc", 3)
            .await
            .unwrap();

        let _second = tracker.create_run().await.unwrap();
        let verified = tracker.verified_new_keys().await.unwrap();
        assert!(verified.contains("users/7/receipts/1/a.png"));
    }

    #[tokio::test]
    async fn terminal_status_sets_completed_at() {
        let (_dir, tracker) = open_tracker().await;
        let run = tracker.create_run().await.unwrap();
        tracker
            .set_run_status(&run.id, RunStatus::Migrating)
            .await
            .unwrap();
        assert!(tracker.get_run(&run.id).await.unwrap().completed_at.is_none());
        tracker
            .set_run_status(&run.id, RunStatus::Completed)
            .await
            .unwrap();
        let run = tracker.get_run(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
    }
}
