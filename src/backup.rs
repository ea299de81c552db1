use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::ObjectStore;
use crate::tracker::CandidateItem;
use crate::{codes, AppError, AppResult};

/// Prefix in the store under which run snapshots live; outside both key
/// conventions so backups are never mistaken for migratable objects.
pub const BACKUP_PREFIX: &str = "migration-backups/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEntry {
    pub old_key: String,
    pub new_key: String,
    pub owner_id: String,
}

/// Snapshot of every candidate taken before any destructive step. Cleanup
/// refuses to delete legacy objects unless the run's snapshot exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<BackupEntry>,
}

impl BackupRecord {
    pub fn store_key(run_id: &str) -> String {
        format!("{BACKUP_PREFIX}{run_id}.json")
    }
}

pub async fn create_backup(
    store: &dyn ObjectStore,
    run_id: &str,
    candidates: &[CandidateItem],
) -> AppResult<BackupRecord> {
    let record = BackupRecord {
        run_id: run_id.to_string(),
        created_at: Utc::now(),
        entries: candidates
            .iter()
            .map(|item| BackupEntry {
                old_key: item.old_key.clone(),
                new_key: item.new_key.clone(),
                owner_id: item.owner_id.clone(),
            })
            .collect(),
    };
    let payload = serde_json::to_vec_pretty(&record)?;
    let key = BackupRecord::store_key(run_id);
    store
        .put(&key, &payload, "application/json")
        .await
        .map_err(|err| {
            AppError::new(codes::BACKUP_FAILED, "Failed to write backup snapshot.")
                .with_context("key", key.clone())
                .with_cause(err)
        })?;
    tracing::info!(
        target: "rescope",
        event = "backup_created",
        run_id,
        key = %key,
        entries = record.entries.len(),
    );
    Ok(record)
}

pub async fn load_backup(store: &dyn ObjectStore, run_id: &str) -> AppResult<BackupRecord> {
    let key = BackupRecord::store_key(run_id);
    let payload = store.get(&key).await.map_err(|err| {
        AppError::new(codes::BACKUP_FAILED, "Backup snapshot missing or unreadable.")
            .with_context("key", key.clone())
            .with_cause(err)
    })?;
    let record: BackupRecord = serde_json::from_slice(&payload)?;
    Ok(record)
}
