use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys::{LEGACY_PREFIX, SCOPED_PREFIX};
use crate::processor::hash_bytes;
use crate::store::ObjectStore;
use crate::tracker::MigrationTracker;
use crate::AppResult;

const SAMPLE_SIZE: usize = 10;

/// Outcome of a preflight or postflight pass. Errors block the run from
/// proceeding; warnings are advisory and logged for operator follow-up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

pub struct IntegrityValidator {
    store: Arc<dyn ObjectStore>,
    tracker: MigrationTracker,
}

impl IntegrityValidator {
    pub fn new(store: Arc<dyn ObjectStore>, tracker: MigrationTracker) -> Self {
        Self { store, tracker }
    }

    /// Connectivity and permission checks run before anything is mutated.
    /// Writes and removes a probe object outside both key conventions.
    pub async fn preflight(&self) -> AppResult<ValidationReport> {
        let mut report = ValidationReport::default();

        if let Err(err) = self.store.list(LEGACY_PREFIX, None).await {
            report.error(format!("store listing failed: {err}"));
        }

        let probe_key = format!("migration-probe/{}", Uuid::new_v4());
        match self.store.put(&probe_key, b"probe", "text/plain").await {
            Ok(_) => {
                match self.store.head(&probe_key).await {
                    Ok(true) => {}
                    Ok(false) => report.error("probe object not visible after write".to_string()),
                    Err(err) => report.error(format!("probe head failed: {err}")),
                }
                if let Err(err) = self.store.delete(&probe_key).await {
                    report.error(format!("probe delete failed: {err}"));
                }
            }
            Err(err) => report.error(format!("probe write failed: {err}")),
        }

        if let Err(err) = sqlx::query("SELECT 1").fetch_one(self.tracker.pool()).await {
            report.error(format!("tracker unreachable: {err}"));
        }

        self.log(&report, "preflight");
        Ok(report)
    }

    /// Reconciles the store against the tracker after migration: every
    /// verified copy must exist and be retrievable, scoped objects the
    /// tracker never produced are reported, and a sample of verified items
    /// is re-fetched and re-hashed.
    pub async fn postflight(&self, run_id: &str) -> AppResult<ValidationReport> {
        let mut report = ValidationReport::default();

        let verified = self.tracker.verified_items(run_id).await?;
        for item in &verified {
            match self.store.head(&item.new_key).await {
                Ok(true) => {}
                Ok(false) => report.error(format!("verified copy missing: {}", item.new_key)),
                Err(err) => report.error(format!("head failed for {}: {err}", item.new_key)),
            }
        }

        let known = self.tracker.verified_new_keys().await?;
        let mut scoped_total = 0_usize;
        let mut token: Option<String> = None;
        loop {
            let page = self.store.list(SCOPED_PREFIX, token.as_deref()).await?;
            for key in &page.keys {
                scoped_total += 1;
                if !known.contains(key) {
                    report.warning(format!("scoped object without tracker record: {key}"));
                }
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        if scoped_total < known.len() {
            report.error(format!(
                "scoped object count {scoped_total} below tracked verified count {}",
                known.len()
            ));
        }

        for item in verified.iter().take(SAMPLE_SIZE) {
            match self.store.get(&item.new_key).await {
                Ok(bytes) if bytes.is_empty() => {
                    report.error(format!("verified copy is empty: {}", item.new_key));
                }
                Ok(bytes) => {
                    if let Some(expected) = &item.content_hash {
                        let actual = hash_bytes(&bytes);
                        if &actual != expected {
                            report.error(format!(
                                "verified copy hash drifted: {} expected {expected} got {actual}",
                                item.new_key
                            ));
                        }
                    }
                }
                Err(err) => report.error(format!("sample fetch failed for {}: {err}", item.new_key)),
            }
        }

        self.log(&report, "postflight");
        Ok(report)
    }

    fn log(&self, report: &ValidationReport, phase: &str) {
        if report.ok() {
            tracing::info!(
                target: "rescope",
                event = "validation_complete",
                phase,
                warnings = report.warnings.len(),
            );
        } else {
            tracing::error!(
                target: "rescope",
                event = "validation_failed",
                phase,
                errors = report.errors.len(),
                warnings = report.warnings.len(),
            );
        }
    }
}
