use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::keys::{self, LEGACY_PREFIX};
use crate::store::{ObjectStore, OwnerLookup};
use crate::tracker::CandidateItem;
use crate::AppResult;

const ORPHAN_SAMPLE_LIMIT: usize = 20;

/// Outcome of one discovery pass over the legacy prefix.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub candidates: Vec<CandidateItem>,
    pub orphan_count: i64,
    pub orphan_sample: Vec<String>,
    pub malformed_count: i64,
    pub already_migrated: i64,
    /// Scoped targets planned by more than one legacy key. Never migrated;
    /// preflight turns these into a validation error.
    pub duplicate_targets: Vec<String>,
}

/// Enumerates legacy objects and resolves their owners. Discovery is
/// restartable: a crashed run simply replays the enumeration and relies on
/// the verified-key set for idempotent skips.
pub struct DiscoveryScanner {
    store: Arc<dyn ObjectStore>,
    owners: Arc<dyn OwnerLookup>,
}

impl DiscoveryScanner {
    pub fn new(store: Arc<dyn ObjectStore>, owners: Arc<dyn OwnerLookup>) -> Self {
        Self { store, owners }
    }

    pub async fn discover(&self, verified_new_keys: &HashSet<String>) -> AppResult<DiscoveryReport> {
        let mut report = DiscoveryReport::default();
        let mut planned_targets: HashMap<String, String> = HashMap::new();
        let mut token: Option<String> = None;

        loop {
            let page = self.store.list(LEGACY_PREFIX, token.as_deref()).await?;
            for key in &page.keys {
                if !keys::is_legacy_key(key) {
                    report.malformed_count += 1;
                    tracing::warn!(
                        target: "rescope",
                        event = "discovery_malformed_key",
                        key = %key,
                    );
                    continue;
                }

                let owner_id = match self.owners.owner_for_legacy_key(key).await? {
                    Some(owner) => owner,
                    None => {
                        report.orphan_count += 1;
                        if report.orphan_sample.len() < ORPHAN_SAMPLE_LIMIT {
                            report.orphan_sample.push(key.clone());
                        }
                        tracing::warn!(
                            target: "rescope",
                            event = "discovery_orphan",
                            key = %key,
                        );
                        continue;
                    }
                };

                let new_key = keys::to_scoped_key(key, &owner_id)?;
                if verified_new_keys.contains(&new_key) {
                    report.already_migrated += 1;
                    continue;
                }

                if let Some(previous) = planned_targets.insert(new_key.clone(), key.clone()) {
                    tracing::error!(
                        target: "rescope",
                        event = "discovery_duplicate_target",
                        new_key = %new_key,
                        first = %previous,
                        second = %key,
                    );
                    report.duplicate_targets.push(new_key.clone());
                    continue;
                }

                report.candidates.push(CandidateItem {
                    old_key: key.clone(),
                    new_key,
                    owner_id,
                    size_bytes: 0,
                });
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        tracing::info!(
            target: "rescope",
            event = "discovery_complete",
            candidates = report.candidates.len(),
            orphans = report.orphan_count,
            malformed = report.malformed_count,
            already_migrated = report.already_migrated,
        );
        Ok(report)
    }
}
