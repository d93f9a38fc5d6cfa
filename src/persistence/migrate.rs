//! Bulk migration between persistence backends.
//!
//! Copies filtered keys in batches, optionally deleting each key from
//! the source after a successful copy, and can verify afterwards that
//! every key landed byte-identical in the target.

use std::sync::Arc;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PersistResult;
use crate::persistence::serialize::serialize_entry;
use crate::persistence::PersistenceBackend;

/// Migration tuning.
#[derive(Clone)]
pub struct MigrationOptions {
    /// Keys copied concurrently per batch.
    pub batch_size: usize,
    /// Remove each key from the source after it lands in the target.
    pub delete_source: bool,
    /// Overwrite keys that already exist in the target.
    pub overwrite: bool,
    /// Only keys accepted by the filter migrate.
    pub key_filter: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self { batch_size: 50, delete_source: false, overwrite: true, key_filter: None }
    }
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Keys considered after filtering.
    pub total_keys: usize,
    /// Keys copied successfully.
    pub migrated_count: usize,
    /// Keys that failed to copy.
    pub failed_count: usize,
    /// The failing keys.
    pub failed_keys: Vec<String>,
}

/// Outcome of a verification run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    /// Whether every checked key matched.
    pub success: bool,
    /// Keys present in the source but absent from the target.
    pub missing_in_target: Vec<String>,
    /// Keys whose serialized bytes differ between the stores.
    pub mismatched: Vec<String>,
    /// Keys compared.
    pub checked: usize,
}

/// Copy filtered keys from `source` to `target` in batches.
pub async fn migrate<T>(
    source: &Arc<dyn PersistenceBackend<T>>,
    target: &Arc<dyn PersistenceBackend<T>>,
    options: &MigrationOptions,
) -> PersistResult<MigrationReport>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut keys = source.keys().await?;
    if let Some(filter) = &options.key_filter {
        keys.retain(|key| filter(key));
    }

    let mut report = MigrationReport { total_keys: keys.len(), ..MigrationReport::default() };
    let batch_size = options.batch_size.max(1);

    for batch in keys.chunks(batch_size) {
        let outcomes = join_all(batch.iter().map(|key| {
            let source = Arc::clone(source);
            let target = Arc::clone(target);
            let options = options.clone();
            let key = key.clone();
            async move {
                let ok = migrate_one(&source, &target, &key, &options).await;
                (key, ok)
            }
        }))
        .await;

        for (key, ok) in outcomes {
            if ok {
                report.migrated_count += 1;
            } else {
                report.failed_count += 1;
                report.failed_keys.push(key);
            }
        }
    }

    log::info!(
        "migration complete: {}/{} keys copied, {} failed",
        report.migrated_count,
        report.total_keys,
        report.failed_count
    );
    Ok(report)
}

async fn migrate_one<T>(
    source: &Arc<dyn PersistenceBackend<T>>,
    target: &Arc<dyn PersistenceBackend<T>>,
    key: &str,
    options: &MigrationOptions,
) -> bool
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let entry = match source.get(key).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return false, // expired between listing and copy
        Err(err) => {
            log::warn!("migration read failed for '{}': {}", key, err);
            return false;
        }
    };

    if !options.overwrite {
        match target.has(key).await {
            Ok(true) => return true, // already present, counts as migrated
            Ok(false) => {}
            Err(err) => {
                log::warn!("migration existence check failed for '{}': {}", key, err);
                return false;
            }
        }
    }

    if let Err(err) = target.set(key, &entry).await {
        log::warn!("migration write failed for '{}': {}", key, err);
        return false;
    }

    if options.delete_source {
        if let Err(err) = source.delete(key).await {
            log::warn!("migration source delete failed for '{}': {}", key, err);
        }
    }
    true
}

/// Cross-check that `target` holds a byte-identical copy of every
/// filtered key in `source`.
pub async fn verify_migration<T>(
    source: &Arc<dyn PersistenceBackend<T>>,
    target: &Arc<dyn PersistenceBackend<T>>,
    key_filter: Option<&(dyn Fn(&str) -> bool + Send + Sync)>,
) -> PersistResult<VerificationReport>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut keys = source.keys().await?;
    if let Some(filter) = key_filter {
        keys.retain(|key| filter(key));
    }

    let mut report = VerificationReport { success: true, ..VerificationReport::default() };

    for key in keys {
        let from_source = source.get(&key).await?;
        let from_target = target.get(&key).await?;
        report.checked += 1;

        match (from_source, from_target) {
            (Some(s), Some(t)) => {
                if serialize_entry(&s)? != serialize_entry(&t)? {
                    report.mismatched.push(key);
                    report.success = false;
                }
            }
            (Some(_), None) => {
                report.missing_in_target.push(key);
                report.success = false;
            }
            // The source row expired between listing and read; nothing
            // to compare.
            (None, _) => {}
        }
    }

    Ok(report)
}
