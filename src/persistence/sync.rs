//! Two-way synchronizer between a primary and secondary backend.
//!
//! A sync pass walks the filtered key union: keys present in exactly one
//! backend are copied to the other; keys present in both with different
//! bytes are resolved by the configured strategy and the resolution is
//! written to both sides. Passes are non-reentrant — a call that arrives
//! while one is running returns a zeroed report instead of racing.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::cache::entry::CacheEntry;
use crate::clock::Clock;
use crate::error::PersistResult;
use crate::persistence::serialize::serialize_entry;
use crate::persistence::PersistenceBackend;

/// How to resolve a key present in both backends with different bytes.
#[derive(Clone)]
pub enum ConflictStrategy<T> {
    /// Keep the entry with the larger `created_at`.
    MostRecent,
    /// The primary's copy wins.
    Primary,
    /// The secondary's copy wins.
    Secondary,
    /// Caller-supplied resolution: `(primary, secondary) -> winner`.
    Custom(Arc<dyn Fn(&CacheEntry<T>, &CacheEntry<T>) -> CacheEntry<T> + Send + Sync>),
}

impl<T> fmt::Debug for ConflictStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::MostRecent => f.write_str("MostRecent"),
            ConflictStrategy::Primary => f.write_str("Primary"),
            ConflictStrategy::Secondary => f.write_str("Secondary"),
            ConflictStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Key filter applied before any sync work.
pub type KeyFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Synchronizer configuration.
#[derive(Clone)]
pub struct SyncConfig<T> {
    /// Interval for the periodic full pass; `None` disables it.
    pub interval: Option<Duration>,
    /// Only keys accepted by the filter participate.
    pub key_filter: Option<KeyFilter>,
    /// Conflict resolution.
    pub strategy: ConflictStrategy<T>,
}

impl<T> Default for SyncConfig<T> {
    fn default() -> Self {
        Self { interval: None, key_filter: None, strategy: ConflictStrategy::MostRecent }
    }
}

/// Per-run statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Keys examined.
    pub entries_processed: usize,
    /// Keys copied secondary → primary.
    pub added_to_primary: usize,
    /// Keys copied primary → secondary.
    pub added_to_secondary: usize,
    /// Conflicts resolved and written to both sides.
    pub conflicts_resolved: usize,
    /// Keys that failed to sync.
    pub failures: usize,
    /// Wall time of the pass in milliseconds.
    pub time_taken_ms: u64,
}

/// Keeps a primary and secondary backend converged.
pub struct PersistenceSynchronizer<T> {
    primary: Arc<dyn PersistenceBackend<T>>,
    secondary: Arc<dyn PersistenceBackend<T>>,
    config: SyncConfig<T>,
    dirty: Mutex<HashSet<String>>,
    in_progress: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
}

impl<T> PersistenceSynchronizer<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a synchronizer. Call [`Self::start`] to install the
    /// periodic pass when `config.interval` is set.
    pub fn new(
        primary: Arc<dyn PersistenceBackend<T>>,
        secondary: Arc<dyn PersistenceBackend<T>>,
        config: SyncConfig<T>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            primary,
            secondary,
            config,
            dirty: Mutex::new(HashSet::new()),
            in_progress: AtomicBool::new(false),
            ticker: Mutex::new(None),
            clock,
        })
    }

    /// Install the periodic full pass, if an interval is configured.
    pub fn start(self: &Arc<Self>) {
        let Some(every) = self.config.interval else { return };
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(sync) => {
                        if let Err(err) = sync.sync_all().await {
                            log::warn!("periodic sync pass failed: {}", err);
                        }
                    }
                    None => break,
                }
            }
        });
        *self.ticker.lock() = Some(handle);
    }

    /// Flag a key for the next [`Self::sync_dirty`] pass.
    pub fn mark_for_sync(&self, key: &str) {
        self.dirty.lock().insert(key.to_string());
    }

    /// Number of keys awaiting a dirty sync.
    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Synchronize every filtered key in either backend.
    pub async fn sync_all(&self) -> PersistResult<SyncReport> {
        let mut keys = BTreeSet::new();
        keys.extend(self.primary.keys().await?);
        keys.extend(self.secondary.keys().await?);
        self.sync_keys(keys.into_iter().collect()).await
    }

    /// Synchronize only the keys flagged with [`Self::mark_for_sync`].
    pub async fn sync_dirty(&self) -> PersistResult<SyncReport> {
        let keys: Vec<String> = self.dirty.lock().drain().collect();
        self.sync_keys(keys).await
    }

    async fn sync_keys(&self, keys: Vec<String>) -> PersistResult<SyncReport> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(SyncReport::default());
        }

        let started = self.clock.now_ms();
        let mut report = SyncReport::default();

        for key in keys {
            if let Some(filter) = &self.config.key_filter {
                if !filter(&key) {
                    continue;
                }
            }
            report.entries_processed += 1;
            if let Err(err) = self.sync_one(&key, &mut report).await {
                log::warn!("sync failed for '{}': {}", key, err);
                report.failures += 1;
            }
        }

        report.time_taken_ms = self.clock.now_ms().saturating_sub(started);
        self.in_progress.store(false, Ordering::SeqCst);
        Ok(report)
    }

    async fn sync_one(&self, key: &str, report: &mut SyncReport) -> PersistResult<()> {
        let in_primary = self.primary.get(key).await?;
        let in_secondary = self.secondary.get(key).await?;

        match (in_primary, in_secondary) {
            (Some(entry), None) => {
                self.secondary.set(key, &entry).await?;
                report.added_to_secondary += 1;
            }
            (None, Some(entry)) => {
                self.primary.set(key, &entry).await?;
                report.added_to_primary += 1;
            }
            (Some(p), Some(s)) => {
                if serialize_entry(&p)? == serialize_entry(&s)? {
                    return Ok(());
                }
                let winner = match &self.config.strategy {
                    ConflictStrategy::MostRecent => {
                        if p.created_at >= s.created_at {
                            p
                        } else {
                            s
                        }
                    }
                    ConflictStrategy::Primary => p,
                    ConflictStrategy::Secondary => s,
                    ConflictStrategy::Custom(resolve) => resolve(&p, &s),
                };
                self.primary.set(key, &winner).await?;
                self.secondary.set(key, &winner).await?;
                report.conflicts_resolved += 1;
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Cancel the periodic pass.
    pub fn dispose(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

impl<T> Drop for PersistenceSynchronizer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::memory::MemoryPersistence;

    fn pair() -> (
        Arc<MemoryPersistence<String>>,
        Arc<MemoryPersistence<String>>,
        Arc<ManualClock>,
    ) {
        let clock = Arc::new(ManualClock::new(1000));
        let p = Arc::new(MemoryPersistence::new(0, clock.clone() as Arc<dyn Clock>));
        let s = Arc::new(MemoryPersistence::new(0, clock.clone() as Arc<dyn Clock>));
        (p, s, clock)
    }

    fn entry(data: &str, created: u64) -> CacheEntry<String> {
        CacheEntry::new(data.to_string(), created, 60_000, 120_000)
    }

    #[tokio::test]
    async fn test_one_sided_keys_are_copied() {
        let (p, s, clock) = pair();
        p.set("only-primary", &entry("a", 1000)).await.unwrap();
        s.set("only-secondary", &entry("b", 1000)).await.unwrap();

        let sync = PersistenceSynchronizer::new(
            p.clone() as Arc<dyn PersistenceBackend<String>>,
            s.clone() as Arc<dyn PersistenceBackend<String>>,
            SyncConfig::default(),
            clock.clone() as Arc<dyn Clock>,
        );

        let report = sync.sync_all().await.unwrap();
        assert_eq!(report.entries_processed, 2);
        assert_eq!(report.added_to_primary, 1);
        assert_eq!(report.added_to_secondary, 1);
        assert_eq!(report.conflicts_resolved, 0);

        assert!(p.get("only-secondary").await.unwrap().is_some());
        assert!(s.get("only-primary").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflict_most_recent_wins() {
        let (p, s, clock) = pair();
        p.set("k", &entry("old", 1000)).await.unwrap();
        s.set("k", &entry("new", 2000)).await.unwrap();

        let sync = PersistenceSynchronizer::new(
            p.clone() as Arc<dyn PersistenceBackend<String>>,
            s.clone() as Arc<dyn PersistenceBackend<String>>,
            SyncConfig::default(),
            clock.clone() as Arc<dyn Clock>,
        );

        let report = sync.sync_all().await.unwrap();
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(p.get("k").await.unwrap().unwrap().data, "new");
        assert_eq!(s.get("k").await.unwrap().unwrap().data, "new");
    }

    #[tokio::test]
    async fn test_conflict_primary_strategy() {
        let (p, s, clock) = pair();
        p.set("k", &entry("primary", 1000)).await.unwrap();
        s.set("k", &entry("secondary", 2000)).await.unwrap();

        let sync = PersistenceSynchronizer::new(
            p.clone() as Arc<dyn PersistenceBackend<String>>,
            s.clone() as Arc<dyn PersistenceBackend<String>>,
            SyncConfig { strategy: ConflictStrategy::Primary, ..SyncConfig::default() },
            clock.clone() as Arc<dyn Clock>,
        );

        sync.sync_all().await.unwrap();
        assert_eq!(s.get("k").await.unwrap().unwrap().data, "primary");
    }

    #[tokio::test]
    async fn test_custom_strategy_sees_both_sides() {
        let (p, s, clock) = pair();
        p.set("k", &entry("aa", 1000)).await.unwrap();
        s.set("k", &entry("bbbb", 1000)).await.unwrap();

        let strategy: ConflictStrategy<String> = ConflictStrategy::Custom(Arc::new(|p, s| {
            if p.data.len() >= s.data.len() {
                p.clone()
            } else {
                s.clone()
            }
        }));

        let sync = PersistenceSynchronizer::new(
            p.clone() as Arc<dyn PersistenceBackend<String>>,
            s.clone() as Arc<dyn PersistenceBackend<String>>,
            SyncConfig { strategy, ..SyncConfig::default() },
            clock.clone() as Arc<dyn Clock>,
        );

        sync.sync_all().await.unwrap();
        assert_eq!(p.get("k").await.unwrap().unwrap().data, "bbbb");
    }

    #[tokio::test]
    async fn test_identical_entries_do_not_count_as_conflicts() {
        let (p, s, clock) = pair();
        let e = entry("same", 1000);
        p.set("k", &e).await.unwrap();
        s.set("k", &e).await.unwrap();

        let sync = PersistenceSynchronizer::new(
            p as Arc<dyn PersistenceBackend<String>>,
            s as Arc<dyn PersistenceBackend<String>>,
            SyncConfig::default(),
            clock.clone() as Arc<dyn Clock>,
        );

        let report = sync.sync_all().await.unwrap();
        assert_eq!(report.conflicts_resolved, 0);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn test_key_filter_limits_scope() {
        let (p, s, clock) = pair();
        p.set("users:1", &entry("u", 1000)).await.unwrap();
        p.set("posts:1", &entry("p", 1000)).await.unwrap();

        let config = SyncConfig {
            key_filter: Some(Arc::new(|key: &str| key.starts_with("users:")) as KeyFilter),
            ..SyncConfig::default()
        };
        let sync = PersistenceSynchronizer::new(
            p as Arc<dyn PersistenceBackend<String>>,
            s.clone() as Arc<dyn PersistenceBackend<String>>,
            config,
            clock.clone() as Arc<dyn Clock>,
        );

        let report = sync.sync_all().await.unwrap();
        assert_eq!(report.entries_processed, 1);
        assert!(s.get("users:1").await.unwrap().is_some());
        assert!(s.get("posts:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dirty_sync_only_touches_marked_keys() {
        let (p, s, clock) = pair();
        p.set("marked", &entry("m", 1000)).await.unwrap();
        p.set("unmarked", &entry("u", 1000)).await.unwrap();

        let sync = PersistenceSynchronizer::new(
            p as Arc<dyn PersistenceBackend<String>>,
            s.clone() as Arc<dyn PersistenceBackend<String>>,
            SyncConfig::default(),
            clock.clone() as Arc<dyn Clock>,
        );

        sync.mark_for_sync("marked");
        assert_eq!(sync.dirty_len(), 1);

        let report = sync.sync_dirty().await.unwrap();
        assert_eq!(report.entries_processed, 1);
        assert_eq!(sync.dirty_len(), 0);
        assert!(s.get("marked").await.unwrap().is_some());
        assert!(s.get("unmarked").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reentrant_pass_returns_zeroed_report() {
        let (p, s, clock) = pair();
        let sync = PersistenceSynchronizer::new(
            p as Arc<dyn PersistenceBackend<String>>,
            s as Arc<dyn PersistenceBackend<String>>,
            SyncConfig::default(),
            clock.clone() as Arc<dyn Clock>,
        );

        // Simulate a pass already running.
        sync.in_progress.store(true, Ordering::SeqCst);
        let report = sync.sync_all().await.unwrap();
        assert_eq!(report, SyncReport::default());
        sync.in_progress.store(false, Ordering::SeqCst);
    }
}
