//! Cache warming.
//!
//! A warming record keeps one fingerprint fresh with a recurring SWR
//! read: an immediate warm on registration, then one on every tick of
//! its interval. Registering a fingerprint replaces any existing record;
//! `clear` on the manager discards all records before clearing the
//! cache.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;

use crate::cache::manager::{CacheManager, FetchFn};
use crate::cache::options::SwrOverrides;
use crate::events::CacheEvent;

/// One registered warming task.
pub struct WarmingRecord<T> {
    pub(crate) fetch: FetchFn<T>,
    pub(crate) overrides: SwrOverrides<T>,
    pub(crate) handle: JoinHandle<()>,
}

impl<T> CacheManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Keep `key` warm: warm it now, then every warming interval.
    ///
    /// A prior record for the fingerprint is cancelled and replaced.
    pub fn register_cache_warming(
        self: &Arc<Self>,
        key: &str,
        fetch: FetchFn<T>,
        overrides: &SwrOverrides<T>,
    ) {
        self.unregister_cache_warming(key);

        let interval = self.defaults.merge(overrides).warming_interval;
        let weak: Weak<Self> = Arc::downgrade(self);
        let owned_key = key.to_string();
        let task_fetch = Arc::clone(&fetch);
        // The warming tick must not re-register itself through the
        // warm_cache option.
        let mut task_overrides = overrides.clone();
        task_overrides.warm_cache = Some(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                // The first tick completes immediately: that is the
                // registration-time warm.
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                match manager
                    .swr_with(&owned_key, Arc::clone(&task_fetch), &task_overrides)
                    .await
                {
                    Ok(_) => {
                        manager.events.emit(&CacheEvent::WarmRefresh { key: owned_key.clone() });
                    }
                    Err(err) => {
                        log::debug!("cache warming failed for '{}': {}", owned_key, err);
                    }
                }
            }
        });

        self.warmers.insert(
            key.to_string(),
            WarmingRecord { fetch, overrides: overrides.clone(), handle },
        );
        self.events.emit(&CacheEvent::WarmRegister { key: key.to_string() });
    }

    /// Cancel the warming record for `key`. Returns whether one existed.
    pub fn unregister_cache_warming(&self, key: &str) -> bool {
        match self.warmers.remove(key) {
            Some((_, record)) => {
                record.handle.abort();
                self.events.emit(&CacheEvent::WarmUnregister { key: key.to_string() });
                true
            }
            None => false,
        }
    }

    /// Fingerprints currently kept warm.
    pub fn warmed_keys(&self) -> Vec<String> {
        self.warmers.iter().map(|record| record.key().clone()).collect()
    }

    /// Trigger one out-of-cycle warm for a registered fingerprint,
    /// using its stored fetch closure and options. Returns whether a
    /// record existed.
    pub fn rewarm(self: &Arc<Self>, key: &str) -> bool {
        let (fetch, overrides) = match self.warmers.get(key) {
            Some(record) => (Arc::clone(&record.fetch), record.overrides.clone()),
            None => return false,
        };

        let manager = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            match manager.swr_with(&key, fetch, &overrides).await {
                Ok(_) => manager.events.emit(&CacheEvent::WarmRefresh { key }),
                Err(err) => log::debug!("rewarm failed for '{}': {}", key, err),
            }
        });
        true
    }

    /// Cancel and discard every warming record.
    pub(crate) fn clear_warming(&self) {
        let keys: Vec<String> = self.warmers.iter().map(|r| r.key().clone()).collect();
        for key in keys {
            self.unregister_cache_warming(&key);
        }
    }
}
