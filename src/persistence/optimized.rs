//! Optimized pass-through persistence.
//!
//! Wraps any backend with an LRU front-cache of live entry objects and
//! write batching: `set` and `delete` record pending operations and
//! schedule a flush after `write_delay`, or flush immediately once
//! `max_pending_writes` accumulate. Reads consult the front-cache, then
//! pending writes, then pending deletes, then the backend. An optional
//! preload warms the front-cache from the backend at startup.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cache::entry::CacheEntry;
use crate::error::PersistResult;
use crate::persistence::PersistenceBackend;

/// Wrapper tuning.
#[derive(Debug, Clone)]
pub struct OptimizedConfig {
    /// Capacity of the front-cache in entries.
    pub front_cache_size: usize,
    /// How long pending writes may wait before a flush.
    pub write_delay: Duration,
    /// Pending-operation count that forces an immediate flush.
    pub max_pending_writes: usize,
    /// Number of keys to preload into the front-cache at startup; 0
    /// disables preloading.
    pub preload_keys: usize,
}

impl Default for OptimizedConfig {
    fn default() -> Self {
        Self {
            front_cache_size: 100,
            write_delay: Duration::from_millis(100),
            max_pending_writes: 50,
            preload_keys: 0,
        }
    }
}

/// LRU front-cache plus batched writes in front of any backend.
pub struct OptimizedPersistence<T> {
    inner: Arc<dyn PersistenceBackend<T>>,
    front: Mutex<LruCache<String, CacheEntry<T>>>,
    pending_writes: Mutex<HashMap<String, CacheEntry<T>>>,
    pending_deletes: Mutex<HashSet<String>>,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    config: OptimizedConfig,
    weak_self: Mutex<Weak<Self>>,
}

impl<T> OptimizedPersistence<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap `inner`. Preloading, when configured, runs in the background.
    pub fn new(inner: Arc<dyn PersistenceBackend<T>>, config: OptimizedConfig) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(config.front_cache_size).unwrap_or(NonZeroUsize::MIN);
        let wrapper = Arc::new(Self {
            inner,
            front: Mutex::new(LruCache::new(capacity)),
            pending_writes: Mutex::new(HashMap::new()),
            pending_deletes: Mutex::new(HashSet::new()),
            flush_timer: Mutex::new(None),
            config,
            weak_self: Mutex::new(Weak::new()),
        });
        *wrapper.weak_self.lock() = Arc::downgrade(&wrapper);

        if wrapper.config.preload_keys > 0 {
            let weak = Arc::downgrade(&wrapper);
            tokio::spawn(async move {
                if let Some(wrapper) = weak.upgrade() {
                    wrapper.preload().await;
                }
            });
        }
        wrapper
    }

    async fn preload(&self) {
        let keys = match self.inner.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                log::debug!("preload key listing failed: {}", err);
                return;
            }
        };

        let mut loaded = 0;
        for key in keys.into_iter().take(self.config.preload_keys) {
            match self.inner.get(&key).await {
                Ok(Some(entry)) => {
                    self.front.lock().put(key, entry);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(err) => log::debug!("preload read failed for '{}': {}", key, err),
            }
        }
        log::debug!("preloaded {} entries into the front cache", loaded);
    }

    fn pending_total(&self) -> usize {
        self.pending_writes.lock().len() + self.pending_deletes.lock().len()
    }

    fn schedule_flush(&self) {
        let mut timer = self.flush_timer.lock();
        if timer.is_some() {
            return;
        }
        let weak = self.weak_self.lock().clone();
        let delay = self.config.write_delay;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(wrapper) = weak.upgrade() {
                *wrapper.flush_timer.lock() = None;
                wrapper.flush().await;
            }
        }));
    }

    /// Drain all pending operations to the backend concurrently.
    ///
    /// Individual failures are logged; a failed write is dropped rather
    /// than retried so one poisoned entry cannot wedge the queue.
    pub async fn flush(&self) {
        let writes: Vec<(String, CacheEntry<T>)> =
            self.pending_writes.lock().drain().collect();
        let deletes: Vec<String> = self.pending_deletes.lock().drain().collect();

        if writes.is_empty() && deletes.is_empty() {
            return;
        }

        let write_ops = writes.into_iter().map(|(key, entry)| {
            let inner = Arc::clone(&self.inner);
            async move {
                if let Err(err) = inner.set(&key, &entry).await {
                    log::warn!("batched write failed for '{}': {}", key, err);
                }
            }
        });
        let delete_ops = deletes.into_iter().map(|key| {
            let inner = Arc::clone(&self.inner);
            async move {
                if let Err(err) = inner.delete(&key).await {
                    log::warn!("batched delete failed for '{}': {}", key, err);
                }
            }
        });

        futures::join!(join_all(write_ops), join_all(delete_ops));
    }

    /// Cancel the flush timer and drain anything still pending.
    pub async fn dispose(&self) {
        if let Some(handle) = self.flush_timer.lock().take() {
            handle.abort();
        }
        self.flush().await;
    }
}

#[async_trait]
impl<T> PersistenceBackend<T> for OptimizedPersistence<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn set(&self, key: &str, entry: &CacheEntry<T>) -> PersistResult<()> {
        self.front.lock().put(key.to_string(), entry.clone());
        self.pending_deletes.lock().remove(key);
        self.pending_writes.lock().insert(key.to_string(), entry.clone());

        if self.pending_total() >= self.config.max_pending_writes {
            self.flush().await;
        } else {
            self.schedule_flush();
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> PersistResult<Option<CacheEntry<T>>> {
        if let Some(entry) = self.front.lock().get(key) {
            return Ok(Some(entry.clone()));
        }
        if let Some(entry) = self.pending_writes.lock().get(key) {
            return Ok(Some(entry.clone()));
        }
        if self.pending_deletes.lock().contains(key) {
            return Ok(None);
        }

        match self.inner.get(key).await? {
            Some(entry) => {
                self.front.lock().put(key.to_string(), entry.clone());
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn has(&self, key: &str) -> PersistResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> PersistResult<bool> {
        let in_front = self.front.lock().pop(key).is_some();
        let was_pending = self.pending_writes.lock().remove(key).is_some();
        let in_backend = self.inner.has(key).await.unwrap_or(false);

        self.pending_deletes.lock().insert(key.to_string());
        if self.pending_total() >= self.config.max_pending_writes {
            self.flush().await;
        } else {
            self.schedule_flush();
        }

        Ok(in_front || was_pending || in_backend)
    }

    async fn clear(&self) -> PersistResult<()> {
        self.front.lock().clear();
        self.pending_writes.lock().clear();
        self.pending_deletes.lock().clear();
        self.inner.clear().await
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        let mut keys: HashSet<String> = self.inner.keys().await?.into_iter().collect();
        for key in self.pending_writes.lock().keys() {
            keys.insert(key.clone());
        }
        for key in self.pending_deletes.lock().iter() {
            keys.remove(key);
        }
        Ok(keys.into_iter().collect())
    }

    async fn size(&self) -> PersistResult<usize> {
        // Pending operations must land before the backend can answer.
        self.flush().await;
        self.inner.size().await
    }

    fn name(&self) -> &'static str {
        "optimized"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::persistence::memory::MemoryPersistence;

    fn wrapped(
        config: OptimizedConfig,
    ) -> (Arc<OptimizedPersistence<String>>, Arc<MemoryPersistence<String>>, Arc<ManualClock>)
    {
        let clock = Arc::new(ManualClock::new(1000));
        let inner = Arc::new(MemoryPersistence::new(0, clock.clone() as Arc<dyn Clock>));
        let wrapper = OptimizedPersistence::new(
            inner.clone() as Arc<dyn PersistenceBackend<String>>,
            config,
        );
        (wrapper, inner, clock)
    }

    fn entry(data: &str) -> CacheEntry<String> {
        CacheEntry::new(data.to_string(), 1000, 60_000, 120_000)
    }

    #[tokio::test]
    async fn test_read_your_own_pending_write() {
        let (wrapper, inner, _clock) = wrapped(OptimizedConfig {
            write_delay: Duration::from_secs(60),
            ..OptimizedConfig::default()
        });

        wrapper.set("k", &entry("v")).await.unwrap();
        // Not flushed yet.
        assert!(inner.get("k").await.unwrap().is_none());
        // But visible through the wrapper.
        assert_eq!(wrapper.get("k").await.unwrap().unwrap().data, "v");
    }

    #[tokio::test]
    async fn test_delayed_flush_lands_writes() {
        let (wrapper, inner, _clock) = wrapped(OptimizedConfig {
            write_delay: Duration::from_millis(20),
            ..OptimizedConfig::default()
        });

        wrapper.set("k", &entry("v")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(inner.get("k").await.unwrap().unwrap().data, "v");
        assert!(wrapper.pending_writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_max_pending_forces_immediate_flush() {
        let (wrapper, inner, _clock) = wrapped(OptimizedConfig {
            write_delay: Duration::from_secs(60),
            max_pending_writes: 3,
            ..OptimizedConfig::default()
        });

        wrapper.set("a", &entry("1")).await.unwrap();
        wrapper.set("b", &entry("2")).await.unwrap();
        assert!(inner.get("a").await.unwrap().is_none());

        wrapper.set("c", &entry("3")).await.unwrap();
        assert!(inner.get("a").await.unwrap().is_some());
        assert!(inner.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_delete_masks_backend_copy() {
        let (wrapper, inner, _clock) = wrapped(OptimizedConfig {
            write_delay: Duration::from_secs(60),
            ..OptimizedConfig::default()
        });

        inner.set("k", &entry("v")).await.unwrap();
        assert!(wrapper.delete("k").await.unwrap());

        assert!(wrapper.get("k").await.unwrap().is_none());
        // The backend still holds it until the flush.
        assert!(inner.get("k").await.unwrap().is_some());

        wrapper.flush().await;
        assert!(inner.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_size_flushes_first() {
        let (wrapper, _inner, _clock) = wrapped(OptimizedConfig {
            write_delay: Duration::from_secs(60),
            ..OptimizedConfig::default()
        });

        wrapper.set("k", &entry("v")).await.unwrap();
        let size = wrapper.size().await.unwrap();
        assert!(size > 0);
        assert!(wrapper.pending_writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_front_cache_bounded() {
        let (wrapper, _inner, _clock) = wrapped(OptimizedConfig {
            front_cache_size: 2,
            write_delay: Duration::from_secs(60),
            max_pending_writes: 1000,
            ..OptimizedConfig::default()
        });

        wrapper.set("a", &entry("1")).await.unwrap();
        wrapper.set("b", &entry("2")).await.unwrap();
        wrapper.set("c", &entry("3")).await.unwrap();

        assert_eq!(wrapper.front.lock().len(), 2);
        // Everything stays readable through pending writes.
        assert!(wrapper.get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keys_reflect_pending_state() {
        let (wrapper, inner, _clock) = wrapped(OptimizedConfig {
            write_delay: Duration::from_secs(60),
            ..OptimizedConfig::default()
        });

        inner.set("backend-only", &entry("b")).await.unwrap();
        wrapper.set("pending", &entry("p")).await.unwrap();
        wrapper.delete("backend-only").await.unwrap();

        let mut keys = wrapper.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["pending".to_string()]);
    }

    #[tokio::test]
    async fn test_preload_warms_front_cache() {
        let clock = Arc::new(ManualClock::new(1000));
        let inner = Arc::new(MemoryPersistence::new(0, clock.clone() as Arc<dyn Clock>));
        inner.set("a", &entry("1")).await.unwrap();
        inner.set("b", &entry("2")).await.unwrap();

        let wrapper = OptimizedPersistence::new(
            inner.clone() as Arc<dyn PersistenceBackend<String>>,
            OptimizedConfig { preload_keys: 10, ..OptimizedConfig::default() },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(wrapper.front.lock().len(), 2);
    }
}
