//! Stale-While-Revalidate cache manager.
//!
//! Sits on the memory cache and the request deduper: fresh entries are
//! served directly, stale entries are served immediately while a
//! background revalidation refreshes them, and misses fetch in the
//! foreground with timeout, validation, and dedupe. Writes optionally
//! mirror into a persistence backend. Invalidation, warming, and the
//! revalidation machinery live in the sibling modules and share this
//! struct.

use std::collections::BinaryHeap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::dedupe::RequestDeduper;
use crate::cache::entry::CacheEntry;
use crate::cache::invalidate::GroupTarget;
use crate::cache::memory::{CacheStats, MemoryCache, MemoryCacheConfig};
use crate::cache::options::{SwrOptions, SwrOverrides};
use crate::cache::revalidate::QueueItem;
use crate::cache::warm::WarmingRecord;
use crate::clock::Clock;
use crate::error::{FetchError, FetchResult};
use crate::events::{CacheEvent, EventBus};
use crate::persistence::PersistenceBackend;

/// Boxed fetch future.
pub type FetchFuture<T> = BoxFuture<'static, FetchResult<T>>;

/// Shareable fetch closure.
pub type FetchFn<T> = Arc<dyn Fn() -> FetchFuture<T> + Send + Sync>;

/// Hook invoked with the fingerprint and pre-delete entry snapshot.
pub type InvalidationHook<T> = Arc<dyn Fn(&str, &CacheEntry<T>) + Send + Sync>;

/// Cache manager construction parameters.
#[derive(Debug, Clone)]
pub struct CacheManagerConfig<T> {
    /// Memory-cache bounds and eviction.
    pub memory: MemoryCacheConfig,
    /// Global SWR defaults, merged with per-call overrides.
    pub defaults: SwrOptions<T>,
    /// Polling interval of the revalidation-queue drainer.
    pub drain_interval: Duration,
}

impl<T> Default for CacheManagerConfig<T> {
    fn default() -> Self {
        Self {
            memory: MemoryCacheConfig::default(),
            defaults: SwrOptions::default(),
            drain_interval: Duration::from_millis(50),
        }
    }
}

/// SWR engine over one memory cache.
pub struct CacheManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) cache: Arc<MemoryCache<T>>,
    pub(crate) deduper: RequestDeduper<T>,
    pub(crate) events: Arc<EventBus<T>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) defaults: SwrOptions<T>,
    pub(crate) persistence: Option<Arc<dyn PersistenceBackend<T>>>,

    // Revalidation machinery (see revalidate.rs).
    pub(crate) revalidations: Arc<DashMap<String, ()>>,
    pub(crate) last_revalidated: Arc<DashMap<String, u64>>,
    pub(crate) debouncers: Arc<DashMap<String, JoinHandle<()>>>,
    pub(crate) queue: Arc<Mutex<BinaryHeap<QueueItem<T>>>>,
    pub(crate) queue_seq: AtomicU64,
    pub(crate) drainer: Mutex<Option<JoinHandle<()>>>,

    // Warming registry (see warm.rs).
    pub(crate) warmers: Arc<DashMap<String, WarmingRecord<T>>>,

    // Invalidation hooks and groups (see invalidate.rs).
    pub(crate) hooks: Arc<RwLock<Vec<(Uuid, InvalidationHook<T>)>>>,
    pub(crate) groups: Arc<DashMap<String, Vec<GroupTarget>>>,
}

impl<T> CacheManager<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    /// Create a manager with no persistence mirror.
    pub fn new(config: CacheManagerConfig<T>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::build(config, clock, None)
    }

    /// Create a manager mirroring writes into `persistence`.
    pub fn with_persistence(
        config: CacheManagerConfig<T>,
        clock: Arc<dyn Clock>,
        persistence: Arc<dyn PersistenceBackend<T>>,
    ) -> Arc<Self> {
        Self::build(config, clock, Some(persistence))
    }

    fn build(
        config: CacheManagerConfig<T>,
        clock: Arc<dyn Clock>,
        persistence: Option<Arc<dyn PersistenceBackend<T>>>,
    ) -> Arc<Self> {
        let cache = MemoryCache::new(config.memory, Arc::clone(&clock));
        let manager = Arc::new(Self {
            cache,
            deduper: RequestDeduper::new(),
            events: Arc::new(EventBus::new()),
            clock,
            defaults: config.defaults,
            persistence,
            revalidations: Arc::new(DashMap::new()),
            last_revalidated: Arc::new(DashMap::new()),
            debouncers: Arc::new(DashMap::new()),
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            queue_seq: AtomicU64::new(0),
            drainer: Mutex::new(None),
            warmers: Arc::new(DashMap::new()),
            hooks: Arc::new(RwLock::new(Vec::new())),
            groups: Arc::new(DashMap::new()),
        });
        manager.start_drainer(config.drain_interval);
        manager
    }
}

impl<T> CacheManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The manager's event bus.
    pub fn events(&self) -> Arc<EventBus<T>> {
        Arc::clone(&self.events)
    }

    /// Stale-while-revalidate read for `key`.
    ///
    /// Fresh entries return immediately. Stale entries return immediately
    /// and, when allowed, schedule a background revalidation. Misses
    /// fetch in the foreground, coalesced with concurrent calls for the
    /// same fingerprint.
    pub async fn swr<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        fetch: F,
        overrides: &SwrOverrides<T>,
    ) -> FetchResult<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = FetchResult<T>> + Send + 'static,
    {
        let fetch: FetchFn<T> = Arc::new(move || fetch().boxed());
        self.swr_with(key, fetch, overrides).await
    }

    /// [`Self::swr`] with a pre-built fetch closure.
    pub async fn swr_with(
        self: &Arc<Self>,
        key: &str,
        fetch: FetchFn<T>,
        overrides: &SwrOverrides<T>,
    ) -> FetchResult<T> {
        let opts = self.defaults.merge(overrides);
        let key = overrides.cache_key.clone().unwrap_or_else(|| key.to_string());
        let now = self.clock.now_ms();

        if opts.warm_cache && !self.warmers.contains_key(&key) {
            self.register_cache_warming(&key, Arc::clone(&fetch), overrides);
        }

        if let Some(entry) = self.cache.get(&key) {
            let rejected = opts.validator.as_ref().map_or(false, |v| !v(&entry.data));
            if rejected {
                log::debug!("validator rejected cached entry for '{}'", key);
                self.cache.delete(&key);
                // Fall through to the miss path.
            } else if entry.is_fresh(now) {
                self.events.emit(&CacheEvent::CacheHit { key: key.clone(), stale: false });
                return Ok(entry.data);
            } else {
                // Stale but usable: serve it, refresh behind the caller.
                if opts.revalidate && opts.fetch_allowed() {
                    self.schedule_revalidation(&key, Arc::clone(&fetch), opts.clone());
                }
                self.events.emit(&CacheEvent::CacheHit { key: key.clone(), stale: true });
                return Ok(entry.data);
            }
        }

        self.events.emit(&CacheEvent::CacheMiss { key: key.clone() });

        if !opts.fetch_allowed() {
            return Err(FetchError::ConditionUnmet(key));
        }

        self.events.emit(&CacheEvent::RequestStart { key: key.clone() });
        let result = self.foreground_fetch(&key, fetch, &opts).await;

        match result {
            Ok(data) => {
                self.events.emit(&CacheEvent::RequestSuccess { key: key.clone() });
                self.events.emit(&CacheEvent::RequestComplete { key });
                Ok(data)
            }
            Err(error) => {
                self.events
                    .emit(&CacheEvent::RequestError { key: key.clone(), error: error.clone() });
                self.events.emit(&CacheEvent::RequestComplete { key: key.clone() });

                // A concurrent writer may have landed an entry while the
                // fetch was failing; stale data beats an error.
                if let Some(stale) = self.cache.get(&key) {
                    self.cache.update(&key, |e| {
                        e.is_revalidating = false;
                        e.last_error = Some(error.to_string());
                    });
                    return Ok(stale.data);
                }
                Err(error)
            }
        }
    }

    /// Foreground fetch: dedupe, timeout, validate, insert.
    pub(crate) async fn foreground_fetch(
        self: &Arc<Self>,
        key: &str,
        fetch: FetchFn<T>,
        opts: &SwrOptions<T>,
    ) -> FetchResult<T> {
        let manager = Arc::clone(self);
        let opts = opts.clone();
        let owned_key = key.to_string();

        self.deduper
            .dedupe(key, move || {
                async move {
                    let data = manager.run_guarded(&fetch, &opts).await?;
                    if let Some(validator) = &opts.validator {
                        if !validator(&data) {
                            return Err(FetchError::Validation(format!(
                                "fetched data rejected for '{}'",
                                owned_key
                            )));
                        }
                    }
                    manager.store(&owned_key, data.clone(), &opts);
                    Ok(data)
                }
                .boxed()
            })
            .await
    }

    /// Force a fetch regardless of freshness, storing the result.
    ///
    /// Used by queries to implement `refetch`. Failures propagate; any
    /// existing entry is left untouched.
    pub async fn refresh(
        self: &Arc<Self>,
        key: &str,
        fetch: FetchFn<T>,
        overrides: &SwrOverrides<T>,
    ) -> FetchResult<T> {
        let opts = self.defaults.merge(overrides);
        let key = overrides.cache_key.clone().unwrap_or_else(|| key.to_string());

        self.events.emit(&CacheEvent::RequestStart { key: key.clone() });
        let result = self.foreground_fetch(&key, fetch, &opts).await;
        match &result {
            Ok(_) => self.events.emit(&CacheEvent::RequestSuccess { key: key.clone() }),
            Err(error) => self
                .events
                .emit(&CacheEvent::RequestError { key: key.clone(), error: error.clone() }),
        }
        self.events.emit(&CacheEvent::RequestComplete { key });
        result
    }

    /// Run one fetch attempt raced against the configured timeout and,
    /// when present, the external cancel signal.
    pub(crate) async fn run_guarded(
        &self,
        fetch: &FetchFn<T>,
        opts: &SwrOptions<T>,
    ) -> FetchResult<T> {
        let timeout = opts.timeout;
        let guarded = async {
            if timeout.is_zero() {
                return fetch().await;
            }
            match tokio::time::timeout(timeout, fetch()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(timeout.as_millis() as u64)),
            }
        };

        match &opts.cancel {
            Some(cancel) => {
                tokio::select! {
                    result = guarded => result,
                    _ = cancel.notified() => Err(FetchError::Cancelled),
                }
            }
            None => guarded.await,
        }
    }

    /// Insert `data` for `key` under the merged options.
    pub fn set(&self, key: &str, data: T, overrides: &SwrOverrides<T>) {
        let opts = self.defaults.merge(overrides);
        let key = overrides.cache_key.clone().unwrap_or_else(|| key.to_string());
        self.store(&key, data, &opts);
    }

    pub(crate) fn store(&self, key: &str, data: T, opts: &SwrOptions<T>) {
        let now = self.clock.now_ms();
        let entry = CacheEntry::new(
            data,
            now,
            opts.stale_time.as_millis() as u64,
            opts.cache_time.as_millis() as u64,
        );
        self.store_entry(key, entry);
    }

    /// Insert a fully-formed entry, emitting set/evict events and
    /// mirroring to persistence.
    pub(crate) fn store_entry(&self, key: &str, entry: CacheEntry<T>) {
        let mirrored = entry.clone();
        let evicted = self.cache.set(key, entry);
        for victim in evicted {
            self.events.emit(&CacheEvent::CacheEvict { key: victim });
        }
        self.events.emit(&CacheEvent::CacheSet { key: key.to_string() });
        self.mirror_set(key, mirrored);
    }

    fn mirror_set(&self, key: &str, entry: CacheEntry<T>) {
        let Some(persistence) = &self.persistence else { return };
        let persistence = Arc::clone(persistence);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(err) = persistence.set(&key, &entry).await {
                log::debug!("persistence mirror failed for '{}': {}", key, err);
            }
        });
    }

    pub(crate) fn mirror_delete(&self, key: &str) {
        let Some(persistence) = &self.persistence else { return };
        let persistence = Arc::clone(persistence);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(err) = persistence.delete(&key).await {
                log::debug!("persistence delete failed for '{}': {}", key, err);
            }
        });
    }

    /// Inspect an entry without counting an access.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<T>> {
        self.cache.peek(key)
    }

    /// Whether a live entry exists (counts as an access).
    pub fn has(&self, key: &str) -> bool {
        self.cache.has(key)
    }

    /// Remove an entry without invalidation semantics.
    pub fn delete(&self, key: &str) -> bool {
        let existed = self.cache.delete(key);
        if existed {
            self.mirror_delete(key);
        }
        existed
    }

    /// All live fingerprints.
    pub fn keys(&self) -> Vec<String> {
        self.cache.keys()
    }

    /// Memory-cache statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Publish the current statistics through the event bus.
    pub fn emit_stats(&self) {
        self.events.emit(&CacheEvent::CacheStatsSnapshot { stats: self.cache.stats() });
    }

    /// Cancel all warming, drop queued revalidations, and clear the
    /// cache and its persistence mirror.
    pub async fn clear(&self) {
        self.clear_warming();
        self.queue.lock().clear();
        for timer in self.debouncers.iter() {
            timer.value().abort();
        }
        self.debouncers.clear();

        self.cache.clear();
        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.clear().await {
                log::debug!("persistence clear failed: {}", err);
            }
        }
        self.events.emit(&CacheEvent::Debug { message: "cache cleared".to_string() });
    }

    /// Tear down every background task this manager installed.
    pub fn dispose(&self) {
        if let Some(handle) = self.drainer.lock().take() {
            handle.abort();
        }
        for timer in self.debouncers.iter() {
            timer.value().abort();
        }
        self.debouncers.clear();
        self.clear_warming();
        self.cache.dispose();
        self.deduper.clear_in_flight_requests();
    }

    /// Number of fetches currently coalesced by the deduper.
    pub fn in_flight_count(&self) -> usize {
        self.deduper.in_flight_count()
    }
}

impl<T> Drop for CacheManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(handle) = self.drainer.lock().take() {
            handle.abort();
        }
        for timer in self.debouncers.iter() {
            timer.value().abort();
        }
        for warmer in self.warmers.iter() {
            warmer.value().handle.abort();
        }
    }
}
