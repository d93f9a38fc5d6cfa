//! Bounded in-memory cache with pluggable eviction.
//!
//! The cache enforces two independent bounds (`max_entries`, `max_size`)
//! and evicts in policy order (LRU, LFU, FIFO, or TTL) until both hold
//! after accounting for an incoming entry. Reads on expired slots delete
//! them and report a miss; an optional background sweep removes expired
//! slots between reads. Hit, miss, eviction, and expiration counters are
//! exposed as a snapshot through [`MemoryCache::stats`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::cache::entry::CacheEntry;
use crate::clock::Clock;

/// Eviction order applied when a bound is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the least recently accessed entry first.
    Lru,
    /// Evict the least frequently accessed entry first.
    Lfu,
    /// Evict the oldest insertion first.
    Fifo,
    /// Evict the entry closest to its expiry first.
    Ttl,
}

/// Strategy for estimating the in-memory cost of a value.
pub trait SizeEstimator<T>: Send + Sync {
    /// Approximate size of `value` in bytes.
    fn estimate(&self, value: &T) -> usize;
}

/// Default estimator: serialized JSON length × 2 (UTF-16 code units).
#[derive(Debug, Default, Clone, Copy)]
pub struct SerializedSizeEstimator;

impl<T: Serialize> SizeEstimator<T> for SerializedSizeEstimator {
    fn estimate(&self, value: &T) -> usize {
        serde_json::to_string(value).map(|s| s.len() * 2).unwrap_or(0)
    }
}

/// Memory cache configuration.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries; 0 disables the bound.
    pub max_entries: usize,
    /// Maximum total estimated size in bytes; 0 disables the bound.
    pub max_size: usize,
    /// Eviction order.
    pub eviction_policy: EvictionPolicy,
    /// Interval for the background expired-entry sweep; `None` disables it.
    pub cleanup_interval: Option<Duration>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_size: 0,
            eviction_policy: EvictionPolicy::Lru,
            cleanup_interval: None,
        }
    }
}

/// Bookkeeping attached to each slot.
#[derive(Debug, Clone)]
pub struct SlotMeta {
    /// Insertion time.
    pub created: u64,
    /// Last read time.
    pub last_accessed: u64,
    /// Number of reads.
    pub access_count: u64,
    /// Estimated size at insertion.
    pub size: usize,
    /// Insertion-order tiebreak for eviction.
    pub seq: u64,
}

struct Slot<T> {
    entry: CacheEntry<T>,
    meta: SlotMeta,
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Live entry count.
    pub entry_count: usize,
    /// Sum of estimated entry sizes.
    pub size: usize,
    /// Configured size bound (0 = unlimited).
    pub max_size: usize,
    /// Configured entry bound (0 = unlimited).
    pub max_entries: usize,
    /// Reads served from a live entry.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Entries removed to satisfy a bound.
    pub evictions: u64,
    /// Entries removed because they expired.
    pub expirations: u64,
    /// `hits / (hits + misses)`, 0 when no reads happened.
    pub hit_ratio: f64,
}

struct Inner<T> {
    slots: HashMap<String, Slot<T>>,
    current_size: usize,
    seq: u64,
}

/// Bounded map of fingerprint → entry with eviction and statistics.
pub struct MemoryCache<T> {
    inner: RwLock<Inner<T>>,
    config: MemoryCacheConfig,
    clock: Arc<dyn Clock>,
    estimator: Arc<dyn SizeEstimator<T>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T> MemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a cache with the default size estimator.
    pub fn new(config: MemoryCacheConfig, clock: Arc<dyn Clock>) -> Arc<Self>
    where
        T: Serialize,
    {
        Self::with_estimator(config, clock, Arc::new(SerializedSizeEstimator))
    }

    /// Create a cache with a custom size estimator.
    pub fn with_estimator(
        config: MemoryCacheConfig,
        clock: Arc<dyn Clock>,
        estimator: Arc<dyn SizeEstimator<T>>,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            inner: RwLock::new(Inner { slots: HashMap::new(), current_size: 0, seq: 0 }),
            config,
            clock,
            estimator,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        });

        if let Some(interval) = cache.config.cleanup_interval {
            cache.start_sweeper(interval);
        }

        cache
    }

    fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // immediate first tick is not a sweep
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        let removed = cache.cleanup();
                        if removed > 0 {
                            log::debug!("memory cache sweep removed {} expired entries", removed);
                        }
                    }
                    None => break,
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Insert or replace an entry. Returns the keys evicted to make room.
    ///
    /// Replacing an existing key carries `access_count` and
    /// `revalidation_count` forward when the incoming entry has not set
    /// them itself.
    pub fn set(&self, key: &str, mut entry: CacheEntry<T>) -> Vec<String> {
        let now = self.clock.now_ms();
        let size = self.estimator.estimate(&entry.data);
        let mut inner = self.inner.write();

        let mut prior_access = 0;
        if let Some(old) = inner.slots.remove(key) {
            inner.current_size = inner.current_size.saturating_sub(old.meta.size);
            prior_access = old.meta.access_count;
            if entry.access_count == 0 {
                entry.access_count = old.entry.access_count;
            }
            if entry.revalidation_count == 0 {
                entry.revalidation_count = old.entry.revalidation_count;
            }
        }

        let evicted = self.make_room(&mut inner, size);

        inner.seq += 1;
        let seq = inner.seq;
        inner.current_size += size;
        inner.slots.insert(
            key.to_string(),
            Slot {
                entry,
                meta: SlotMeta {
                    created: now,
                    last_accessed: now,
                    access_count: prior_access,
                    size,
                    seq,
                },
            },
        );

        evicted
    }

    /// Evict in policy order until both bounds hold with `incoming` bytes
    /// about to be added.
    fn make_room(&self, inner: &mut Inner<T>, incoming: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        loop {
            let over_entries =
                self.config.max_entries > 0 && inner.slots.len() + 1 > self.config.max_entries;
            let over_size = self.config.max_size > 0
                && inner.current_size + incoming > self.config.max_size;
            if !over_entries && !over_size {
                break;
            }

            let victim = self.pick_victim(inner);
            match victim {
                Some(key) => {
                    if let Some(slot) = inner.slots.remove(&key) {
                        inner.current_size = inner.current_size.saturating_sub(slot.meta.size);
                    }
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    evicted.push(key);
                }
                None => {
                    // Nothing left to evict; the incoming entry alone
                    // exceeds the size bound.
                    if incoming > self.config.max_size && self.config.max_size > 0 {
                        log::warn!(
                            "entry of {} bytes exceeds the cache size bound of {} bytes",
                            incoming,
                            self.config.max_size
                        );
                    }
                    break;
                }
            }
        }
        evicted
    }

    fn pick_victim(&self, inner: &Inner<T>) -> Option<String> {
        let policy = self.config.eviction_policy;
        inner
            .slots
            .iter()
            .min_by_key(|(_, slot)| {
                let rank = match policy {
                    EvictionPolicy::Lru => slot.meta.last_accessed,
                    EvictionPolicy::Lfu => slot.meta.access_count,
                    EvictionPolicy::Fifo => slot.meta.created,
                    EvictionPolicy::Ttl => slot.entry.expires_at,
                };
                (rank, slot.meta.seq)
            })
            .map(|(key, _)| key.clone())
    }

    /// Read an entry, counting the access. Expired slots are deleted and
    /// reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();

        let expired = match inner.slots.get(key) {
            Some(slot) => slot.entry.is_expired(now),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            if let Some(slot) = inner.slots.remove(key) {
                inner.current_size = inner.current_size.saturating_sub(slot.meta.size);
            }
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let slot = inner.slots.get_mut(key)?;
        slot.meta.last_accessed = now;
        slot.meta.access_count += 1;
        slot.entry.access_count += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(slot.entry.clone())
    }

    /// Read an entry without counting an access or a hit/miss.
    ///
    /// Expired slots are still deleted; expiry is never observable.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<T>> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();

        let expired = inner.slots.get(key)?.entry.is_expired(now);
        if expired {
            if let Some(slot) = inner.slots.remove(key) {
                inner.current_size = inner.current_size.saturating_sub(slot.meta.size);
            }
            self.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        inner.slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Whether a live entry exists. Counts as an access: the slot's
    /// `last_accessed` and `access_count` are refreshed.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Mutate a live entry in place. Returns false when the key is
    /// missing or expired. The slot's size accounting is refreshed.
    pub fn update<F>(&self, key: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut CacheEntry<T>),
    {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();

        let expired = match inner.slots.get(key) {
            Some(slot) => slot.entry.is_expired(now),
            None => return false,
        };
        if expired {
            let size = inner.slots.remove(key).map(|s| s.meta.size).unwrap_or(0);
            inner.current_size = inner.current_size.saturating_sub(size);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let Some(slot) = inner.slots.get_mut(key) else { return false };
        mutate(&mut slot.entry);
        let new_size = self.estimator.estimate(&slot.entry.data);
        let old_size = slot.meta.size;
        slot.meta.size = new_size;
        inner.current_size = inner.current_size.saturating_sub(old_size) + new_size;
        true
    }

    /// Remove an entry. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.slots.remove(key) {
            Some(slot) => {
                inner.current_size = inner.current_size.saturating_sub(slot.meta.size);
                true
            }
            None => false,
        }
    }

    /// Remove all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.slots.clear();
        inner.current_size = 0;
    }

    /// All live keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().slots.keys().cloned().collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.read().slots.is_empty()
    }

    /// Delete every expired slot. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write();

        let expired: Vec<String> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(slot) = inner.slots.remove(key) {
                inner.current_size = inner.current_size.saturating_sub(slot.meta.size);
            }
        }

        self.expirations.fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Snapshot of the current statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entry_count: inner.slots.len(),
            size: inner.current_size,
            max_size: self.config.max_size,
            max_entries: self.config.max_entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_ratio: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }

    /// Metadata snapshot for a live slot, if present.
    pub fn meta(&self, key: &str) -> Option<SlotMeta> {
        self.inner.read().slots.get(key).map(|slot| slot.meta.clone())
    }

    /// Cancel the background sweep task.
    pub fn dispose(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl<T> Drop for MemoryCache<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
