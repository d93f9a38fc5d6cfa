//! In-memory persistence backend.
//!
//! The fallback of last resort: same contract, same serialization and
//! quota behavior as the storage-backed variants, nothing outlives the
//! process.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::entry::CacheEntry;
use crate::clock::Clock;
use crate::error::{PersistError, PersistResult};
use crate::persistence::serialize::{deserialize_entry, serialize_entry, stored_size};
use crate::persistence::PersistenceBackend;

struct Row {
    raw: String,
    size: usize,
    expires_at: u64,
}

/// Persistence backend over a process-local map.
pub struct MemoryPersistence<T> {
    rows: DashMap<String, Row>,
    max_size: usize,
    used: AtomicUsize,
    clock: Arc<dyn Clock>,
    _value: PhantomData<fn() -> T>,
}

impl<T> MemoryPersistence<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a backend bounded to `max_size` bytes (0 = unlimited).
    pub fn new(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: DashMap::new(),
            max_size,
            used: AtomicUsize::new(0),
            clock,
            _value: PhantomData,
        }
    }

    fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<String> = self
            .rows
            .iter()
            .filter(|row| now >= row.value().expires_at)
            .map(|row| row.key().clone())
            .collect();

        let mut reclaimed = 0;
        for key in expired {
            if let Some((_, row)) = self.rows.remove(&key) {
                reclaimed += row.size;
            }
        }
        self.used.fetch_sub(reclaimed.min(self.used.load(Ordering::SeqCst)), Ordering::SeqCst);
        reclaimed
    }

    fn over_quota(&self, incoming: usize, replaced: usize) -> bool {
        if self.max_size == 0 {
            return false;
        }
        self.used.load(Ordering::SeqCst).saturating_sub(replaced) + incoming > self.max_size
    }
}

#[async_trait]
impl<T> PersistenceBackend<T> for MemoryPersistence<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn set(&self, key: &str, entry: &CacheEntry<T>) -> PersistResult<()> {
        let raw = serialize_entry(entry)?;
        let size = stored_size(&raw);
        let replaced = self.rows.get(key).map(|row| row.size).unwrap_or(0);

        if self.over_quota(size, replaced) {
            self.cleanup_expired();
            let replaced = self.rows.get(key).map(|row| row.size).unwrap_or(0);
            if self.over_quota(size, replaced) {
                return Err(PersistError::Quota(format!(
                    "{} bytes needed, {} byte quota",
                    size, self.max_size
                )));
            }
        }

        let old = self.rows.insert(
            key.to_string(),
            Row { raw, size, expires_at: entry.expires_at },
        );
        self.used.fetch_add(size, Ordering::SeqCst);
        if let Some(old) = old {
            self.used.fetch_sub(old.size.min(self.used.load(Ordering::SeqCst)), Ordering::SeqCst);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> PersistResult<Option<CacheEntry<T>>> {
        let now = self.clock.now_ms();

        let expired = match self.rows.get(key) {
            Some(row) => now >= row.expires_at,
            None => return Ok(None),
        };
        if expired {
            if let Some((_, row)) = self.rows.remove(key) {
                self.used
                    .fetch_sub(row.size.min(self.used.load(Ordering::SeqCst)), Ordering::SeqCst);
            }
            return Ok(None);
        }

        let row = match self.rows.get(key) {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(deserialize_entry(&row.raw)?))
    }

    async fn has(&self, key: &str) -> PersistResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> PersistResult<bool> {
        match self.rows.remove(key) {
            Some((_, row)) => {
                self.used
                    .fetch_sub(row.size.min(self.used.load(Ordering::SeqCst)), Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> PersistResult<()> {
        self.rows.clear();
        self.used.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        Ok(self.rows.iter().map(|row| row.key().clone()).collect())
    }

    async fn size(&self) -> PersistResult<usize> {
        Ok(self.used.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn backend() -> (MemoryPersistence<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1000));
        (MemoryPersistence::new(0, clock.clone() as Arc<dyn Clock>), clock)
    }

    #[tokio::test]
    async fn test_round_trip_and_size_accounting() {
        let (p, clock) = backend();
        let entry = CacheEntry::new("v".to_string(), clock.now_ms(), 60_000, 120_000);
        p.set("k", &entry).await.unwrap();

        assert_eq!(p.get("k").await.unwrap().unwrap().data, "v");
        assert!(p.size().await.unwrap() > 0);

        p.delete("k").await.unwrap();
        assert_eq!(p.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_rows_vanish_on_read() {
        let (p, clock) = backend();
        let entry = CacheEntry::new("v".to_string(), clock.now_ms(), 10, 50);
        p.set("k", &entry).await.unwrap();

        clock.advance(50);
        assert!(p.get("k").await.unwrap().is_none());
        assert!(!p.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_enforced_after_cleanup() {
        let clock = Arc::new(ManualClock::new(1000));
        let p: MemoryPersistence<String> =
            MemoryPersistence::new(100, clock.clone() as Arc<dyn Clock>);

        let entry = CacheEntry::new(
            "a value too large for this tiny quota".to_string(),
            clock.now_ms(),
            60_000,
            120_000,
        );
        assert!(matches!(p.set("k", &entry).await, Err(PersistError::Quota(_))));
    }
}
