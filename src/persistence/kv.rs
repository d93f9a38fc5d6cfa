//! String-store backends.
//!
//! [`StringStore`] abstracts a flat namespaced string-to-string store —
//! the durable variant is backed by an embedded sled database, the
//! ephemeral variant by a process-lifetime map. [`StoragePersistence`]
//! layers the persistence contract on top: key prefixing, JSON entry
//! serialization, quota enforcement with an expired-entry cleanup and a
//! single retry when the quota is hit.

use std::marker::PhantomData;
use std::path::Path;
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

/// Flat synchronous string store.
pub trait StringStore: Send + Sync + 'static {
    /// Read a raw value.
    fn get_item(&self, key: &str) -> PersistResult<Option<String>>;
    /// Write a raw value.
    fn set_item(&self, key: &str, value: &str) -> PersistResult<()>;
    /// Remove a raw value.
    fn remove_item(&self, key: &str) -> PersistResult<()>;
    /// All keys in the store, including those of other namespaces.
    fn all_keys(&self) -> PersistResult<Vec<String>>;
    /// Identifier used in logs.
    fn label(&self) -> &'static str;
}

/// Process-lifetime in-memory string store (the ephemeral variant).
#[derive(Default)]
pub struct MemoryStringStore {
    items: DashMap<String, String>,
}

impl MemoryStringStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StringStore for MemoryStringStore {
    fn get_item(&self, key: &str) -> PersistResult<Option<String>> {
        Ok(self.items.get(key).map(|v| v.clone()))
    }

    fn set_item(&self, key: &str, value: &str) -> PersistResult<()> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> PersistResult<()> {
        self.items.remove(key);
        Ok(())
    }

    fn all_keys(&self) -> PersistResult<Vec<String>> {
        Ok(self.items.iter().map(|e| e.key().clone()).collect())
    }

    fn label(&self) -> &'static str {
        "ephemeral"
    }
}

/// Durable string store backed by an embedded sled database.
pub struct SledStringStore {
    db: sled::Db,
}

impl SledStringStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> PersistResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl StringStore for SledStringStore {
    fn get_item(&self, key: &str) -> PersistResult<Option<String>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                let value = String::from_utf8(bytes.to_vec())
                    .map_err(|e| PersistError::Storage(format!("non-utf8 value: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> PersistResult<()> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> PersistResult<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    fn all_keys(&self) -> PersistResult<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.iter() {
            let (key, _) = item?;
            if let Ok(key) = String::from_utf8(key.to_vec()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn label(&self) -> &'static str {
        "durable"
    }
}

/// Persistence contract over a [`StringStore`] with prefixing and quota.
pub struct StoragePersistence<T, S: StringStore> {
    store: Arc<S>,
    prefix: String,
    max_size: usize,
    used: AtomicUsize,
    clock: Arc<dyn Clock>,
    _value: PhantomData<fn() -> T>,
}

impl<T, S> StoragePersistence<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: StringStore,
{
    /// Wrap `store`, namespacing all keys with `prefix` and enforcing
    /// `max_size` bytes (0 = unlimited).
    pub fn new(
        store: Arc<S>,
        prefix: impl Into<String>,
        max_size: usize,
        clock: Arc<dyn Clock>,
    ) -> PersistResult<Self> {
        let persistence = Self {
            store,
            prefix: prefix.into(),
            max_size,
            used: AtomicUsize::new(0),
            clock,
            _value: PhantomData,
        };
        let initial = persistence.scan_used()?;
        persistence.used.store(initial, Ordering::SeqCst);
        Ok(persistence)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn namespaced_keys(&self) -> PersistResult<Vec<String>> {
        Ok(self
            .store
            .all_keys()?
            .into_iter()
            .filter(|k| k.starts_with(&self.prefix))
            .collect())
    }

    fn scan_used(&self) -> PersistResult<usize> {
        let mut total = 0;
        for key in self.namespaced_keys()? {
            if let Some(raw) = self.store.get_item(&key)? {
                total += stored_size(&raw);
            }
        }
        Ok(total)
    }

    /// Delete expired rows in this namespace. Returns bytes reclaimed.
    fn cleanup_expired(&self) -> PersistResult<usize> {
        let now = self.clock.now_ms();
        let mut reclaimed = 0;

        for key in self.namespaced_keys()? {
            let raw = match self.store.get_item(&key)? {
                Some(raw) => raw,
                None => continue,
            };
            match deserialize_entry::<T>(&raw) {
                Ok(entry) if entry.is_expired(now) => {
                    self.store.remove_item(&key)?;
                    reclaimed += stored_size(&raw);
                }
                Ok(_) => {}
                Err(_) => {
                    // Unreadable rows are dead weight in our namespace.
                    self.store.remove_item(&key)?;
                    reclaimed += stored_size(&raw);
                }
            }
        }

        self.used.fetch_sub(reclaimed.min(self.used.load(Ordering::SeqCst)), Ordering::SeqCst);
        Ok(reclaimed)
    }

    fn over_quota(&self, incoming: usize, replaced: usize) -> bool {
        if self.max_size == 0 {
            return false;
        }
        let used = self.used.load(Ordering::SeqCst);
        used.saturating_sub(replaced) + incoming > self.max_size
    }
}

#[async_trait]
impl<T, S> PersistenceBackend<T> for StoragePersistence<T, S>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: StringStore,
{
    async fn set(&self, key: &str, entry: &CacheEntry<T>) -> PersistResult<()> {
        let full = self.full_key(key);
        let raw = serialize_entry(entry)?;
        let size = stored_size(&raw);
        let replaced = self
            .store
            .get_item(&full)?
            .map(|old| stored_size(&old))
            .unwrap_or(0);

        if self.over_quota(size, replaced) {
            let reclaimed = self.cleanup_expired()?;
            log::debug!(
                "{} store quota hit for '{}'; cleanup reclaimed {} bytes",
                self.store.label(),
                key,
                reclaimed
            );
            // The write that triggered cleanup may have replaced a row the
            // cleanup removed; re-read before the retry.
            let replaced = self
                .store
                .get_item(&full)?
                .map(|old| stored_size(&old))
                .unwrap_or(0);
            if self.over_quota(size, replaced) {
                return Err(PersistError::Quota(format!(
                    "{} bytes needed, {} byte quota",
                    size, self.max_size
                )));
            }
        }

        self.store.set_item(&full, &raw)?;
        self.used.fetch_add(size, Ordering::SeqCst);
        self.used.fetch_sub(replaced.min(self.used.load(Ordering::SeqCst)), Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> PersistResult<Option<CacheEntry<T>>> {
        let full = self.full_key(key);
        let raw = match self.store.get_item(&full)? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let entry = match deserialize_entry::<T>(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("dropping unreadable row '{}': {}", key, err);
                self.store.remove_item(&full)?;
                self.used.fetch_sub(
                    stored_size(&raw).min(self.used.load(Ordering::SeqCst)),
                    Ordering::SeqCst,
                );
                return Ok(None);
            }
        };

        if entry.is_expired(self.clock.now_ms()) {
            self.store.remove_item(&full)?;
            self.used.fetch_sub(
                stored_size(&raw).min(self.used.load(Ordering::SeqCst)),
                Ordering::SeqCst,
            );
            return Ok(None);
        }

        Ok(Some(entry))
    }

    async fn has(&self, key: &str) -> PersistResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> PersistResult<bool> {
        let full = self.full_key(key);
        match self.store.get_item(&full)? {
            Some(raw) => {
                self.store.remove_item(&full)?;
                self.used.fetch_sub(
                    stored_size(&raw).min(self.used.load(Ordering::SeqCst)),
                    Ordering::SeqCst,
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> PersistResult<()> {
        for key in self.namespaced_keys()? {
            self.store.remove_item(&key)?;
        }
        self.used.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        Ok(self
            .namespaced_keys()?
            .into_iter()
            .map(|k| k[self.prefix.len()..].to_string())
            .collect())
    }

    async fn size(&self) -> PersistResult<usize> {
        Ok(self.used.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        self.store.label()
    }
}
