//! Indexed durable backend.
//!
//! Backed by an embedded sled database with two trees: the entry tree
//! maps the prefixed key to a row `{key, value, size, expires_at}`, and
//! the expiry tree orders the same rows by expiry instant
//! (big-endian timestamp ‖ key) so expired rows can be removed with one
//! range scan instead of a full walk. Reads transparently delete and
//! miss on expired rows.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::entry::CacheEntry;
use crate::clock::Clock;
use crate::error::{PersistError, PersistResult};
use crate::persistence::serialize::{deserialize_entry, serialize_entry, stored_size};
use crate::persistence::PersistenceBackend;

/// One stored row in the entry tree.
#[derive(Debug, Serialize, Deserialize)]
struct IndexedRow {
    key: String,
    value: String,
    size: usize,
    expires_at: u64,
}

fn expiry_index_key(expires_at: u64, full_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + full_key.len());
    key.extend_from_slice(&expires_at.to_be_bytes());
    key.extend_from_slice(full_key.as_bytes());
    key
}

/// Durable backend with an expiry-ordered secondary index.
pub struct IndexedPersistence<T> {
    entries: sled::Tree,
    expiry: sled::Tree,
    prefix: String,
    max_size: usize,
    used: AtomicUsize,
    clock: Arc<dyn Clock>,
    _value: PhantomData<fn() -> T>,
}

impl<T> IndexedPersistence<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open (or create) the database at `path`, using `store_name` for
    /// the entry tree.
    pub fn open(
        path: &Path,
        store_name: &str,
        prefix: impl Into<String>,
        max_size: usize,
        clock: Arc<dyn Clock>,
    ) -> PersistResult<Self> {
        let db = sled::open(path)?;
        let entries = db.open_tree(store_name)?;
        let expiry = db.open_tree(format!("{}_expiry", store_name))?;

        let persistence = Self {
            entries,
            expiry,
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

    fn scan_used(&self) -> PersistResult<usize> {
        let mut total = 0;
        for item in self.entries.iter() {
            let (_, value) = item?;
            if let Ok(row) = serde_json::from_slice::<IndexedRow>(&value) {
                total += row.size;
            }
        }
        Ok(total)
    }

    fn read_row(&self, full_key: &str) -> PersistResult<Option<IndexedRow>> {
        match self.entries.get(full_key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove_row(&self, full_key: &str, row: &IndexedRow) -> PersistResult<()> {
        self.entries.remove(full_key.as_bytes())?;
        self.expiry.remove(expiry_index_key(row.expires_at, full_key))?;
        self.used.fetch_sub(row.size.min(self.used.load(Ordering::SeqCst)), Ordering::SeqCst);
        Ok(())
    }

    /// Remove every row whose expiry is at or before `now` using the
    /// expiry index. Returns bytes reclaimed.
    pub fn cleanup_expired(&self) -> PersistResult<usize> {
        let now = self.clock.now_ms();
        // All index keys start with the BE timestamp, so everything up to
        // (now+1)·2^64 sorts before the first live row.
        let upper = (now + 1).to_be_bytes().to_vec();

        let mut reclaimed = 0;
        let mut dead: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for item in self.expiry.range(..upper) {
            let (index_key, full_key) = item?;
            dead.push((index_key.to_vec(), full_key.to_vec()));
        }

        for (index_key, full_key) in dead {
            self.expiry.remove(index_key)?;
            let full_key = String::from_utf8(full_key)
                .map_err(|e| PersistError::Storage(format!("non-utf8 key: {}", e)))?;
            if let Some(bytes) = self.entries.remove(full_key.as_bytes())? {
                if let Ok(row) = serde_json::from_slice::<IndexedRow>(&bytes) {
                    reclaimed += row.size;
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
        self.used.load(Ordering::SeqCst).saturating_sub(replaced) + incoming > self.max_size
    }
}

#[async_trait]
impl<T> PersistenceBackend<T> for IndexedPersistence<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn set(&self, key: &str, entry: &CacheEntry<T>) -> PersistResult<()> {
        let full = self.full_key(key);
        let value = serialize_entry(entry)?;
        let size = stored_size(&value);

        let old = self.read_row(&full)?;
        let replaced = old.as_ref().map(|row| row.size).unwrap_or(0);

        if self.over_quota(size, replaced) {
            let reclaimed = self.cleanup_expired()?;
            log::debug!("indexed store quota hit for '{}'; reclaimed {} bytes", key, reclaimed);
            let old = self.read_row(&full)?;
            let replaced = old.as_ref().map(|row| row.size).unwrap_or(0);
            if self.over_quota(size, replaced) {
                return Err(PersistError::Quota(format!(
                    "{} bytes needed, {} byte quota",
                    size, self.max_size
                )));
            }
        }

        if let Some(old) = self.read_row(&full)? {
            self.remove_row(&full, &old)?;
        }

        let row = IndexedRow { key: full.clone(), value, size, expires_at: entry.expires_at };
        let bytes = serde_json::to_vec(&row)?;
        self.entries.insert(full.as_bytes(), bytes)?;
        self.expiry.insert(expiry_index_key(row.expires_at, &full), full.as_bytes())?;
        self.used.fetch_add(size, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> PersistResult<Option<CacheEntry<T>>> {
        let full = self.full_key(key);
        let row = match self.read_row(&full)? {
            Some(row) => row,
            None => return Ok(None),
        };

        if self.clock.now_ms() >= row.expires_at {
            self.remove_row(&full, &row)?;
            return Ok(None);
        }

        Ok(Some(deserialize_entry(&row.value)?))
    }

    async fn has(&self, key: &str) -> PersistResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> PersistResult<bool> {
        let full = self.full_key(key);
        match self.read_row(&full)? {
            Some(row) => {
                self.remove_row(&full, &row)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> PersistResult<()> {
        self.entries.clear()?;
        self.expiry.clear()?;
        self.used.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.entries.iter() {
            let (key, _) = item?;
            if let Ok(full) = String::from_utf8(key.to_vec()) {
                if let Some(stripped) = full.strip_prefix(&self.prefix) {
                    keys.push(stripped.to_string());
                }
            }
        }
        Ok(keys)
    }

    async fn size(&self) -> PersistResult<usize> {
        Ok(self.used.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "indexed"
    }
}
