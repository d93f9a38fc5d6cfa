//! Fallback chain over multiple persistence backends.
//!
//! Backends form a flat ordered list with one `active_index`. Writes try
//! the active backend and advance on failure; successful writes also
//! mirror to every other backend in the background. Reads scan forward
//! from the active backend; a hit on a later backend promotes it to
//! active and back-fills the earlier ones. Deletes and clears fan out to
//! the whole chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::cache::entry::CacheEntry;
use crate::error::{PersistError, PersistResult};
use crate::persistence::PersistenceBackend;

/// Ordered chain of backends with automatic promotion.
pub struct FallbackPersistence<T> {
    backends: Vec<Arc<dyn PersistenceBackend<T>>>,
    active: AtomicUsize,
}

impl<T> FallbackPersistence<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Build a chain. At least one backend is required.
    pub fn new(backends: Vec<Arc<dyn PersistenceBackend<T>>>) -> PersistResult<Self> {
        if backends.is_empty() {
            return Err(PersistError::EmptyChain);
        }
        Ok(Self { backends, active: AtomicUsize::new(0) })
    }

    /// Index of the currently active backend.
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of backends in the chain.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Chains always hold at least one backend.
    pub fn is_empty(&self) -> bool {
        false
    }

    fn mirror_set(&self, skip: usize, key: &str, entry: &CacheEntry<T>) {
        for (i, backend) in self.backends.iter().enumerate() {
            if i == skip {
                continue;
            }
            let backend = Arc::clone(backend);
            let key = key.to_string();
            let entry = entry.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.set(&key, &entry).await {
                    log::debug!("mirror write to {} failed for '{}': {}", backend.name(), key, err);
                }
            });
        }
    }

    fn backfill(&self, upto: usize, key: &str, entry: &CacheEntry<T>) {
        for backend in self.backends.iter().take(upto) {
            let backend = Arc::clone(backend);
            let key = key.to_string();
            let entry = entry.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.set(&key, &entry).await {
                    log::debug!("backfill to {} failed for '{}': {}", backend.name(), key, err);
                }
            });
        }
    }
}

#[async_trait]
impl<T> PersistenceBackend<T> for FallbackPersistence<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn set(&self, key: &str, entry: &CacheEntry<T>) -> PersistResult<()> {
        let start = self.active.load(Ordering::SeqCst);
        let mut last_error = None;

        for i in start..self.backends.len() {
            match self.backends[i].set(key, entry).await {
                Ok(()) => {
                    self.mirror_set(i, key, entry);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "backend {} failed writing '{}', advancing: {}",
                        self.backends[i].name(),
                        key,
                        err
                    );
                    last_error = Some(err);
                    // Advance past the failing backend.
                    if i + 1 < self.backends.len() {
                        self.active.store(i + 1, Ordering::SeqCst);
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PersistError::Unavailable("no backend accepted the write".into())))
    }

    async fn get(&self, key: &str) -> PersistResult<Option<CacheEntry<T>>> {
        let start = self.active.load(Ordering::SeqCst);

        for i in start..self.backends.len() {
            match self.backends[i].get(key).await {
                Ok(Some(entry)) => {
                    if i > start {
                        // A later backend had the data: promote it and
                        // repopulate the ones we scanned past.
                        self.active.store(i, Ordering::SeqCst);
                        self.backfill(i, key, &entry);
                    }
                    return Ok(Some(entry));
                }
                Ok(None) => {}
                Err(err) => {
                    log::debug!("backend {} read failed for '{}': {}", self.backends[i].name(), key, err);
                }
            }
        }
        Ok(None)
    }

    async fn has(&self, key: &str) -> PersistResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> PersistResult<bool> {
        let mut deleted = false;
        for backend in &self.backends {
            match backend.delete(key).await {
                Ok(hit) => deleted = deleted || hit,
                Err(err) => {
                    log::debug!("backend {} delete failed for '{}': {}", backend.name(), key, err);
                }
            }
        }
        Ok(deleted)
    }

    async fn clear(&self) -> PersistResult<()> {
        for backend in &self.backends {
            if let Err(err) = backend.clear().await {
                log::debug!("backend {} clear failed: {}", backend.name(), err);
            }
        }
        Ok(())
    }

    async fn keys(&self) -> PersistResult<Vec<String>> {
        let mut union = BTreeSet::new();
        for backend in &self.backends {
            match backend.keys().await {
                Ok(keys) => union.extend(keys),
                Err(err) => {
                    log::debug!("backend {} keys failed: {}", backend.name(), err);
                }
            }
        }
        Ok(union.into_iter().collect())
    }

    async fn size(&self) -> PersistResult<usize> {
        let active = self.active.load(Ordering::SeqCst);
        self.backends[active].size().await
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}
