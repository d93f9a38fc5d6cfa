//! Persistence layer.
//!
//! Entries can outlive the memory cache through pluggable asynchronous
//! backends sharing one contract: JSON serialization of the entry record,
//! namespaced keys, quota enforcement, and expired rows that are never
//! observable through a read.
//!
//! - `kv`: durable (sled-backed) and ephemeral (process-lifetime)
//!   string-store backends
//! - `indexed`: sled backend with an expiry-ordered secondary index
//! - `memory`: plain in-memory fallback
//! - `fallback`: ordered chain with automatic promotion
//! - `optimized`: LRU front-cache + batched writes in front of any backend
//! - `sync` / `migrate`: two-way convergence and bulk copy

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::entry::CacheEntry;
use crate::clock::Clock;
use crate::error::{PersistError, PersistResult};

pub mod fallback;
pub mod indexed;
pub mod kv;
pub mod memory;
pub mod migrate;
pub mod optimized;
pub mod serialize;
pub mod sync;

pub use fallback::FallbackPersistence;
pub use indexed::IndexedPersistence;
pub use kv::{MemoryStringStore, SledStringStore, StoragePersistence, StringStore};
pub use memory::MemoryPersistence;
pub use migrate::{migrate, verify_migration, MigrationOptions, MigrationReport, VerificationReport};
pub use optimized::{OptimizedConfig, OptimizedPersistence};
pub use sync::{ConflictStrategy, PersistenceSynchronizer, SyncConfig, SyncReport};

/// Asynchronous persistence contract shared by every backend.
#[async_trait]
pub trait PersistenceBackend<T>: Send + Sync {
    /// Store an entry under `key`.
    async fn set(&self, key: &str, entry: &CacheEntry<T>) -> PersistResult<()>;
    /// Load the entry for `key`, if present and unexpired.
    async fn get(&self, key: &str) -> PersistResult<Option<CacheEntry<T>>>;
    /// Whether an unexpired entry exists for `key`.
    async fn has(&self, key: &str) -> PersistResult<bool>;
    /// Remove the entry for `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> PersistResult<bool>;
    /// Remove every entry in this backend's namespace.
    async fn clear(&self) -> PersistResult<()>;
    /// All stored keys (namespace prefix stripped).
    async fn keys(&self) -> PersistResult<Vec<String>>;
    /// Total stored bytes (serialized length × 2).
    async fn size(&self) -> PersistResult<usize>;
    /// Identifier used in logs.
    fn name(&self) -> &'static str;
}

/// Backend selector for [`create_persistence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceType {
    /// Best available: a fallback chain over `fallback_order`.
    Auto,
    /// sled-backed string store surviving restarts.
    Durable,
    /// Process-lifetime namespaced string store.
    Ephemeral,
    /// sled backend with an expiry-ordered index.
    Indexed,
    /// Plain in-memory map.
    Memory,
}

/// Factory configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Which backend to build.
    pub backend: PersistenceType,
    /// Key namespace prefix.
    pub prefix: String,
    /// Per-backend quota in bytes; 0 disables it.
    pub max_size: usize,
    /// Directory for the sled-backed variants.
    pub db_path: PathBuf,
    /// Database directory name under `db_path`.
    pub db_name: String,
    /// Entry-tree name for the indexed backend.
    pub store_name: String,
    /// Chain order used by [`PersistenceType::Auto`].
    pub fallback_order: Option<Vec<PersistenceType>>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceType::Auto,
            prefix: "fk_cache:".to_string(),
            max_size: 5 * 1024 * 1024,
            db_path: PathBuf::from(".fetchlayer"),
            db_name: "fetchlayer".to_string(),
            store_name: "entries".to_string(),
            fallback_order: None,
        }
    }
}

// The ephemeral variants of one process share a namespace, so different
// prefixes can coexist in the same store.
static EPHEMERAL_STORE: Lazy<Arc<MemoryStringStore>> =
    Lazy::new(|| Arc::new(MemoryStringStore::new()));

/// Build a persistence backend from `config`.
///
/// `Auto` constructs each backend in `fallback_order` (default: indexed,
/// durable, memory), skips the ones that fail to open, and chains the
/// survivors; at least the in-memory backend always succeeds.
pub fn create_persistence<T>(
    config: &PersistenceConfig,
    clock: Arc<dyn Clock>,
) -> PersistResult<Arc<dyn PersistenceBackend<T>>>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    match config.backend {
        PersistenceType::Memory => {
            Ok(Arc::new(MemoryPersistence::new(config.max_size, clock)))
        }
        PersistenceType::Ephemeral => {
            let store = Arc::clone(&EPHEMERAL_STORE);
            let backend =
                StoragePersistence::new(store, config.prefix.clone(), config.max_size, clock)?;
            Ok(Arc::new(backend))
        }
        PersistenceType::Durable => {
            let path = config.db_path.join(format!("{}-kv", config.db_name));
            let store = Arc::new(SledStringStore::open(&path)?);
            let backend =
                StoragePersistence::new(store, config.prefix.clone(), config.max_size, clock)?;
            Ok(Arc::new(backend))
        }
        PersistenceType::Indexed => {
            let path = config.db_path.join(&config.db_name);
            let backend = IndexedPersistence::open(
                &path,
                &config.store_name,
                config.prefix.clone(),
                config.max_size,
                clock,
            )?;
            Ok(Arc::new(backend))
        }
        PersistenceType::Auto => {
            let order = config.fallback_order.clone().unwrap_or_else(|| {
                vec![PersistenceType::Indexed, PersistenceType::Durable, PersistenceType::Memory]
            });

            let mut backends: Vec<Arc<dyn PersistenceBackend<T>>> = Vec::new();
            for backend_type in order {
                if backend_type == PersistenceType::Auto {
                    return Err(PersistError::Unavailable(
                        "auto cannot appear in its own fallback order".into(),
                    ));
                }
                let single =
                    PersistenceConfig { backend: backend_type, ..config.clone() };
                match create_persistence::<T>(&single, Arc::clone(&clock)) {
                    Ok(backend) => backends.push(backend),
                    Err(err) => {
                        log::warn!("skipping unavailable {:?} backend: {}", backend_type, err);
                    }
                }
            }

            if backends.is_empty() {
                log::warn!("no configured backend available; using in-memory persistence");
                backends.push(Arc::new(MemoryPersistence::new(config.max_size, clock)));
            }
            Ok(Arc::new(FallbackPersistence::new(backends)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn config_in(dir: &tempfile::TempDir, backend: PersistenceType) -> PersistenceConfig {
        PersistenceConfig {
            backend,
            db_path: dir.path().to_path_buf(),
            max_size: 0,
            ..PersistenceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_factory_builds_each_variant() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1000));

        for backend_type in [
            PersistenceType::Memory,
            PersistenceType::Ephemeral,
            PersistenceType::Durable,
            PersistenceType::Indexed,
        ] {
            let backend: Arc<dyn PersistenceBackend<String>> = create_persistence(
                &config_in(&dir, backend_type),
                clock.clone() as Arc<dyn Clock>,
            )
            .unwrap();

            let entry = CacheEntry::new("v".to_string(), clock.now_ms(), 60_000, 120_000);
            backend.set("probe", &entry).await.unwrap();
            assert!(backend.get("probe").await.unwrap().is_some(), "{:?}", backend_type);
            backend.clear().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_auto_builds_a_chain() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1000));

        let backend: Arc<dyn PersistenceBackend<String>> = create_persistence(
            &config_in(&dir, PersistenceType::Auto),
            clock.clone() as Arc<dyn Clock>,
        )
        .unwrap();
        assert_eq!(backend.name(), "fallback");

        let entry = CacheEntry::new("v".to_string(), clock.now_ms(), 60_000, 120_000);
        backend.set("k", &entry).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().unwrap().data, "v");
    }

    #[tokio::test]
    async fn test_ephemeral_instances_share_the_process_store() {
        let clock = Arc::new(ManualClock::new(1000));
        let config = PersistenceConfig {
            backend: PersistenceType::Ephemeral,
            prefix: "shared_test:".to_string(),
            max_size: 0,
            ..PersistenceConfig::default()
        };

        let a: Arc<dyn PersistenceBackend<String>> =
            create_persistence(&config, clock.clone() as Arc<dyn Clock>).unwrap();
        let entry = CacheEntry::new("v".to_string(), clock.now_ms(), 60_000, 120_000);
        a.set("k", &entry).await.unwrap();

        let b: Arc<dyn PersistenceBackend<String>> =
            create_persistence(&config, clock.clone() as Arc<dyn Clock>).unwrap();
        assert!(b.get("k").await.unwrap().is_some());

        a.clear().await.unwrap();
    }
}
