//! # Fetchlayer - Client-Side HTTP Data-Access Layer
//!
//! A coherent, observable data layer over raw request/response traffic.
//!
//! ## Architecture
//!
//! - `key`: canonical request fingerprints
//! - `cache`: request deduplication, bounded memory cache, and the
//!   stale-while-revalidate engine with warming and invalidation
//! - `persistence`: durable, ephemeral, indexed, and in-memory backends
//!   with fallback chaining, synchronization, and migration
//! - `query`: subscribable per-fingerprint state machines
//! - `events`: typed publish/subscribe across all of the above
//! - `adapter`: the HTTP seam and a `reqwest`-backed default
//! - `retry` / `clock` / `error`: backoff math, the logical clock, and
//!   the error taxonomy
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fetchlayer::{
//!     clock::system_clock,
//!     cache::{CacheManager, CacheManagerConfig, SwrOverrides},
//!     error::FetchError,
//!     key::request_key,
//! };
//!
//! # async fn example() -> Result<(), FetchError> {
//! let manager: Arc<CacheManager<String>> =
//!     CacheManager::new(CacheManagerConfig::default(), system_clock());
//!
//! let key = request_key("GET", "https://api.example.com/users", None, None);
//! let users = manager
//!     .swr(&key, || async { Ok("[]".to_string()) }, &SwrOverrides::default())
//!     .await?;
//! println!("{users}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Canonical request fingerprints
pub mod key;

// Request coordination and SWR caching
pub mod cache;

// Persistence backends, fallback, sync, migration
pub mod persistence;

// Subscribable query objects
pub mod query;

// Typed event bus
pub mod events;

// HTTP adapter seam
pub mod adapter;

// Retry and backoff
pub mod retry;

// Logical clock
pub mod clock;

// Error taxonomy
pub mod error;

// Re-export commonly used types
pub use adapter::{AdapterRequest, AdapterResponse, HttpAdapter, ReqwestAdapter, RequestOptions};
pub use cache::{
    CacheEntry, CacheManager, CacheManagerConfig, CacheStats, EvictionPolicy, FetchFn,
    GroupTarget, InvalidateOptions, MemoryCache, MemoryCacheConfig, MutationOptions, Related,
    RequestDeduper, SwrOptions, SwrOverrides,
};
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use error::{FetchError, FetchResult, PersistError, PersistResult};
pub use events::{CacheEvent, EventBus, EventKind};
pub use key::request_key;
pub use persistence::{
    create_persistence, FallbackPersistence, MigrationOptions, OptimizedConfig,
    OptimizedPersistence, PersistenceBackend, PersistenceConfig, PersistenceSynchronizer,
    PersistenceType, SyncConfig,
};
pub use query::{FocusSignal, Query, QueryManager, QueryOptions, QueryState};
pub use retry::{with_retry, RetryDelay, RetryPolicy};
