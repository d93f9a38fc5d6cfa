//! Request-coordination and caching subsystem.
//!
//! - `entry`: the cached record and its freshness predicates
//! - `memory`: bounded store with pluggable eviction and statistics
//! - `dedupe`: in-flight request coalescing
//! - `options`: SWR options and per-call overrides
//! - `manager`: the stale-while-revalidate engine
//! - `revalidate`, `invalidate`, `warm`: the manager's background
//!   machinery, split by concern

pub mod dedupe;
pub mod entry;
pub mod invalidate;
pub mod manager;
pub mod memory;
pub mod options;
pub mod revalidate;
pub mod warm;

pub use dedupe::RequestDeduper;
pub use entry::CacheEntry;
pub use invalidate::{GroupTarget, InvalidateOptions, MutationOptions, Related};
pub use manager::{CacheManager, CacheManagerConfig, FetchFn, FetchFuture, InvalidationHook};
pub use memory::{
    CacheStats, EvictionPolicy, MemoryCache, MemoryCacheConfig, SerializedSizeEstimator,
    SizeEstimator, SlotMeta,
};
pub use options::{CancelSignal, ShouldFetch, SwrOptions, SwrOverrides, Validator};
