//! Cached entry record and freshness predicates.

use serde::{Deserialize, Serialize};

/// A cached value plus its freshness, expiry, and revalidation metadata.
///
/// Timestamps are logical milliseconds from the owning component's clock.
/// The construction invariant `created_at <= stale_at <= expires_at` holds
/// for every live entry; an entry past `expires_at` is never observable
/// through any read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached value.
    pub data: T,
    /// When the entry was created.
    pub created_at: u64,
    /// Instant after which the entry is stale (inclusive of `stale_at`).
    pub stale_at: u64,
    /// Instant at which the entry becomes unusable.
    pub expires_at: u64,
    /// Whether a background revalidation is currently running.
    pub is_revalidating: bool,
    /// Number of completed revalidations.
    pub revalidation_count: u32,
    /// When the last revalidation completed, if any.
    pub last_revalidated_at: Option<u64>,
    /// Number of reads served from this entry.
    pub access_count: u64,
    /// The last revalidation failure, if any.
    pub last_error: Option<String>,
}

impl<T> CacheEntry<T> {
    /// Create an entry that is fresh for `stale_ms` and usable for
    /// `expire_ms` from `now`.
    ///
    /// `expire_ms` is clamped up to `stale_ms` so the ordering invariant
    /// holds even for inconsistent caller input.
    pub fn new(data: T, now: u64, stale_ms: u64, expire_ms: u64) -> Self {
        let stale_at = now.saturating_add(stale_ms);
        let expires_at = now.saturating_add(expire_ms.max(stale_ms));
        Self {
            data,
            created_at: now,
            stale_at,
            expires_at,
            is_revalidating: false,
            revalidation_count: 0,
            last_revalidated_at: None,
            access_count: 0,
            last_error: None,
        }
    }

    /// Fresh: `now <= stale_at`.
    pub fn is_fresh(&self, now: u64) -> bool {
        now <= self.stale_at
    }

    /// Stale but usable: past `stale_at`, before `expires_at`.
    pub fn is_stale(&self, now: u64) -> bool {
        now > self.stale_at && !self.is_expired(now)
    }

    /// Unusable. The expiry instant itself is excluded from the usable
    /// window: an entry read at exactly `expires_at` reports expired.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}
