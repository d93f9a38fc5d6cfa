//! Request deduplication.
//!
//! Concurrent fetches for the same fingerprint collapse into a single
//! producer invocation; every caller awaits the same shared future. The
//! in-flight record is removed when the producer settles, success or
//! failure, before the result is handed outward.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::FetchResult;

type SharedFetch<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

/// Coalesces concurrent identical requests.
pub struct RequestDeduper<T>
where
    T: Clone + Send + Sync + 'static,
{
    in_flight: Arc<DashMap<String, SharedFetch<T>>>,
}

impl<T> Default for RequestDeduper<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestDeduper<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty deduper.
    pub fn new() -> Self {
        Self { in_flight: Arc::new(DashMap::new()) }
    }

    /// Run `producer` for `key`, unless an identical request is already
    /// in flight, in which case its result is shared.
    ///
    /// The producer is invoked lazily: if another caller won the race to
    /// register the fingerprint, the losing producer is never polled.
    pub async fn dedupe<F>(&self, key: &str, producer: F) -> FetchResult<T>
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult<T>> + Send + 'static,
    {
        let map = Arc::clone(&self.in_flight);
        let owned_key = key.to_string();

        let candidate: SharedFetch<T> = {
            let map = Arc::clone(&map);
            let key = owned_key.clone();
            async move {
                let result = producer().await;
                map.remove(&key);
                result
            }
            .boxed()
            .shared()
        };

        let fut = match map.entry(owned_key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(candidate.clone());
                candidate
            }
        };

        fut.await
    }

    /// Whether a request for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of in-flight requests.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Fingerprints of all in-flight requests.
    pub fn in_flight_keys(&self) -> Vec<String> {
        self.in_flight.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop all in-flight tracking.
    ///
    /// Running producers are not aborted; subsequent calls for the same
    /// fingerprints will start new producers.
    pub fn clear_in_flight_requests(&self) {
        self.in_flight.clear();
    }
}
