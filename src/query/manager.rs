//! Registry of live queries.
//!
//! Queries are indexed by the same fingerprint derivation the cache
//! manager uses, so one logical request maps to one query instance.
//! Bulk operations mark, refetch, or remove queries by predicate.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::cache::manager::{CacheManager, FetchFn};
use crate::key::request_key;
use crate::query::query::{FocusSignal, Query, QueryOptions};

/// Owns every live [`Query`] for one cache manager.
pub struct QueryManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    manager: Arc<CacheManager<T>>,
    queries: DashMap<String, Arc<Query<T>>>,
    focus: FocusSignal,
}

impl<T> QueryManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a registry over `manager`.
    pub fn new(manager: Arc<CacheManager<T>>) -> Self {
        Self { manager, queries: DashMap::new(), focus: FocusSignal::new() }
    }

    /// The focus signal shared by every query built here.
    pub fn focus(&self) -> &FocusSignal {
        &self.focus
    }

    /// Return the query for `key`, constructing it on first use.
    pub fn get_query(
        &self,
        key: &str,
        fetch: FetchFn<T>,
        options: QueryOptions<T>,
    ) -> Arc<Query<T>> {
        if let Some(existing) = self.queries.get(key) {
            return Arc::clone(&existing);
        }

        let query = Query::new(
            Arc::clone(&self.manager),
            key,
            fetch,
            options,
            Some(&self.focus),
        );
        self.queries.insert(key.to_string(), Arc::clone(&query));
        query
    }

    /// [`Self::get_query`] keyed by request shape instead of a
    /// pre-built fingerprint.
    pub fn get_query_for_request(
        &self,
        method: &str,
        url: &str,
        params: Option<&Value>,
        body: Option<&Value>,
        fetch: FetchFn<T>,
        options: QueryOptions<T>,
    ) -> Arc<Query<T>> {
        let key = request_key(method, url, params, body);
        self.get_query(&key, fetch, options)
    }

    /// The query for `key`, if one is live.
    pub fn get(&self, key: &str) -> Option<Arc<Query<T>>> {
        self.queries.get(key).map(|q| Arc::clone(&q))
    }

    /// Number of live queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Whether no queries are live.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Invalidate the cached entry and mark stale every query whose key
    /// matches. Returns how many matched.
    pub fn invalidate_queries<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let mut count = 0;
        for item in self.queries.iter() {
            if predicate(item.key()) {
                self.manager.delete(item.key());
                item.value().mark_stale();
                count += 1;
            }
        }
        count
    }

    /// Invalidate every live query.
    pub fn invalidate_all_queries(&self) -> usize {
        self.invalidate_queries(|_| true)
    }

    /// Refetch every query whose key matches. Returns how many matched.
    pub fn refetch_queries<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let mut count = 0;
        for item in self.queries.iter() {
            if predicate(item.key()) {
                let query = Arc::clone(item.value());
                tokio::spawn(async move {
                    let _ = query.refetch().await;
                });
                count += 1;
            }
        }
        count
    }

    /// Dispose and drop every query whose key matches. Returns how many
    /// were removed.
    pub fn remove_queries<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let doomed: Vec<String> = self
            .queries
            .iter()
            .filter(|item| predicate(item.key()))
            .map(|item| item.key().clone())
            .collect();

        let mut count = 0;
        for key in doomed {
            if let Some((_, query)) = self.queries.remove(&key) {
                query.dispose();
                count += 1;
            }
        }
        count
    }
}
