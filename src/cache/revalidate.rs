//! Background revalidation.
//!
//! A stale read schedules a revalidation that runs behind the caller.
//! Policy order: a throttle window can skip it, a debounce timer can
//! defer and coalesce it, a positive priority routes it through a heap
//! served by a periodic drainer, and otherwise it executes immediately.
//! Per fingerprint, at most one revalidation runs at a time; failures
//! never evict the stale entry the caller already has.

use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::cache::manager::{CacheManager, FetchFn};
use crate::cache::options::SwrOptions;
use crate::error::{FetchError, FetchResult};
use crate::events::CacheEvent;

/// One queued revalidation.
pub struct QueueItem<T> {
    pub(crate) key: String,
    pub(crate) fetch: FetchFn<T>,
    pub(crate) opts: SwrOptions<T>,
    pub(crate) priority: u32,
    pub(crate) enqueued_at: u64,
    pub(crate) seq: u64,
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
            && self.enqueued_at == other.enqueued_at
            && self.seq == other.seq
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueItem<T> {
    // Max-heap: higher priority first, then earlier enqueue, then
    // earlier insertion.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> CacheManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Route a revalidation request through throttle, debounce, queue,
    /// or immediate execution.
    pub(crate) fn schedule_revalidation(
        self: &Arc<Self>,
        key: &str,
        fetch: FetchFn<T>,
        opts: SwrOptions<T>,
    ) {
        if self.revalidations.contains_key(key) {
            return;
        }

        // Throttle: drop requests inside the quiet window.
        if !opts.throttle_time.is_zero() {
            if let Some(last) = self.last_revalidated.get(key) {
                let elapsed = self.clock.now_ms().saturating_sub(*last);
                if elapsed < opts.throttle_time.as_millis() as u64 {
                    self.events
                        .emit(&CacheEvent::RevalidateThrottled { key: key.to_string() });
                    return;
                }
            }
        }

        // Debounce: reset the timer; the trailing edge enqueues.
        if !opts.debounce_time.is_zero() {
            self.debounce_revalidation(key, fetch, opts);
            return;
        }

        if opts.priority > 0 {
            self.enqueue_revalidation(key, fetch, opts);
            return;
        }

        let manager = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            manager.execute_revalidation(&key, fetch, &opts).await;
        });
    }

    fn debounce_revalidation(self: &Arc<Self>, key: &str, fetch: FetchFn<T>, opts: SwrOptions<T>) {
        if let Some((_, previous)) = self.debouncers.remove(key) {
            previous.abort();
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let owned_key = key.to_string();
        let delay = opts.debounce_time;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = weak.upgrade() else { return };
            manager.debouncers.remove(&owned_key);
            manager.enqueue_revalidation(&owned_key, fetch, opts);
        });

        self.debouncers.insert(key.to_string(), handle);
        self.events.emit(&CacheEvent::RevalidateDebounced { key: key.to_string() });
    }

    pub(crate) fn enqueue_revalidation(&self, key: &str, fetch: FetchFn<T>, opts: SwrOptions<T>) {
        let seq = self.queue_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let item = QueueItem {
            key: key.to_string(),
            priority: opts.priority,
            enqueued_at: self.clock.now_ms(),
            seq,
            fetch,
            opts,
        };
        self.queue.lock().push(item);
    }

    /// Install the queue drainer. One item is processed at a time;
    /// items for a fingerprint that is already revalidating are dropped.
    pub(crate) fn start_drainer(self: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                loop {
                    let item = manager.queue.lock().pop();
                    let Some(item) = item else { break };
                    if manager.revalidations.contains_key(&item.key) {
                        continue;
                    }
                    manager.execute_revalidation(&item.key, item.fetch, &item.opts).await;
                }
            }
        });
        *self.drainer.lock() = Some(handle);
    }

    /// Number of queued revalidations (for inspection and tests).
    pub fn queued_revalidations(&self) -> usize {
        self.queue.lock().len()
    }

    /// Execute one revalidation: timeout, validation, retry with
    /// backoff. Single-flight per fingerprint.
    pub(crate) async fn execute_revalidation(
        self: &Arc<Self>,
        key: &str,
        fetch: FetchFn<T>,
        opts: &SwrOptions<T>,
    ) {
        // Single-flight: the slot is taken until the attempt settles.
        if self.revalidations.insert(key.to_string(), ()).is_some() {
            return;
        }

        self.cache.update(key, |entry| entry.is_revalidating = true);
        self.events.emit(&CacheEvent::RevalidateStart { key: key.to_string() });

        let mut attempts: u32 = 0;
        let outcome = loop {
            attempts += 1;
            match self.revalidation_attempt(key, &fetch, opts).await {
                Ok(data) => break Ok(data),
                Err(error) => {
                    // Cancellation is terminal; retrying would defeat it.
                    if matches!(error, FetchError::Cancelled) || attempts > opts.max_retries {
                        break Err(error);
                    }
                    let delay = opts.retry_delay.delay_for(attempts - 1, &error);
                    log::debug!(
                        "revalidation of '{}' failed (attempt {}): {}; retrying in {:?}",
                        key,
                        attempts,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let now = self.clock.now_ms();
        match outcome {
            Ok(data) => {
                let previous = self.cache.peek(key);
                let mut entry = crate::cache::entry::CacheEntry::new(
                    data,
                    now,
                    opts.stale_time.as_millis() as u64,
                    opts.cache_time.as_millis() as u64,
                );
                // Access history survives a refresh; the revalidation
                // counter advances.
                entry.access_count = previous.as_ref().map(|e| e.access_count).unwrap_or(0);
                entry.revalidation_count =
                    previous.as_ref().map(|e| e.revalidation_count).unwrap_or(0) + 1;
                entry.last_revalidated_at = Some(now);

                self.store_entry(key, entry);
                self.events.emit(&CacheEvent::RevalidateSuccess { key: key.to_string() });
            }
            Err(error) => {
                // Never evict the stale entry the caller is living on.
                self.cache.update(key, |entry| {
                    entry.is_revalidating = false;
                    entry.last_error = Some(error.to_string());
                });
                self.events.emit(&CacheEvent::RevalidateError {
                    key: key.to_string(),
                    attempts,
                    error,
                });
            }
        }

        self.last_revalidated.insert(key.to_string(), now);
        self.revalidations.remove(key);
    }

    async fn revalidation_attempt(
        &self,
        key: &str,
        fetch: &FetchFn<T>,
        opts: &SwrOptions<T>,
    ) -> FetchResult<T> {
        let data = self.run_guarded(fetch, opts).await?;
        if let Some(validator) = &opts.validator {
            if !validator(&data) {
                return Err(FetchError::Validation(format!(
                    "revalidated data rejected for '{}'",
                    key
                )));
            }
        }
        Ok(data)
    }
}
