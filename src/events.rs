//! Typed publish/subscribe event bus.
//!
//! The cache manager, queries, and warming tasks all announce their
//! activity through one [`EventBus`]. Listeners register per
//! [`EventKind`]; `once` registrations are removed from the registry
//! before their listener runs, so a listener that re-emits the same event
//! cannot recurse into itself. Listener panics are caught and logged so a
//! misbehaving observer cannot break a cache operation.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::cache::entry::CacheEntry;
use crate::cache::memory::CacheStats;
use crate::error::FetchError;

/// Event payloads published by the data layer.
#[derive(Debug, Clone)]
pub enum CacheEvent<T> {
    /// A foreground fetch started for a fingerprint.
    RequestStart {
        /// Request fingerprint.
        key: String,
    },
    /// A foreground fetch succeeded.
    RequestSuccess {
        /// Request fingerprint.
        key: String,
    },
    /// A foreground fetch failed.
    RequestError {
        /// Request fingerprint.
        key: String,
        /// The failure.
        error: FetchError,
    },
    /// A foreground fetch settled (success or failure).
    RequestComplete {
        /// Request fingerprint.
        key: String,
    },

    /// A read was served from a live entry.
    CacheHit {
        /// Request fingerprint.
        key: String,
        /// Whether the served entry was stale.
        stale: bool,
    },
    /// A read found no usable entry.
    CacheMiss {
        /// Request fingerprint.
        key: String,
    },
    /// An entry was inserted or replaced.
    CacheSet {
        /// Request fingerprint.
        key: String,
    },
    /// An entry was invalidated; carries the pre-delete snapshot.
    CacheInvalidate {
        /// Request fingerprint.
        key: String,
        /// Entry state at the moment of invalidation.
        entry: Box<CacheEntry<T>>,
    },
    /// An entry was evicted to satisfy a bound.
    CacheEvict {
        /// Request fingerprint.
        key: String,
    },
    /// A statistics snapshot was published.
    CacheStatsSnapshot {
        /// The snapshot.
        stats: CacheStats,
    },
    /// A named invalidation group was applied.
    GroupInvalidated {
        /// Group name.
        name: String,
        /// Number of entries removed.
        count: usize,
    },

    /// A warming record was registered.
    WarmRegister {
        /// Request fingerprint.
        key: String,
    },
    /// A warming record was unregistered.
    WarmUnregister {
        /// Request fingerprint.
        key: String,
    },
    /// A warming tick refreshed an entry.
    WarmRefresh {
        /// Request fingerprint.
        key: String,
    },

    /// A background revalidation began executing.
    RevalidateStart {
        /// Request fingerprint.
        key: String,
    },
    /// A background revalidation stored fresh data.
    RevalidateSuccess {
        /// Request fingerprint.
        key: String,
    },
    /// A background revalidation failed terminally.
    RevalidateError {
        /// Request fingerprint.
        key: String,
        /// Number of attempts made.
        attempts: u32,
        /// The terminal failure.
        error: FetchError,
    },
    /// A revalidation was skipped by the throttle window.
    RevalidateThrottled {
        /// Request fingerprint.
        key: String,
    },
    /// A revalidation was deferred by the debounce timer.
    RevalidateDebounced {
        /// Request fingerprint.
        key: String,
    },

    /// Generic error notification.
    Error {
        /// Human-readable description.
        message: String,
    },
    /// Diagnostic breadcrumb.
    Debug {
        /// Human-readable description.
        message: String,
    },
}

/// Discriminant used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `request:start`
    RequestStart,
    /// `request:success`
    RequestSuccess,
    /// `request:error`
    RequestError,
    /// `request:complete`
    RequestComplete,
    /// `cache:hit`
    CacheHit,
    /// `cache:miss`
    CacheMiss,
    /// `cache:set`
    CacheSet,
    /// `cache:invalidate`
    CacheInvalidate,
    /// `cache:evict`
    CacheEvict,
    /// `cache:stats`
    CacheStats,
    /// `cache:group-invalidated`
    GroupInvalidated,
    /// `cache:warm:register`
    WarmRegister,
    /// `cache:warm:unregister`
    WarmUnregister,
    /// `cache:warm:refresh`
    WarmRefresh,
    /// `cache:revalidate:start`
    RevalidateStart,
    /// `cache:revalidate:success`
    RevalidateSuccess,
    /// `cache:revalidate:error`
    RevalidateError,
    /// `cache:revalidate:throttled`
    RevalidateThrottled,
    /// `cache:revalidate:debounced`
    RevalidateDebounced,
    /// `error`
    Error,
    /// `debug`
    Debug,
}

impl<T> CacheEvent<T> {
    /// The discriminant this event dispatches under.
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::RequestStart { .. } => EventKind::RequestStart,
            CacheEvent::RequestSuccess { .. } => EventKind::RequestSuccess,
            CacheEvent::RequestError { .. } => EventKind::RequestError,
            CacheEvent::RequestComplete { .. } => EventKind::RequestComplete,
            CacheEvent::CacheHit { .. } => EventKind::CacheHit,
            CacheEvent::CacheMiss { .. } => EventKind::CacheMiss,
            CacheEvent::CacheSet { .. } => EventKind::CacheSet,
            CacheEvent::CacheInvalidate { .. } => EventKind::CacheInvalidate,
            CacheEvent::CacheEvict { .. } => EventKind::CacheEvict,
            CacheEvent::CacheStatsSnapshot { .. } => EventKind::CacheStats,
            CacheEvent::GroupInvalidated { .. } => EventKind::GroupInvalidated,
            CacheEvent::WarmRegister { .. } => EventKind::WarmRegister,
            CacheEvent::WarmUnregister { .. } => EventKind::WarmUnregister,
            CacheEvent::WarmRefresh { .. } => EventKind::WarmRefresh,
            CacheEvent::RevalidateStart { .. } => EventKind::RevalidateStart,
            CacheEvent::RevalidateSuccess { .. } => EventKind::RevalidateSuccess,
            CacheEvent::RevalidateError { .. } => EventKind::RevalidateError,
            CacheEvent::RevalidateThrottled { .. } => EventKind::RevalidateThrottled,
            CacheEvent::RevalidateDebounced { .. } => EventKind::RevalidateDebounced,
            CacheEvent::Error { .. } => EventKind::Error,
            CacheEvent::Debug { .. } => EventKind::Debug,
        }
    }
}

type Listener<T> = Arc<dyn Fn(&CacheEvent<T>) + Send + Sync>;

struct Registration<T> {
    id: Uuid,
    once: bool,
    listener: Listener<T>,
}

/// Typed publish/subscribe bus.
pub struct EventBus<T> {
    listeners: RwLock<HashMap<EventKind, Vec<Registration<T>>>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self { listeners: RwLock::new(HashMap::new()) }
    }

    /// Register a listener for `kind`. Returns its subscription id.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Uuid
    where
        F: Fn(&CacheEvent<T>) + Send + Sync + 'static,
    {
        self.register(kind, listener, false)
    }

    /// Register a listener invoked at most once.
    ///
    /// The registration is dropped before the listener runs.
    pub fn once<F>(&self, kind: EventKind, listener: F) -> Uuid
    where
        F: Fn(&CacheEvent<T>) + Send + Sync + 'static,
    {
        self.register(kind, listener, true)
    }

    fn register<F>(&self, kind: EventKind, listener: F, once: bool) -> Uuid
    where
        F: Fn(&CacheEvent<T>) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Registration { id, once, listener: Arc::new(listener) });
        id
    }

    /// Remove a listener by subscription id. Returns whether it existed.
    pub fn off(&self, kind: EventKind, id: Uuid) -> bool {
        let mut listeners = self.listeners.write();
        if let Some(regs) = listeners.get_mut(&kind) {
            let before = regs.len();
            regs.retain(|r| r.id != id);
            return regs.len() != before;
        }
        false
    }

    /// Publish an event to all listeners of its kind.
    ///
    /// Listeners are invoked outside the registry lock, so they may
    /// subscribe, unsubscribe, or re-emit.
    pub fn emit(&self, event: &CacheEvent<T>) {
        let kind = event.kind();
        let to_call: Vec<Listener<T>> = {
            let mut listeners = self.listeners.write();
            match listeners.get_mut(&kind) {
                Some(regs) => {
                    let snapshot: Vec<Listener<T>> =
                        regs.iter().map(|r| Arc::clone(&r.listener)).collect();
                    regs.retain(|r| !r.once);
                    snapshot
                }
                None => return,
            }
        };

        for listener in to_call {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::error!("event listener panicked handling {:?}", kind);
            }
        }
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Drop all listeners, or only those for `kind` when given.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let mut listeners = self.listeners.write();
        match kind {
            Some(kind) => {
                listeners.remove(&kind);
            }
            None => listeners.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hit_event(key: &str) -> CacheEvent<String> {
        CacheEvent::CacheHit { key: key.to_string(), stale: false }
    }

    #[test]
    fn test_on_and_emit() {
        let bus: EventBus<String> = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        bus.on(EventKind::CacheHit, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&hit_event("a"));
        bus.emit(&hit_event("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_runs_once() {
        let bus: EventBus<String> = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        bus.once(EventKind::CacheHit, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&hit_event("a"));
        bus.emit(&hit_event("b"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::CacheHit), 0);
    }

    #[test]
    fn test_off_removes_listener() {
        let bus: EventBus<String> = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let id = bus.on(EventKind::CacheMiss, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.off(EventKind::CacheMiss, id));
        assert!(!bus.off(EventKind::CacheMiss, id));

        bus.emit(&CacheEvent::CacheMiss { key: "a".into() });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_poison() {
        let bus: EventBus<String> = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::CacheHit, |_| panic!("bad listener"));
        let calls_clone = Arc::clone(&calls);
        bus.on(EventKind::CacheHit, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&hit_event("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_all_listeners() {
        let bus: EventBus<String> = EventBus::new();
        bus.on(EventKind::CacheHit, |_| {});
        bus.on(EventKind::CacheMiss, |_| {});

        bus.remove_all_listeners(Some(EventKind::CacheHit));
        assert_eq!(bus.listener_count(EventKind::CacheHit), 0);
        assert_eq!(bus.listener_count(EventKind::CacheMiss), 1);

        bus.remove_all_listeners(None);
        assert_eq!(bus.listener_count(EventKind::CacheMiss), 0);
    }

    #[test]
    fn test_once_listener_can_reemit_without_recursion() {
        let bus: Arc<EventBus<String>> = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let bus_clone = Arc::clone(&bus);
        let calls_clone = Arc::clone(&calls);
        bus.once(EventKind::CacheHit, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            // The registration is already gone, so this cannot recurse.
            bus_clone.emit(&CacheEvent::CacheHit { key: "again".into(), stale: false });
        });

        bus.emit(&hit_event("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
