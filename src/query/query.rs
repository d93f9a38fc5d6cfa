//! Subscribable query over one cached fingerprint.
//!
//! A query binds a fingerprint and fetch closure to a live state
//! machine:
//!
//! ```text
//! idle → loading → success
//!              ↘ error
//! success → (mark_stale) → loading → success | error
//! success → (refetch)    → loading → success | error
//! ```
//!
//! `is_stale` is true only between `mark_stale` and the next settlement.
//! Listeners observe every state change; success and error listeners
//! observe settlements. An optional focus signal triggers refetches when
//! the host regains focus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::manager::{CacheManager, FetchFn};
use crate::error::{FetchError, FetchResult};

/// External focus signal fanned out to interested queries.
pub struct FocusSignal {
    tx: broadcast::Sender<()>,
}

impl Default for FocusSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusSignal {
    /// Create a signal with room for a small burst of notifications.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Announce that the host regained focus.
    pub fn notify(&self) {
        let _ = self.tx.send(());
    }

    /// Subscribe to focus notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

/// Observable state of one query.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    /// Last successful data, if any.
    pub data: Option<T>,
    /// Last settlement error, if the query is in the error state.
    pub error: Option<FetchError>,
    /// A fetch is in progress.
    pub is_loading: bool,
    /// The last settlement succeeded.
    pub is_success: bool,
    /// The last settlement failed.
    pub is_error: bool,
    /// `mark_stale` was called and no settlement has happened since.
    pub is_stale: bool,
    /// When the last successful fetch settled.
    pub last_fetched_at: Option<u64>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_success: false,
            is_error: false,
            is_stale: false,
            last_fetched_at: None,
        }
    }
}

/// Query construction options.
#[derive(Clone)]
pub struct QueryOptions<T> {
    /// SWR overrides applied to every fetch this query performs.
    pub swr: crate::cache::options::SwrOverrides<T>,
    /// Whether `mark_stale` triggers an automatic refetch.
    pub refetch_on_stale: bool,
    /// Whether a focus notification triggers a refetch.
    pub refetch_on_window_focus: bool,
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            swr: crate::cache::options::SwrOverrides::default(),
            refetch_on_stale: true,
            refetch_on_window_focus: false,
        }
    }
}

type StateListener<T> = Arc<dyn Fn(&QueryState<T>) + Send + Sync>;
type SuccessListener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Live view over a single cached fingerprint.
pub struct Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    key: String,
    manager: Arc<CacheManager<T>>,
    fetch: FetchFn<T>,
    options: QueryOptions<T>,
    state: RwLock<QueryState<T>>,
    state_listeners: RwLock<Vec<(Uuid, StateListener<T>)>>,
    success_listeners: RwLock<Vec<(Uuid, SuccessListener<T>)>>,
    error_listeners: RwLock<Vec<(Uuid, ErrorListener)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create the query and start its initial fetch.
    pub fn new(
        manager: Arc<CacheManager<T>>,
        key: impl Into<String>,
        fetch: FetchFn<T>,
        options: QueryOptions<T>,
        focus: Option<&FocusSignal>,
    ) -> Arc<Self> {
        let query = Arc::new(Self {
            key: key.into(),
            manager,
            fetch,
            options,
            state: RwLock::new(QueryState::default()),
            state_listeners: RwLock::new(Vec::new()),
            success_listeners: RwLock::new(Vec::new()),
            error_listeners: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        let initial = Arc::clone(&query);
        let handle = tokio::spawn(async move {
            let _ = initial.execute(false).await;
        });
        query.tasks.lock().push(handle);

        if query.options.refetch_on_window_focus {
            if let Some(focus) = focus {
                query.hook_focus(focus);
            }
        }

        query
    }

    fn hook_focus(self: &Arc<Self>, focus: &FocusSignal) {
        let mut rx = focus.subscribe();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let Some(query) = weak.upgrade() else { break };
                        if query.disposed.load(Ordering::SeqCst) {
                            break;
                        }
                        let _ = query.execute(true).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// The fingerprint this query observes.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState<T> {
        self.state.read().clone()
    }

    /// Force a fetch and update the state with its settlement.
    pub async fn refetch(self: &Arc<Self>) -> FetchResult<T> {
        self.execute(true).await
    }

    async fn execute(self: &Arc<Self>, force: bool) -> FetchResult<T> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(FetchError::Cancelled);
        }

        self.transition(|state| {
            state.is_loading = true;
            state.is_error = false;
            state.error = None;
        });

        let result = if force {
            self.manager.refresh(&self.key, Arc::clone(&self.fetch), &self.options.swr).await
        } else {
            self.manager.swr_with(&self.key, Arc::clone(&self.fetch), &self.options.swr).await
        };

        match &result {
            Ok(data) => {
                let now = self.manager.clock.now_ms();
                self.transition(|state| {
                    state.data = Some(data.clone());
                    state.error = None;
                    state.is_loading = false;
                    state.is_success = true;
                    state.is_error = false;
                    state.is_stale = false;
                    state.last_fetched_at = Some(now);
                });
                self.notify_success(data);
            }
            Err(error) => {
                self.transition(|state| {
                    state.error = Some(error.clone());
                    state.is_loading = false;
                    state.is_success = false;
                    state.is_error = true;
                    state.is_stale = false;
                });
                self.notify_error(error);
            }
        }

        result
    }

    /// Optimistic update: set the data locally and write it through to
    /// the cache.
    pub fn set_data(self: &Arc<Self>, data: T) {
        self.manager.set(&self.key, data.clone(), &self.options.swr);
        let now = self.manager.clock.now_ms();
        self.transition(|state| {
            state.data = Some(data);
            state.error = None;
            state.is_loading = false;
            state.is_success = true;
            state.is_error = false;
            state.is_stale = false;
            state.last_fetched_at = Some(now);
        });
    }

    /// Flag the data as stale, refetching unless configured not to.
    pub fn mark_stale(self: &Arc<Self>) {
        self.transition(|state| state.is_stale = true);

        if self.options.refetch_on_stale && !self.disposed.load(Ordering::SeqCst) {
            let query = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let _ = query.execute(true).await;
            });
            self.tasks.lock().push(handle);
        }
    }

    /// Observe every state change. Returns the subscription id.
    pub fn subscribe<F>(&self, listener: F) -> Uuid
    where
        F: Fn(&QueryState<T>) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.state_listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Observe successful settlements. Returns the subscription id.
    pub fn on_success<F>(&self, listener: F) -> Uuid
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.success_listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Observe failed settlements. Returns the subscription id.
    pub fn on_error<F>(&self, listener: F) -> Uuid
    where
        F: Fn(&FetchError) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.error_listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener registered through any of the subscribe
    /// methods. Returns whether it existed.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut removed = false;
        {
            let mut listeners = self.state_listeners.write();
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            removed |= listeners.len() != before;
        }
        {
            let mut listeners = self.success_listeners.write();
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            removed |= listeners.len() != before;
        }
        {
            let mut listeners = self.error_listeners.write();
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    fn transition<F>(&self, mutate: F)
    where
        F: FnOnce(&mut QueryState<T>),
    {
        let snapshot = {
            let mut state = self.state.write();
            mutate(&mut state);
            state.clone()
        };
        let listeners: Vec<StateListener<T>> =
            self.state_listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn notify_success(&self, data: &T) {
        let listeners: Vec<SuccessListener<T>> =
            self.success_listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(data);
        }
    }

    fn notify_error(&self, error: &FetchError) {
        let listeners: Vec<ErrorListener> =
            self.error_listeners.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(error);
        }
    }

    /// Stop all background work and drop every listener.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.state_listeners.write().clear();
        self.success_listeners.write().clear();
        self.error_listeners.write().clear();
    }
}

impl<T> Drop for Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
