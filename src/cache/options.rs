//! SWR options and per-call overrides.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::RetryDelay;

/// Accepts or rejects fetched data before it enters the cache.
pub type Validator<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Gate evaluated before any fetch is dispatched.
pub type ShouldFetch = Arc<dyn Fn() -> bool + Send + Sync>;

/// Cooperative cancellation handle raced against in-flight fetches.
///
/// Calling [`tokio::sync::Notify::notify_waiters`] aborts every fetch
/// carrying this signal with a cancel error.
pub type CancelSignal = Arc<tokio::sync::Notify>;

/// Resolved options governing one SWR read.
#[derive(Clone)]
pub struct SwrOptions<T> {
    /// How long an entry stays fresh after insertion.
    pub stale_time: Duration,
    /// How long an entry stays usable after insertion.
    pub cache_time: Duration,
    /// Whether stale reads schedule a background revalidation.
    pub revalidate: bool,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay strategy between attempts.
    pub retry_delay: RetryDelay,
    /// Deadline for a single fetch attempt.
    pub timeout: Duration,
    /// Data validator applied to cached and fetched values.
    pub validator: Option<Validator<T>>,
    /// Fetch gate; a false result suppresses the fetch.
    pub should_fetch: Option<ShouldFetch>,
    /// External cancel signal aborting in-flight fetches.
    pub cancel: Option<CancelSignal>,
    /// Minimum spacing between revalidations of one fingerprint.
    pub throttle_time: Duration,
    /// Quiet period collapsing bursts of revalidation requests.
    pub debounce_time: Duration,
    /// Revalidation priority; greater than zero routes through the queue.
    pub priority: u32,
    /// Whether the fingerprint should be kept warm.
    pub warm_cache: bool,
    /// Spacing of warming refreshes.
    pub warming_interval: Duration,
}

impl<T> Default for SwrOptions<T> {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(300),
            revalidate: true,
            max_retries: 3,
            retry_delay: RetryDelay::default(),
            timeout: Duration::from_secs(30),
            validator: None,
            should_fetch: None,
            cancel: None,
            throttle_time: Duration::ZERO,
            debounce_time: Duration::ZERO,
            priority: 0,
            warm_cache: false,
            warming_interval: Duration::from_secs(300),
        }
    }
}

impl<T> fmt::Debug for SwrOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwrOptions")
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("revalidate", &self.revalidate)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .field("should_fetch", &self.should_fetch.as_ref().map(|_| "<fn>"))
            .field("cancel", &self.cancel.is_some())
            .field("throttle_time", &self.throttle_time)
            .field("debounce_time", &self.debounce_time)
            .field("priority", &self.priority)
            .field("warm_cache", &self.warm_cache)
            .field("warming_interval", &self.warming_interval)
            .finish()
    }
}

impl<T> SwrOptions<T> {
    /// Apply per-call overrides on top of these defaults.
    pub fn merge(&self, overrides: &SwrOverrides<T>) -> SwrOptions<T> {
        SwrOptions {
            stale_time: overrides.stale_time.unwrap_or(self.stale_time),
            cache_time: overrides.cache_time.unwrap_or(self.cache_time),
            revalidate: overrides.revalidate.unwrap_or(self.revalidate),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            retry_delay: overrides.retry_delay.clone().unwrap_or_else(|| self.retry_delay.clone()),
            timeout: overrides.timeout.unwrap_or(self.timeout),
            validator: overrides.validator.clone().or_else(|| self.validator.clone()),
            should_fetch: overrides.should_fetch.clone().or_else(|| self.should_fetch.clone()),
            cancel: overrides.cancel.clone().or_else(|| self.cancel.clone()),
            throttle_time: overrides.throttle_time.unwrap_or(self.throttle_time),
            debounce_time: overrides.debounce_time.unwrap_or(self.debounce_time),
            priority: overrides.priority.unwrap_or(self.priority),
            warm_cache: overrides.warm_cache.unwrap_or(self.warm_cache),
            warming_interval: overrides.warming_interval.unwrap_or(self.warming_interval),
        }
    }

    /// Should a fetch be dispatched right now?
    pub fn fetch_allowed(&self) -> bool {
        self.should_fetch.as_ref().map_or(true, |gate| gate())
    }
}

/// Per-call option overrides. Unset fields fall back to the manager's
/// defaults.
#[derive(Clone)]
pub struct SwrOverrides<T> {
    /// Replaces the derived fingerprint entirely.
    pub cache_key: Option<String>,
    /// See [`SwrOptions::stale_time`].
    pub stale_time: Option<Duration>,
    /// See [`SwrOptions::cache_time`].
    pub cache_time: Option<Duration>,
    /// See [`SwrOptions::revalidate`].
    pub revalidate: Option<bool>,
    /// See [`SwrOptions::max_retries`].
    pub max_retries: Option<u32>,
    /// See [`SwrOptions::retry_delay`].
    pub retry_delay: Option<RetryDelay>,
    /// See [`SwrOptions::timeout`].
    pub timeout: Option<Duration>,
    /// See [`SwrOptions::validator`].
    pub validator: Option<Validator<T>>,
    /// See [`SwrOptions::should_fetch`].
    pub should_fetch: Option<ShouldFetch>,
    /// See [`SwrOptions::cancel`].
    pub cancel: Option<CancelSignal>,
    /// See [`SwrOptions::throttle_time`].
    pub throttle_time: Option<Duration>,
    /// See [`SwrOptions::debounce_time`].
    pub debounce_time: Option<Duration>,
    /// See [`SwrOptions::priority`].
    pub priority: Option<u32>,
    /// See [`SwrOptions::warm_cache`].
    pub warm_cache: Option<bool>,
    /// See [`SwrOptions::warming_interval`].
    pub warming_interval: Option<Duration>,
}

impl<T> Default for SwrOverrides<T> {
    fn default() -> Self {
        Self {
            cache_key: None,
            stale_time: None,
            cache_time: None,
            revalidate: None,
            max_retries: None,
            retry_delay: None,
            timeout: None,
            validator: None,
            should_fetch: None,
            cancel: None,
            throttle_time: None,
            debounce_time: None,
            priority: None,
            warm_cache: None,
            warming_interval: None,
        }
    }
}

impl<T> fmt::Debug for SwrOverrides<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwrOverrides")
            .field("cache_key", &self.cache_key)
            .field("stale_time", &self.stale_time)
            .field("cache_time", &self.cache_time)
            .field("revalidate", &self.revalidate)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
