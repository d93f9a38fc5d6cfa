//! Retry with backoff.
//!
//! One delay strategy serves both the cache manager's background
//! revalidation and standalone callers. The default is exponential
//! backoff capped at 30 seconds; a custom function receives the attempt
//! number and the error that triggered the retry.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{FetchError, FetchResult};

/// Attempt-delay strategy.
#[derive(Clone)]
pub enum RetryDelay {
    /// The same delay between every attempt.
    Fixed(Duration),
    /// `min(base · 2^attempt, max)`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound on any single delay.
        max: Duration,
    },
    /// Caller-supplied delay math.
    Custom(Arc<dyn Fn(u32, &FetchError) -> Duration + Send + Sync>),
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryDelay::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            RetryDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryDelay {
    /// Delay before retrying `attempt` (0-based) after `error`.
    pub fn delay_for(&self, attempt: u32, error: &FetchError) -> Duration {
        match self {
            RetryDelay::Fixed(d) => *d,
            RetryDelay::Exponential { base, max } => {
                let factor = 2u64.saturating_pow(attempt);
                let delayed = base.as_millis() as u64 * factor;
                Duration::from_millis(delayed.min(max.as_millis() as u64))
            }
            RetryDelay::Custom(f) => f(attempt, error),
        }
    }
}

/// Retry policy: attempt count, delay strategy, optional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay strategy between attempts.
    pub delay: RetryDelay,
    /// Randomize each delay by ±30% to avoid retry alignment.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, delay: RetryDelay::default(), jitter: false }
    }
}

impl RetryPolicy {
    /// Concrete sleep duration before retrying `attempt` after `error`.
    pub fn sleep_for(&self, attempt: u32, error: &FetchError) -> Duration {
        let base = self.delay.delay_for(attempt, error);
        if !self.jitter {
            return base;
        }
        let ms = base.as_millis() as f64;
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((ms * factor).max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// The final error is the last attempt's error. Attempts are numbered
/// from zero; the attempt count is `max_retries + 1` in the worst case.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> FetchResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = FetchResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.max_retries {
                    return Err(error);
                }
                let delay = policy.sleep_for(attempt, &error);
                log::debug!(
                    "retrying after {:?} (attempt {}/{}): {}",
                    delay,
                    attempt + 1,
                    policy.max_retries,
                    error
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
