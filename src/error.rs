//! Error types for the data-access layer.
//!
//! Two taxonomies exist: [`FetchError`] classifies request and cache
//! failures the way callers need to branch on them (retryable transport
//! failures vs. terminal client errors vs. local conditions), and
//! [`PersistError`] covers the storage backends. Persistence failures that
//! cross the cache-manager boundary are folded into [`FetchError`].
//!
//! All variants carry owned strings so errors stay `Clone`; a deduplicated
//! in-flight request hands the same failure to every waiter.

use thiserror::Error;

/// Request and cache-layer errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Transport-level failure (DNS, connection reset, TLS).
    #[error("Network error: {0}")]
    Network(String),

    /// Deadline exceeded while waiting for a fetch to settle.
    #[error("Timeout after {0} ms")]
    Timeout(u64),

    /// The caller aborted the request.
    #[error("Request cancelled")]
    Cancelled,

    /// A 4xx response.
    #[error("Client error ({status}): {message}")]
    Client {
        /// HTTP status code.
        status: u16,
        /// Response status text or body excerpt.
        message: String,
    },

    /// A 5xx response.
    #[error("Server error ({status}): {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response status text or body excerpt.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A validator rejected fetched data.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// `should_fetch` returned false and no cached fallback exists.
    #[error("Fetch condition not met for key: {0}")]
    ConditionUnmet(String),

    /// Persistence storage is full.
    #[error("Storage quota exceeded: {0}")]
    Quota(String),

    /// Anything that does not fit the categories above.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl FetchError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Client errors, validation failures, and unmet conditions are
    /// terminal; transport, timeout, and server errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::Server { .. }
        )
    }
}

/// Result type for request and cache operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Persistence-layer errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistError {
    /// The underlying store failed (I/O, corruption).
    #[error("Storage error: {0}")]
    Storage(String),

    /// A write would exceed the configured quota, and cleanup did not
    /// free enough space.
    #[error("Quota exceeded: {0}")]
    Quota(String),

    /// Entry (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A fallback chain was constructed with no backends.
    #[error("Fallback chain requires at least one backend")]
    EmptyChain,

    /// The requested backend could not be constructed.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Result type for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

impl From<PersistError> for FetchError {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::Quota(msg) => FetchError::Quota(msg),
            other => FetchError::Unknown(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for PersistError {
    fn from(err: sled::Error) -> Self {
        PersistError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Network("reset".into()).is_retryable());
        assert!(FetchError::Timeout(30_000).is_retryable());
        assert!(FetchError::Server { status: 503, message: "unavailable".into() }.is_retryable());
        assert!(!FetchError::Client { status: 404, message: "not found".into() }.is_retryable());
        assert!(!FetchError::Validation("bad shape".into()).is_retryable());
        assert!(!FetchError::Cancelled.is_retryable());
    }

    #[test]
    fn test_persist_error_conversion() {
        let quota: FetchError = PersistError::Quota("5 MB limit".into()).into();
        assert!(matches!(quota, FetchError::Quota(_)));

        let storage: FetchError = PersistError::Storage("disk".into()).into();
        assert!(matches!(storage, FetchError::Unknown(_)));
    }
}
