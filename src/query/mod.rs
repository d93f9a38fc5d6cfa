//! Subscribable queries over cached fingerprints.

pub mod manager;
pub mod query;

pub use manager::QueryManager;
pub use query::{FocusSignal, Query, QueryOptions, QueryState};
