//! Entry serialization for the persistence backends.
//!
//! Entries are stored as JSON; reported sizes are serialized character
//! count × 2, a UTF-16 storage proxy that matches how string stores
//! account their quota.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::entry::CacheEntry;
use crate::error::PersistResult;

/// Serialize an entry to its stored JSON form.
pub fn serialize_entry<T: Serialize>(entry: &CacheEntry<T>) -> PersistResult<String> {
    Ok(serde_json::to_string(entry)?)
}

/// Reconstruct an entry from its stored JSON form.
pub fn deserialize_entry<T: DeserializeOwned>(raw: &str) -> PersistResult<CacheEntry<T>> {
    Ok(serde_json::from_str(raw)?)
}

/// Storage cost of a serialized entry in bytes.
pub fn stored_size(raw: &str) -> usize {
    raw.len() * 2
}
