//! Persistent key-value storage backing the session store.
//!
//! This module provides:
//! - `KeyValueStore`: the string-keyed, string-valued store the session lives in
//! - `MemoryStore`: in-process store, shareable between contexts, with change notifications
//! - `FileStore`: one file per key in a directory
//! - `KeyringStore`: values kept in the OS keychain
//!
//! Values are always text, mirroring browser local storage.

pub mod file;
pub mod keychain;
pub mod memory;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StoreError;

pub use keychain::KeyringStore;
pub use file::FileStore;
pub use memory::MemoryStore;

/// Raw bearer token (legacy/simple layout)
pub const AUTH_TOKEN_KEY: &str = "authToken";
/// Principal identifier (legacy/simple layout)
pub const USER_ID_KEY: &str = "userId";
/// JSON record of the full session
pub const SESSION_DATA_KEY: &str = "sessionData";
/// `expiresAt` as a decimal string, kept in sync with the session record
pub const SESSION_EXPIRY_KEY: &str = "sessionExpiry";
/// Codec-encoded full session record; wins over `sessionData` on read
pub const SECURE_SESSION_KEY: &str = "secure_session";
/// Written then deleted to announce a logout to other contexts
pub const LOGOUT_EVENT_KEY: &str = "logout_event";

/// Every key owned by the session store, in removal order.
pub const SESSION_KEYS: [&str; 5] = [
    AUTH_TOKEN_KEY,
    USER_ID_KEY,
    SESSION_DATA_KEY,
    SESSION_EXPIRY_KEY,
    SECURE_SESSION_KEY,
];

/// A change observed on a shared store. `value` is `None` for removals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub value: Option<String>,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Subscribe to changes made through any handle on the same underlying store.
    /// Backends without change notification return `None`.
    fn watch(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        None
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        (**self).remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        (**self).keys()
    }

    fn watch(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        (**self).watch()
    }
}

/// Remove entries that carry their own expiry and are past it.
///
/// An entry qualifies when its value is a JSON object with a numeric
/// `expiresAt` (milliseconds since epoch) earlier than `now_millis`.
/// Keys in `keep` are never touched. Returns the number of entries removed.
pub fn purge_expired(store: &dyn KeyValueStore, now_millis: i64, keep: &[&str]) -> usize {
    let keys = match store.keys() {
        Ok(keys) => keys,
        Err(e) => {
            debug!(error = %e, "Failed to list keys for cleanup");
            return 0;
        }
    };

    let mut removed = 0;
    for key in keys.iter().filter(|k| !keep.contains(&k.as_str())) {
        let Ok(Some(value)) = store.get(key) else {
            continue;
        };
        let expires_at = serde_json::from_str::<serde_json::Value>(&value)
            .ok()
            .and_then(|v| v.get("expiresAt").and_then(|e| e.as_i64()));

        if matches!(expires_at, Some(at) if at < now_millis) {
            match store.remove(key) {
                Ok(()) => removed += 1,
                Err(e) => debug!(key = %key, error = %e, "Failed to remove expired entry"),
            }
        }
    }

    if removed > 0 {
        debug!(removed, "Purged expired storage entries");
    }
    removed
}
