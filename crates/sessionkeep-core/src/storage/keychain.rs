use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use keyring::Entry;

use super::KeyValueStore;
use crate::error::StoreError;

/// Default keychain service name
pub const DEFAULT_SERVICE_NAME: &str = "sessionkeep";

/// Key-value store backed by the OS keychain.
///
/// Each key is a keychain entry under one service name. The keychain cannot
/// be enumerated, so `keys()` reports the keys this instance has written or
/// found.
pub struct KeyringStore {
    service: String,
    entries: Mutex<HashMap<String, Entry>>,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Entry) -> Result<T, keyring::Error>,
    ) -> Result<T, keyring::Error> {
        let mut entries = self.entries();
        if !entries.contains_key(key) {
            let entry = Entry::new(&self.service, key)?;
            entries.insert(key.to_string(), entry);
        }
        match entries.get(key) {
            Some(entry) => f(entry),
            None => Err(keyring::Error::NoEntry),
        }
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

fn backend_error(action: &str, e: keyring::Error) -> StoreError {
    StoreError::Backend(format!("Failed to {} keychain entry: {}", action, e))
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.with_entry(key, |entry| entry.get_password()) {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(backend_error("read", e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_entry(key, |entry| entry.set_password(value))
            .map_err(|e| backend_error("store", e))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let result = match self.with_entry(key, |entry| entry.delete_credential()) {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(backend_error("delete", e)),
        };
        self.entries().remove(key);
        result
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = self.entries();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.get_password().is_ok())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
