use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use super::{KeyValueStore, StorageEvent};
use crate::error::StoreError;

/// Capacity of the change-notification channel. Slow watchers lag rather than block writers.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Inner {
    entries: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
    events: broadcast::Sender<StorageEvent>,
}

/// In-process key-value store.
///
/// Clone is cheap and clones share the same entries, so several session
/// stores built over clones behave like browser tabs over one profile.
/// An optional byte quota (key length plus value length) makes writes fail
/// the way local storage does when full.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_quota(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(BTreeMap::new()),
                quota,
                events,
            }),
        }
    }

    /// Bytes currently used
    pub fn used_bytes(&self) -> usize {
        Self::usage(&self.entries())
    }

    fn usage(entries: &BTreeMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, key: &str, value: Option<&str>) {
        // No receivers is fine
        let _ = self.inner.events.send(StorageEvent {
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut entries = self.entries();
            if let Some(quota) = self.inner.quota {
                let current = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
                let used = Self::usage(&entries) - current + key.len() + value.len();
                if used > quota {
                    return Err(StoreError::QuotaExceeded { used, quota });
                }
            }
            entries.insert(key.to_string(), value.to_string());
        }
        self.notify(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let existed = self.entries().remove(key).is_some();
        if existed {
            self.notify(key, None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries().keys().cloned().collect())
    }

    fn watch(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        Some(self.inner.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_entries() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("k", "v").unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(b.keys().unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_quota_rejects_oversized_write_and_keeps_old_value() {
        let store = MemoryStore::with_quota(10);
        store.set("k", "12345").unwrap();
        assert_eq!(store.used_bytes(), 6);

        let err = store.set("k", "0123456789").unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { quota: 10, .. }));
        assert_eq!(store.get("k").unwrap().as_deref(), Some("12345"));

        // Replacing a value only counts the difference
        store.set("k", "123456789").unwrap();
        assert_eq!(store.used_bytes(), 10);
    }

    #[test]
    fn test_remove_missing_key_is_ok() {
        let store = MemoryStore::new();
        assert!(store.remove("nothing").is_ok());
    }

    #[test]
    fn test_watch_sees_sets_and_removes() {
        let store = MemoryStore::new();
        let mut rx = store.watch().unwrap();

        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        store.remove("k").unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            StorageEvent { key: "k".into(), value: Some("v".into()) }
        );
        assert_eq!(rx.try_recv().unwrap(), StorageEvent { key: "k".into(), value: None });
        // Removing a missing key emits nothing
        assert!(rx.try_recv().is_err());
    }
}
