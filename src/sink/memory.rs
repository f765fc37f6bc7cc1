//! In-memory document store.

use super::{DocumentStore, SinkError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    /// (collection, key) in write order
    writes: Vec<(String, String)>,
}

/// Document store held in process memory.
///
/// Availability can be toggled to simulate an outage.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Successful writes in the order they happened.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.lock().writes.clone()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock().collections.get(collection).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().collections.values().all(BTreeMap::is_empty)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), SinkError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(SinkError::Unavailable("memory store offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn put(&self, collection: &str, key: &str, document: &Value) -> Result<(), SinkError> {
        self.check()?;
        let mut inner = self.lock();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), document.clone());
        inner.writes.push((collection.to_string(), key.to_string()));
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, SinkError> {
        self.check()?;
        Ok(self.lock().collections.get(collection).and_then(|c| c.get(key)).cloned())
    }

    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, SinkError> {
        self.check()?;
        Ok(self
            .lock()
            .collections
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_list() {
        let store = MemoryStore::new();
        store.put("baselines", "S2", &json!({"v": 1})).unwrap();
        store.put("baselines", "S1", &json!({"v": 2})).unwrap();
        store.put("baselines", "S2", &json!({"v": 3})).unwrap();

        assert_eq!(store.get("baselines", "S2").unwrap(), Some(json!({"v": 3})));
        assert_eq!(store.get("alerts", "S2").unwrap(), None);

        let keys: Vec<String> = store.list("baselines").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["S1", "S2"]);
        assert_eq!(store.writes().len(), 3);
    }

    #[test]
    fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.put("alerts", "k", &json!({})).unwrap_err();
        assert!(err.is_retryable());
        assert!(store.is_empty());
    }
}
