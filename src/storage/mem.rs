//! In-memory object store for tests and local runs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use super::{ObjectStore, StorageError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("memory store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.inner
            .lock()
            .expect("memory store lock")
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn put(&self, key: &str, payload: Bytes) -> Result<(), StorageError> {
        self.inner
            .lock()
            .expect("memory store lock")
            .insert(key.to_string(), payload);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .inner
            .lock()
            .expect("memory store lock")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_sorted_by_key() {
        let store = MemoryStore::new();
        store.put("s/z", Bytes::new()).unwrap();
        store.put("s/a", Bytes::new()).unwrap();
        assert_eq!(store.list("s/").unwrap(), vec!["s/a", "s/z"]);
    }
}
