//! In-memory implementation of [`StateStorage`].
//!
//! [`InMemoryStorage`] is a first-class backend for tests and ephemeral
//! sessions. It has the same quota semantics as the SQLite backend.

use std::collections::BTreeMap;

use crate::error::StorageError;
use crate::traits::{check_quota, StateStorage};

#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    values: BTreeMap<String, String>,
    quota: Option<usize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the total byte size of all stored values.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn quota(&self) -> Option<usize> {
        self.quota
    }

    /// Total byte size of all stored values.
    pub fn used_bytes(&self) -> usize {
        self.values.values().map(String::len).sum()
    }
}

impl StateStorage for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let replaced = self.values.get(key).map_or(0, String::len);
        check_quota(self.quota, self.used_bytes() - replaced, value)?;
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool, StorageError> {
        Ok(self.values.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.values.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut storage = InMemoryStorage::new();
        assert_eq!(storage.get("a").unwrap(), None);
        storage.set("a", "one").unwrap();
        storage.set("a", "two").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("two"));
        assert!(storage.remove("a").unwrap());
        assert!(!storage.remove("a").unwrap());
        assert_eq!(storage.get("a").unwrap(), None);
    }

    #[test]
    fn test_keys_are_sorted() {
        let mut storage = InMemoryStorage::new();
        storage.set("b", "").unwrap();
        storage.set("a", "").unwrap();
        assert_eq!(storage.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_quota_counts_replaced_value_once() {
        let mut storage = InMemoryStorage::new().with_quota(10);
        storage.set("k", "12345678").unwrap();
        // Replacing frees the old value first.
        storage.set("k", "1234567890").unwrap();
        let err = storage.set("other", "x").unwrap_err();
        assert!(err.is_quota());
        assert_eq!(storage.used_bytes(), 10);
    }

    #[test]
    fn test_failed_write_keeps_previous_value() {
        let mut storage = InMemoryStorage::new().with_quota(4);
        storage.set("k", "abc").unwrap();
        assert!(matches!(
            storage.set("k", "abcdef"),
            Err(StorageError::QuotaExceeded { needed: 6, limit: 4 })
        ));
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("abc"));
    }
}
