//! The [`StateStorage`] trait: a string key/value store for persisted
//! documents.
//!
//! Backends ([`InMemoryStorage`](crate::InMemoryStorage),
//! [`SqliteStorage`](crate::SqliteStorage)) are fully swappable. The trait is
//! synchronous, matching the single-writer design of the graph store.

use crate::error::StorageError;

/// Key/value contract every storage backend implements.
pub trait StateStorage {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// Fails with [`StorageError::QuotaExceeded`] when the backend has a byte
    /// quota and the write would exceed it. A failed write leaves the previous
    /// value in place.
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removes `key`. Returns whether a value was present.
    fn remove(&mut self, key: &str) -> Result<bool, StorageError>;

    /// Lists every stored key in ascending order.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Checks a prospective write against an optional quota.
///
/// `others` is the byte size of every value except the one being replaced.
pub(crate) fn check_quota(quota: Option<usize>, others: usize, value: &str) -> Result<(), StorageError> {
    match quota {
        Some(limit) if others + value.len() > limit => Err(StorageError::QuotaExceeded {
            needed: others + value.len(),
            limit,
        }),
        _ => Ok(()),
    }
}
