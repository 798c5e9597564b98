//! SQLite implementation of [`StateStorage`].
//!
//! [`SqliteStorage`] keeps one row per key in the `documents` table. Every
//! write runs in a transaction, so a write rejected by the quota leaves the
//! previous value untouched.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::StorageError;
use crate::traits::{check_quota, StateStorage};

pub struct SqliteStorage {
    conn: Connection,
    quota: Option<usize>,
}

impl SqliteStorage {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path.as_ref())?;
        Ok(SqliteStorage { conn, quota: None })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStorage { conn, quota: None })
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
    pub fn used_bytes(&self) -> Result<usize, StorageError> {
        let bytes: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM documents",
            [],
            |row| row.get(0),
        )?;
        Ok(bytes.max(0) as usize)
    }
}

impl StateStorage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM documents WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        if self.quota.is_some() {
            let others: i64 = tx.query_row(
                "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM documents WHERE key != ?1",
                params![key],
                |row| row.get(0),
            )?;
            check_quota(self.quota, others.max(0) as usize, value)?;
        }
        tx.execute(
            "INSERT INTO documents (key, value, updated_at) VALUES (?1, ?2, strftime('%s', 'now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        tx.commit()?;
        debug!(key, bytes = value.len(), "stored document");
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool, StorageError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM documents WHERE key = ?1", params![key])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT key FROM documents ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_replace() {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.set("doc", "{\"a\":1}").unwrap();
        storage.set("doc", "{\"a\":2}").unwrap();
        assert_eq!(storage.get("doc").unwrap().as_deref(), Some("{\"a\":2}"));
        assert_eq!(storage.keys().unwrap(), vec!["doc".to_string()]);
    }

    #[test]
    fn test_missing_key_is_none() {
        let mut storage = SqliteStorage::in_memory().unwrap();
        assert_eq!(storage.get("nope").unwrap(), None);
        assert!(!storage.remove("nope").unwrap());
    }

    #[test]
    fn test_quota_rejects_without_clobbering() {
        let mut storage = SqliteStorage::in_memory().unwrap().with_quota(8);
        storage.set("k", "1234").unwrap();
        storage.set("j", "5678").unwrap();
        let err = storage.set("k", "12345").unwrap_err();
        assert!(err.is_quota());
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("1234"));
        assert_eq!(storage.used_bytes().unwrap(), 8);
    }

    #[test]
    fn test_quota_counts_bytes_not_chars() {
        let mut storage = SqliteStorage::in_memory().unwrap().with_quota(3);
        // Two characters, four bytes.
        assert!(storage.set("k", "éé").unwrap_err().is_quota());
    }
}
