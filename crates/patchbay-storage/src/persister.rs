//! Saves and loads the persisted-state document through a [`StateStorage`].
//!
//! Saving skips the write when the serialized document hashes the same as
//! the last one written. When the backend reports quota exhaustion, the save
//! is retried once with the undo history dropped; if that also fails the
//! error is logged and returned. Loading never fails: storage errors and
//! unreadable documents both yield an empty graph.

use patchbay_core::{GraphStore, NodeRegistry, PersistedDocument, StoreConfig, STORAGE_KEY};
use tracing::{debug, error, warn};

use crate::error::StorageError;
use crate::hash::hash_text;
use crate::traits::StateStorage;

/// What a successful [`Persister::save`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// The document matched the last write; storage was not touched.
    Unchanged,
    /// The full document hit the quota; the graph was stored without history.
    WrittenWithoutHistory,
}

pub struct Persister<S: StateStorage> {
    storage: S,
    key: String,
    last_hash: Option<blake3::Hash>,
}

impl<S: StateStorage> Persister<S> {
    pub fn new(storage: S) -> Self {
        Self::with_key(storage, STORAGE_KEY)
    }

    pub fn with_key(storage: S, key: impl Into<String>) -> Self {
        Persister {
            storage,
            key: key.into(),
            last_hash: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    /// Persists the store's graph, selection and history.
    pub fn save(&mut self, store: &GraphStore) -> Result<SaveOutcome, StorageError> {
        self.save_document(PersistedDocument::from_store(store))
    }

    pub fn save_document(&mut self, mut document: PersistedDocument) -> Result<SaveOutcome, StorageError> {
        let text = serde_json::to_string(&document)?;
        let hash = hash_text(&text);
        if self.last_hash == Some(hash) {
            debug!(key = %self.key, "document unchanged, skipping write");
            return Ok(SaveOutcome::Unchanged);
        }

        match self.storage.set(&self.key, &text) {
            Ok(()) => {
                self.last_hash = Some(hash);
                Ok(SaveOutcome::Written)
            }
            Err(err) if err.is_quota() => {
                warn!(%err, entries = document.state.history.len(), "storage quota hit, retrying without history");
                document.clear_history();
                let text = serde_json::to_string(&document)?;
                match self.storage.set(&self.key, &text) {
                    Ok(()) => {
                        self.last_hash = Some(hash_text(&text));
                        Ok(SaveOutcome::WrittenWithoutHistory)
                    }
                    Err(err) => {
                        error!(%err, key = %self.key, "failed to save graph");
                        Err(err)
                    }
                }
            }
            Err(err) => {
                error!(%err, key = %self.key, "failed to save graph");
                Err(err)
            }
        }
    }

    /// Reads and migrates the stored document. Never fails.
    pub fn load_document(&mut self) -> PersistedDocument {
        match self.storage.get(&self.key) {
            Ok(Some(text)) => {
                self.last_hash = Some(hash_text(&text));
                PersistedDocument::from_json(&text)
            }
            Ok(None) => PersistedDocument::default(),
            Err(err) => {
                warn!(%err, key = %self.key, "could not read stored graph, starting empty");
                PersistedDocument::default()
            }
        }
    }

    /// Loads a ready-to-edit store. Never fails.
    pub fn load(&mut self, registry: NodeRegistry, config: StoreConfig) -> GraphStore {
        self.load_document().into_store(registry, config)
    }

    /// Deletes the stored document.
    pub fn clear(&mut self) -> Result<bool, StorageError> {
        self.last_hash = None;
        self.storage.remove(&self.key)
    }
}
