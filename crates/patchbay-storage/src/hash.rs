//! Deterministic content hashing using blake3.
//!
//! Hashes are derived state, never stored. The persister compares the hash
//! of each serialized document with the last one it wrote and skips
//! redundant writes. Graph maps are insertion-ordered `IndexMap`s, so the
//! same state always serializes to the same bytes.

use patchbay_core::GraphState;

use crate::error::StorageError;

/// Hashes serialized document text.
pub fn hash_text(text: &str) -> blake3::Hash {
    blake3::hash(text.as_bytes())
}

/// Hashes a graph snapshot (nodes and connections only).
pub fn hash_state(state: &GraphState) -> Result<blake3::Hash, StorageError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&serde_json::to_vec(state)?);
    Ok(hasher.finalize())
}
