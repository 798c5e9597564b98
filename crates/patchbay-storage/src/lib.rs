//! Persistence for patchbay graphs.
//!
//! Provides the [`StateStorage`] key/value trait with [`InMemoryStorage`] and
//! [`SqliteStorage`] backends, and the [`Persister`] that writes the
//! persisted-state document through them.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`traits`]: StateStorage trait definition
//! - [`memory`]: InMemoryStorage implementation
//! - [`schema`]: migration setup for SQLite
//! - [`sqlite`]: SqliteStorage implementation
//! - [`hash`]: blake3 content hashing
//! - [`persister`]: document save/load with quota fallback

pub mod error;
pub mod hash;
pub mod memory;
pub mod persister;
pub mod schema;
pub mod sqlite;
pub mod traits;

// Re-export key types for ergonomic use.
pub use error::StorageError;
pub use hash::{hash_state, hash_text};
pub use memory::InMemoryStorage;
pub use persister::{Persister, SaveOutcome};
pub use sqlite::SqliteStorage;
pub use traits::StateStorage;
