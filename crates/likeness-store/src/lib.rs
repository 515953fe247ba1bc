//! likeness-store: identity profile persistence and blob storage.
//!
//! Profiles live in SQLite (one row per subject, embedding as an opaque
//! blob). Reference images live in a [`Storage`] backend and are tracked
//! by key.

pub mod cipher;
pub mod profiles;
pub mod storage;

pub use cipher::{CipherError, EmbeddingCipher};
pub use profiles::{ProfileStore, StoreError, StoredProfile, UpsertOutcome};
pub use storage::{LocalStorage, Storage, StorageError};
