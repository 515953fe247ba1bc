//! SQLite store for identity profiles.
//!
//! One row per subject. The embedding is an opaque blob (little-endian
//! `f32`s, optionally AES-GCM sealed); the reference image lives in blob
//! storage and only its key and URL are kept here.

use std::path::Path;

use chrono::{DateTime, Utc};
use likeness_core::{Embedding, IdentityProfile};
use rusqlite::{params, OptionalExtension, Row};
use thiserror::Error;
use tokio_rusqlite::Connection;

use crate::cipher::{CipherError, EmbeddingCipher};

const SCHEMA_VERSION: i64 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("embedding for {0} is encrypted but no embedding key is configured")]
    MissingKey(String),
    #[error("embedding cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("corrupt profile row for {subject_id}: {reason}")]
    Corrupt { subject_id: String, reason: String },
}

/// A persisted profile, minus the reference image bytes.
#[derive(Debug, Clone)]
pub struct StoredProfile {
    pub subject_id: String,
    pub mean_embedding: Embedding,
    pub reference_key: String,
    pub reference_url: String,
    pub valid_face_count: usize,
    pub used_face_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredProfile {
    pub fn into_profile(self, reference_image: Vec<u8>) -> IdentityProfile {
        IdentityProfile {
            subject_id: self.subject_id,
            mean_embedding: self.mean_embedding,
            reference_image,
            reference_key: self.reference_key,
            reference_url: self.reference_url,
            valid_face_count: self.valid_face_count,
            used_face_count: self.used_face_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What an upsert replaced.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// Creation time of the row: the original one when an existing profile was replaced.
    pub created_at: DateTime<Utc>,
    /// Reference image key of the replaced profile, if any.
    pub previous_reference_key: Option<String>,
}

/// Raw column values, decoded outside the database thread.
struct RawRow {
    subject_id: String,
    embedding: Vec<u8>,
    embedding_dim: i64,
    model_version: Option<String>,
    encrypted: bool,
    reference_key: String,
    reference_url: String,
    valid_face_count: i64,
    used_face_count: i64,
    created_at: String,
    updated_at: String,
}

const SELECT_COLUMNS: &str = "subject_id, embedding, embedding_dim, model_version, encrypted, \
     reference_key, reference_url, valid_face_count, used_face_count, created_at, updated_at";

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            subject_id: row.get(0)?,
            embedding: row.get(1)?,
            embedding_dim: row.get(2)?,
            model_version: row.get(3)?,
            encrypted: row.get(4)?,
            reference_key: row.get(5)?,
            reference_url: row.get(6)?,
            valid_face_count: row.get(7)?,
            used_face_count: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

pub struct ProfileStore {
    conn: Connection,
    cipher: Option<EmbeddingCipher>,
}

impl ProfileStore {
    /// Open (creating if needed) the database at `path` and apply migrations.
    pub async fn open(path: &Path, cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
            }
        }
        let conn = Connection::open(path).await?;
        Self::init(conn, cipher).await
    }

    pub async fn open_in_memory(cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, cipher).await
    }

    async fn init(conn: Connection, cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let version = conn
            .call(|conn| {
                let version: i64 = conn.query_row("SELECT user_version FROM pragma_user_version", [], |row| row.get(0))?;
                if version < SCHEMA_VERSION {
                    conn.execute_batch(include_str!("migrations/001_identity_profiles.sql"))?;
                    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                }
                Ok(version)
            })
            .await?;
        tracing::debug!(from = version, to = SCHEMA_VERSION, "profile store ready");
        Ok(Self { conn, cipher })
    }

    /// Insert or atomically replace the profile for `profile.subject_id`.
    ///
    /// `created_at` of an existing row is preserved; everything else is overwritten.
    pub async fn upsert(&self, profile: &IdentityProfile) -> Result<UpsertOutcome, StoreError> {
        let plain = profile.mean_embedding.to_bytes();
        let (embedding, encrypted) = match &self.cipher {
            Some(cipher) => (cipher.seal(&plain)?, true),
            None => (plain, false),
        };

        let subject_id = profile.subject_id.clone();
        let embedding_dim = profile.mean_embedding.dim() as i64;
        let model_version = profile.mean_embedding.model_version.clone();
        let reference_key = profile.reference_key.clone();
        let reference_url = profile.reference_url.clone();
        let valid = profile.valid_face_count as i64;
        let used = profile.used_face_count as i64;
        let created_at = profile.created_at.to_rfc3339();
        let updated_at = profile.updated_at.to_rfc3339();

        let (stored_created_at, previous_reference_key) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous: Option<(String, String)> = tx
                    .query_row(
                        "SELECT reference_key, created_at FROM identity_profiles WHERE subject_id = ?1",
                        params![subject_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                tx.execute(
                    "INSERT INTO identity_profiles (subject_id, embedding, embedding_dim, model_version, encrypted, \
                         reference_key, reference_url, valid_face_count, used_face_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(subject_id) DO UPDATE SET \
                         embedding = excluded.embedding, \
                         embedding_dim = excluded.embedding_dim, \
                         model_version = excluded.model_version, \
                         encrypted = excluded.encrypted, \
                         reference_key = excluded.reference_key, \
                         reference_url = excluded.reference_url, \
                         valid_face_count = excluded.valid_face_count, \
                         used_face_count = excluded.used_face_count, \
                         updated_at = excluded.updated_at",
                    params![
                        subject_id,
                        embedding,
                        embedding_dim,
                        model_version,
                        encrypted,
                        reference_key,
                        reference_url,
                        valid,
                        used,
                        created_at,
                        updated_at
                    ],
                )?;
                tx.commit()?;

                Ok(match previous {
                    Some((key, created)) => (created, Some(key)),
                    None => (created_at, None),
                })
            })
            .await?;

        Ok(UpsertOutcome {
            created_at: parse_timestamp(&profile.subject_id, &stored_created_at)?,
            previous_reference_key: previous_reference_key.filter(|k| *k != profile.reference_key),
        })
    }

    pub async fn get(&self, subject_id: &str) -> Result<Option<StoredProfile>, StoreError> {
        let id = subject_id.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM identity_profiles WHERE subject_id = ?1");
                Ok(conn.query_row(&sql, params![id], RawRow::from_row).optional()?)
            })
            .await?;
        raw.map(|r| self.decode(r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<StoredProfile>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM identity_profiles ORDER BY subject_id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], RawRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(|r| self.decode(r)).collect()
    }

    /// Delete the profile. Returns its reference image key when a row existed.
    pub async fn delete(&self, subject_id: &str) -> Result<Option<String>, StoreError> {
        let id = subject_id.to_string();
        let key = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let key: Option<String> = tx
                    .query_row(
                        "SELECT reference_key FROM identity_profiles WHERE subject_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                tx.execute("DELETE FROM identity_profiles WHERE subject_id = ?1", params![id])?;
                tx.commit()?;
                Ok(key)
            })
            .await?;
        Ok(key)
    }

    fn decode(&self, raw: RawRow) -> Result<StoredProfile, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            subject_id: raw.subject_id.clone(),
            reason,
        };

        let bytes = if raw.encrypted {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| StoreError::MissingKey(raw.subject_id.clone()))?;
            cipher.open(&raw.embedding)?
        } else {
            raw.embedding.clone()
        };

        let mean_embedding = Embedding::from_bytes(&bytes, raw.model_version.clone())
            .ok_or_else(|| corrupt(format!("embedding blob of {} bytes", bytes.len())))?;
        if mean_embedding.dim() as i64 != raw.embedding_dim {
            return Err(corrupt(format!(
                "embedding has {} values, row says {}",
                mean_embedding.dim(),
                raw.embedding_dim
            )));
        }

        Ok(StoredProfile {
            mean_embedding,
            created_at: parse_timestamp(&raw.subject_id, &raw.created_at)?,
            updated_at: parse_timestamp(&raw.subject_id, &raw.updated_at)?,
            valid_face_count: raw.valid_face_count.max(0) as usize,
            used_face_count: raw.used_face_count.max(0) as usize,
            subject_id: raw.subject_id,
            reference_key: raw.reference_key,
            reference_url: raw.reference_url,
        })
    }
}

fn parse_timestamp(subject_id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            subject_id: subject_id.to_string(),
            reason: format!("timestamp {value:?}: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn profile(subject: &str, values: Vec<f32>, reference_key: &str) -> IdentityProfile {
        let now = Utc::now();
        IdentityProfile {
            subject_id: subject.to_string(),
            mean_embedding: Embedding {
                values,
                model_version: Some("w600k_r50".into()),
            },
            reference_image: Vec::new(),
            reference_key: reference_key.to_string(),
            reference_url: format!("file:///blobs/{reference_key}"),
            valid_face_count: 4,
            used_face_count: 4,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = ProfileStore::open_in_memory(None).await.unwrap();
        let p = profile("kid-1", vec![0.25, -0.5, 1.0], "profiles/kid-1/a.png");

        let outcome = store.upsert(&p).await.unwrap();
        assert!(outcome.previous_reference_key.is_none());

        let got = store.get("kid-1").await.unwrap().unwrap();
        assert_eq!(got.mean_embedding, p.mean_embedding);
        assert_eq!(got.reference_key, "profiles/kid-1/a.png");
        assert_eq!(got.valid_face_count, 4);
        assert!(store.get("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebuild_replaces_and_keeps_created_at() {
        let store = ProfileStore::open_in_memory(None).await.unwrap();
        let first = profile("kid-1", vec![1.0, 0.0], "profiles/kid-1/a.png");
        store.upsert(&first).await.unwrap();

        let mut second = profile("kid-1", vec![0.0, 1.0], "profiles/kid-1/b.png");
        second.created_at = first.created_at + Duration::hours(1);
        second.updated_at = second.created_at;
        second.valid_face_count = 5;
        let outcome = store.upsert(&second).await.unwrap();

        assert_eq!(outcome.previous_reference_key.as_deref(), Some("profiles/kid-1/a.png"));
        assert_eq!(outcome.created_at.timestamp(), first.created_at.timestamp());

        let got = store.get("kid-1").await.unwrap().unwrap();
        assert_eq!(got.mean_embedding.values, vec![0.0, 1.0]);
        assert_eq!(got.reference_key, "profiles/kid-1/b.png");
        assert_eq!(got.valid_face_count, 5);
        assert_eq!(got.created_at.timestamp(), first.created_at.timestamp());
        assert_eq!(got.updated_at.timestamp(), second.updated_at.timestamp());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_returns_reference_key() {
        let store = ProfileStore::open_in_memory(None).await.unwrap();
        store.upsert(&profile("kid-1", vec![1.0], "k1.png")).await.unwrap();
        store.upsert(&profile("kid-2", vec![1.0], "k2.png")).await.unwrap();

        assert_eq!(store.delete("kid-1").await.unwrap().as_deref(), Some("k1.png"));
        assert_eq!(store.delete("kid-1").await.unwrap(), None);
        let left: Vec<String> = store.list().await.unwrap().into_iter().map(|p| p.subject_id).collect();
        assert_eq!(left, vec!["kid-2".to_string()]);
    }

    #[tokio::test]
    async fn test_encrypted_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/profiles.db");
        let p = profile("kid-1", vec![0.1, 0.2, 0.3], "k.png");

        {
            let store = ProfileStore::open(&path, Some(EmbeddingCipher::from_passphrase("s3cret")))
                .await
                .unwrap();
            store.upsert(&p).await.unwrap();
            let got = store.get("kid-1").await.unwrap().unwrap();
            assert_eq!(got.mean_embedding.values, p.mean_embedding.values);
        }

        let keyless = ProfileStore::open(&path, None).await.unwrap();
        assert!(matches!(keyless.get("kid-1").await, Err(StoreError::MissingKey(_))));

        let wrong = ProfileStore::open(&path, Some(EmbeddingCipher::from_passphrase("nope")))
            .await
            .unwrap();
        assert!(matches!(wrong.get("kid-1").await, Err(StoreError::Cipher(CipherError::Open))));
    }
}
