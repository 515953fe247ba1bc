//! Blob storage collaborator: reference images and source photos, keyed by path-like keys.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
    #[error("no object stored under {0:?}")]
    NotFound(String),
    #[error("storage i/o for {key:?}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object. Returns its public URL.
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError>;

    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Remove `key`. Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Filesystem storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path under the root. Rejects keys that could escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && !key.contains('\\')
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }
}

fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error(key))?;
        }

        // Write aside, then rename, so readers never see a partial object.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await.map_err(io_error(key))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(key)(e));
        }

        tracing::debug!(key, bytes = bytes.len(), "stored object");
        Ok(self.url_for(key))
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(io_error(key)(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir) -> LocalStorage {
        LocalStorage::new(dir.path(), "https://cdn.example.test/media/")
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(&dir);

        let url = store.save("profiles/kid-1/reference.png", b"png").await.unwrap();
        assert_eq!(url, "https://cdn.example.test/media/profiles/kid-1/reference.png");
        assert_eq!(store.load("profiles/kid-1/reference.png").await.unwrap(), b"png");

        store.save("profiles/kid-1/reference.png", b"png2").await.unwrap();
        assert_eq!(store.load("profiles/kid-1/reference.png").await.unwrap(), b"png2");

        store.delete("profiles/kid-1/reference.png").await.unwrap();
        assert!(matches!(
            store.load("profiles/kid-1/reference.png").await,
            Err(StorageError::NotFound(_))
        ));
        // Deleting twice is fine.
        store.delete("profiles/kid-1/reference.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(&dir);
        store.save("a/b.bin", b"x").await.unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(&dir);
        for key in ["", "../etc/passwd", "/abs/path", "a/../../b", "a\\b", "./a"] {
            assert!(
                matches!(store.save(key, b"x").await, Err(StorageError::InvalidKey(_))),
                "key {key:?} accepted"
            );
        }
    }
}
