//! Identity profile builder.
//!
//! Turns a handful of photos of one subject into a mean embedding and a
//! square reference crop, then persists both.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use likeness_core::crop::{encode_png, letterbox_square};
use likeness_core::{Embedding, EngineError, IdentityProfile};
use likeness_store::{ProfileStore, Storage, StorageError, StoreError};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{BestFace, EngineHandle};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("found {found} usable face(s), at least {required} required")]
    InsufficientFaces { found: usize, required: usize },
    #[error("invalid subject id {0:?}")]
    InvalidSubject(String),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("profile store error: {0}")]
    Store(#[from] StoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("cannot encode reference image: {0}")]
    Encode(#[from] image::ImageError),
}

/// Where a candidate photo comes from.
#[derive(Debug, Clone)]
pub enum PhotoSource {
    Bytes(Vec<u8>),
    /// Key in the configured [`Storage`].
    StorageKey(String),
    Path(PathBuf),
}

impl PhotoSource {
    fn describe(&self) -> String {
        match self {
            PhotoSource::Bytes(b) => format!("<{} bytes>", b.len()),
            PhotoSource::StorageKey(k) => format!("storage:{k}"),
            PhotoSource::Path(p) => p.display().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildSettings {
    pub min_valid_faces: usize,
    pub max_photos: usize,
    pub crop_padding: f32,
    pub reference_size: u32,
}

impl From<&Config> for BuildSettings {
    fn from(config: &Config) -> Self {
        Self {
            min_valid_faces: config.min_valid_faces,
            max_photos: config.max_photos,
            crop_padding: config.crop_padding,
            reference_size: config.reference_size,
        }
    }
}

pub struct ProfileBuilder {
    engine: EngineHandle,
    store: Arc<ProfileStore>,
    storage: Arc<dyn Storage>,
    settings: BuildSettings,
}

impl ProfileBuilder {
    pub fn new(
        engine: EngineHandle,
        store: Arc<ProfileStore>,
        storage: Arc<dyn Storage>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            engine,
            store,
            storage,
            settings,
        }
    }

    /// Build (or rebuild) the profile of `subject_id` from `photos`.
    ///
    /// Photos that cannot be loaded or decoded, or that show no face, are
    /// skipped. Fails with [`BuildError::InsufficientFaces`] when fewer than
    /// `min_valid_faces` photos remain. On success the previous reference
    /// image, if any, is removed from storage.
    pub async fn build_profile(
        &self,
        subject_id: &str,
        photos: Vec<PhotoSource>,
    ) -> Result<IdentityProfile, BuildError> {
        validate_subject(subject_id)?;

        let mut photos = photos;
        if photos.len() > self.settings.max_photos {
            tracing::warn!(
                subject_id,
                given = photos.len(),
                max = self.settings.max_photos,
                "too many photos; ignoring the extras"
            );
            photos.truncate(self.settings.max_photos);
        }
        let total = photos.len();

        let mut embeddings: Vec<Embedding> = Vec::with_capacity(total);
        let mut best: Option<BestFace> = None;

        for (index, source) in photos.into_iter().enumerate() {
            let Some(face) = self.face_from(subject_id, index, &source).await? else {
                continue;
            };
            embeddings.push(face.candidate.embedding.clone());
            let better = best
                .as_ref()
                .map_or(true, |b| face.candidate.confidence() > b.candidate.confidence());
            if better {
                best = Some(face);
            }
        }

        let valid = embeddings.len();
        let (Some(best), Some(mean_embedding)) = (best, Embedding::mean(&embeddings)) else {
            return Err(self.insufficient(subject_id, valid, total));
        };
        if valid < self.settings.min_valid_faces {
            return Err(self.insufficient(subject_id, valid, total));
        }

        let reference = letterbox_square(&best.crop, self.settings.reference_size);
        let reference_image = encode_png(&reference)?;
        let reference_key = format!("profiles/{subject_id}/reference-{}.png", Uuid::new_v4());
        let reference_url = self.storage.save(&reference_key, &reference_image).await?;

        let now = Utc::now();
        let mut profile = IdentityProfile {
            subject_id: subject_id.to_string(),
            mean_embedding,
            reference_image,
            reference_key,
            reference_url,
            valid_face_count: valid,
            used_face_count: valid,
            created_at: now,
            updated_at: now,
        };

        let outcome = match self.store.upsert(&profile).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete(&profile.reference_key).await {
                    tracing::warn!(key = %profile.reference_key, error = %cleanup, "orphaned reference image");
                }
                return Err(e.into());
            }
        };
        profile.created_at = outcome.created_at;

        if let Some(old_key) = outcome.previous_reference_key {
            if let Err(e) = self.storage.delete(&old_key).await {
                tracing::warn!(subject_id, key = %old_key, error = %e, "failed to remove previous reference image");
            }
        }

        tracing::info!(
            subject_id,
            photos = total,
            valid_faces = valid,
            reference_confidence = best.candidate.confidence(),
            "profile built"
        );
        Ok(profile)
    }

    /// Load and analyse one photo. `Ok(None)` means "skip it".
    async fn face_from(
        &self,
        subject_id: &str,
        index: usize,
        source: &PhotoSource,
    ) -> Result<Option<BestFace>, BuildError> {
        let bytes = match self.load(source).await {
            Ok(bytes) => bytes,
            Err(reason) => {
                tracing::warn!(subject_id, photo = index, source = %source.describe(), %reason, "skipping unreadable photo");
                return Ok(None);
            }
        };

        match self.engine.analyze(bytes, self.settings.crop_padding).await {
            Ok(analysis) => {
                if analysis.best.is_none() {
                    tracing::warn!(subject_id, photo = index, "skipping photo: no face detected");
                }
                Ok(analysis.best)
            }
            Err(EngineError::Unavailable) => Err(EngineError::Unavailable.into()),
            Err(e) => {
                tracing::warn!(subject_id, photo = index, error = %e, "skipping photo");
                Ok(None)
            }
        }
    }

    async fn load(&self, source: &PhotoSource) -> Result<Vec<u8>, String> {
        match source {
            PhotoSource::Bytes(bytes) => Ok(bytes.clone()),
            PhotoSource::StorageKey(key) => self.storage.load(key).await.map_err(|e| e.to_string()),
            PhotoSource::Path(path) => tokio::fs::read(path).await.map_err(|e| e.to_string()),
        }
    }

    fn insufficient(&self, subject_id: &str, found: usize, total: usize) -> BuildError {
        tracing::warn!(
            subject_id,
            photos = total,
            valid_faces = found,
            required = self.settings.min_valid_faces,
            "not enough usable faces"
        );
        BuildError::InsufficientFaces {
            found,
            required: self.settings.min_valid_faces,
        }
    }
}

/// Subject ids become part of storage keys, so they must be a single plain path segment.
pub(crate) fn validate_subject(subject_id: &str) -> Result<(), BuildError> {
    let ok = !subject_id.is_empty()
        && subject_id != "."
        && subject_id != ".."
        && !subject_id.contains(['/', '\\'])
        && !subject_id.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(BuildError::InvalidSubject(subject_id.to_string()))
    }
}
