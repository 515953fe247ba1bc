//! The assembled service: engine, store, storage, builder and orchestrator.

use std::sync::Arc;

use likeness_core::{EngineError, IdentityProfile, OnnxFaceEngine, Verification};
use likeness_store::{EmbeddingCipher, LocalStorage, ProfileStore, Storage, StorageError, StoreError, StoredProfile};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, HttpBackend, ImageBackend, RetryingBackend};
use crate::builder::{BuildError, BuildSettings, PhotoSource, ProfileBuilder};
use crate::config::{Config, ConfigError};
use crate::engine::{spawn_engine, ComposeOutput, EngineHandle};
use crate::orchestrator::{
    GenerationError, GenerationOptions, GenerationResult, Orchestrator, PageRequest, PageResult, Strategy,
};
use crate::verifier;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("profile store error: {0}")]
    Store(#[from] StoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("backend setup: {0}")]
    Backend(#[from] BackendError),
    #[error("no profile for subject {0:?}")]
    UnknownSubject(String),
    #[error("no generation backend configured (set LIKENESS_BACKEND_URL)")]
    GenerationDisabled,
}

pub struct Likeness {
    config: Config,
    engine: EngineHandle,
    store: Arc<ProfileStore>,
    storage: Arc<dyn Storage>,
    builder: ProfileBuilder,
    orchestrator: Option<Orchestrator>,
}

impl Likeness {
    /// Load the ONNX models, open the database and storage, and connect the backend if configured.
    pub async fn open(config: Config) -> Result<Self, ServiceError> {
        let model_dir = config.model_dir.clone();
        let mode = config.compose_mode;
        let engine = tokio::task::spawn_blocking(move || OnnxFaceEngine::load(&model_dir, mode))
            .await
            .map_err(|_| EngineError::Unavailable)??;
        let engine = spawn_engine(Box::new(engine));

        let cipher = config.embedding_key.as_deref().map(EmbeddingCipher::from_passphrase);
        let store = Arc::new(ProfileStore::open(&config.db_path, cipher).await?);
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(&config.storage_dir, &config.public_base_url));

        let backend = match &config.backend_url {
            Some(url) => {
                let http = HttpBackend::new(url.as_str(), config.attempt_timeout())?;
                let backend: Arc<dyn ImageBackend> = Arc::new(RetryingBackend::new(http, config.backend_retries));
                Some(backend)
            }
            None => None,
        };

        tracing::info!(
            db = %config.db_path.display(),
            storage = %config.storage_dir.display(),
            backend = config.backend_url.as_deref().unwrap_or("none"),
            "likeness service ready"
        );
        Ok(Self::from_parts(config, engine, store, storage, backend))
    }

    /// Assemble from ready-made parts.
    pub fn from_parts(
        config: Config,
        engine: EngineHandle,
        store: Arc<ProfileStore>,
        storage: Arc<dyn Storage>,
        backend: Option<Arc<dyn ImageBackend>>,
    ) -> Self {
        let builder = ProfileBuilder::new(engine.clone(), store.clone(), storage.clone(), BuildSettings::from(&config));
        let orchestrator = backend.map(|b| Orchestrator::new(engine.clone(), b));
        Self {
            config,
            engine,
            store,
            storage,
            builder,
            orchestrator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn generation_enabled(&self) -> bool {
        self.orchestrator.is_some()
    }

    /// Generation options from the configuration, with an optional fixed first seed.
    pub fn options(&self, seed: Option<u32>) -> GenerationOptions {
        GenerationOptions {
            seed,
            ..GenerationOptions::from(&self.config)
        }
    }

    pub async fn build_profile(
        &self,
        subject_id: &str,
        photos: Vec<PhotoSource>,
    ) -> Result<IdentityProfile, ServiceError> {
        Ok(self.builder.build_profile(subject_id, photos).await?)
    }

    /// Full profile, reference image included.
    pub async fn profile(&self, subject_id: &str) -> Result<Option<IdentityProfile>, ServiceError> {
        let Some(stored) = self.store.get(subject_id).await? else {
            return Ok(None);
        };
        let image = self.storage.load(&stored.reference_key).await?;
        Ok(Some(stored.into_profile(image)))
    }

    pub async fn list_profiles(&self) -> Result<Vec<StoredProfile>, ServiceError> {
        Ok(self.store.list().await?)
    }

    /// Delete a subject's profile and its reference image. Returns whether a profile existed.
    pub async fn delete_profile(&self, subject_id: &str) -> Result<bool, ServiceError> {
        let Some(key) = self.store.delete(subject_id).await? else {
            return Ok(false);
        };
        if let Err(e) = self.storage.delete(&key).await {
            tracing::warn!(subject_id, key = %key, error = %e, "profile deleted but reference image remains");
        }
        tracing::info!(subject_id, "profile deleted");
        Ok(true)
    }

    /// Check an arbitrary image against a stored subject.
    pub async fn verify(&self, subject_id: &str, image: Vec<u8>) -> Result<Verification, ServiceError> {
        let stored = self
            .store
            .get(subject_id)
            .await?
            .ok_or_else(|| ServiceError::UnknownSubject(subject_id.to_string()))?;
        Ok(verifier::verify(&self.engine, &stored.mean_embedding, image, self.config.similarity_threshold).await?)
    }

    pub async fn compose(&self, target: Vec<u8>, source: Vec<u8>) -> Result<ComposeOutput, ServiceError> {
        Ok(self.engine.compose(target, source).await?)
    }

    pub async fn generate_verified(
        &self,
        prompt: &str,
        profile: &IdentityProfile,
        is_cover: bool,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, ServiceError> {
        let orchestrator = self.orchestrator.as_ref().ok_or(ServiceError::GenerationDisabled)?;
        Ok(orchestrator
            .generate_verified(prompt, profile, Strategy::for_page(is_cover), options, cancel)
            .await?)
    }

    pub async fn generate_pages(
        &self,
        profile: &IdentityProfile,
        pages: Vec<PageRequest>,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<PageResult>, ServiceError> {
        let orchestrator = self.orchestrator.as_ref().ok_or(ServiceError::GenerationDisabled)?;
        Ok(orchestrator.generate_pages(profile, pages, options, cancel).await)
    }
}
