use std::path::{Path, PathBuf};
use std::time::Duration;

use likeness_core::ComposeMode;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{key}: cannot parse {value:?}")]
    Env { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Service configuration.
///
/// Layered: built-in defaults, then the TOML file named by `LIKENESS_CONFIG`
/// (if set), then `LIKENESS_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Path to the SQLite profile database.
    pub db_path: PathBuf,
    /// Root of local blob storage.
    pub storage_dir: PathBuf,
    /// Prefix for URLs handed out by storage.
    pub public_base_url: String,
    /// Fewest valid photos a profile may be built from.
    pub min_valid_faces: usize,
    /// Photos beyond this count are ignored.
    pub max_photos: usize,
    /// Padding around the face box, as a fraction of its size, for reference crops.
    pub crop_padding: f32,
    /// Side of the square reference image, in pixels.
    pub reference_size: u32,
    pub similarity_threshold: f32,
    /// Cover early-exit threshold.
    pub excellent_threshold: f32,
    pub max_retries: u32,
    /// Reference-image influence passed to the backend.
    pub strength: f32,
    pub attempt_timeout_secs: u64,
    pub compose_mode: ComposeMode,
    /// Generation backend endpoint. Generation is unavailable when unset.
    pub backend_url: Option<String>,
    /// Extra tries for retryable backend errors, per attempt.
    pub backend_retries: u32,
    /// Passphrase for at-rest embedding encryption.
    pub embedding_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = likeness_core::data_home().join("likeness");
        let storage_dir = data_dir.join("blobs");
        Self {
            model_dir: likeness_core::default_model_dir(),
            db_path: data_dir.join("profiles.db"),
            public_base_url: format!("file://{}", storage_dir.display()),
            storage_dir,
            min_valid_faces: 3,
            max_photos: 5,
            crop_padding: 0.20,
            reference_size: 512,
            similarity_threshold: 0.60,
            excellent_threshold: 0.90,
            max_retries: 3,
            strength: 0.25,
            attempt_timeout_secs: 900,
            compose_mode: ComposeMode::BestEffort,
            backend_url: None,
            backend_retries: 3,
            embedding_key: None,
        }
    }
}

/// On-disk shape: every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    storage_dir: Option<PathBuf>,
    public_base_url: Option<String>,
    min_valid_faces: Option<usize>,
    max_photos: Option<usize>,
    crop_padding: Option<f32>,
    reference_size: Option<u32>,
    similarity_threshold: Option<f32>,
    excellent_threshold: Option<f32>,
    max_retries: Option<u32>,
    strength: Option<f32>,
    attempt_timeout_secs: Option<u64>,
    compose_mode: Option<ComposeMode>,
    backend_url: Option<String>,
    backend_retries: Option<u32>,
    embedding_key: Option<String>,
}

impl Config {
    /// Load from `LIKENESS_CONFIG` and `LIKENESS_*` on top of the defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os("LIKENESS_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::parse_file(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge(file);
        Ok(())
    }

    fn parse_file(text: &str) -> Result<FileConfig, toml::de::Error> {
        toml::from_str(text)
    }

    fn merge(&mut self, file: FileConfig) {
        // Moving the storage root moves the default URL with it.
        if let Some(dir) = file.storage_dir {
            if file.public_base_url.is_none() && self.public_base_url == format!("file://{}", self.storage_dir.display()) {
                self.public_base_url = format!("file://{}", dir.display());
            }
            self.storage_dir = dir;
        }
        set(&mut self.model_dir, file.model_dir);
        set(&mut self.db_path, file.db_path);
        set(&mut self.public_base_url, file.public_base_url);
        set(&mut self.min_valid_faces, file.min_valid_faces);
        set(&mut self.max_photos, file.max_photos);
        set(&mut self.crop_padding, file.crop_padding);
        set(&mut self.reference_size, file.reference_size);
        set(&mut self.similarity_threshold, file.similarity_threshold);
        set(&mut self.excellent_threshold, file.excellent_threshold);
        set(&mut self.max_retries, file.max_retries);
        set(&mut self.strength, file.strength);
        set(&mut self.attempt_timeout_secs, file.attempt_timeout_secs);
        set(&mut self.compose_mode, file.compose_mode);
        set(&mut self.backend_retries, file.backend_retries);
        if file.backend_url.is_some() {
            self.backend_url = file.backend_url;
        }
        if file.embedding_key.is_some() {
            self.embedding_key = file.embedding_key;
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let text = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let file = FileConfig {
            model_dir: text("LIKENESS_MODEL_DIR").map(PathBuf::from),
            db_path: text("LIKENESS_DB_PATH").map(PathBuf::from),
            storage_dir: text("LIKENESS_STORAGE_DIR").map(PathBuf::from),
            public_base_url: text("LIKENESS_PUBLIC_BASE_URL"),
            min_valid_faces: env_parse(&text, "LIKENESS_MIN_VALID_FACES")?,
            max_photos: env_parse(&text, "LIKENESS_MAX_PHOTOS")?,
            crop_padding: env_parse(&text, "LIKENESS_CROP_PADDING")?,
            reference_size: env_parse(&text, "LIKENESS_REFERENCE_SIZE")?,
            similarity_threshold: env_parse(&text, "LIKENESS_SIMILARITY_THRESHOLD")?,
            excellent_threshold: env_parse(&text, "LIKENESS_EXCELLENT_THRESHOLD")?,
            max_retries: env_parse(&text, "LIKENESS_MAX_RETRIES")?,
            strength: env_parse(&text, "LIKENESS_STRENGTH")?,
            attempt_timeout_secs: env_parse(&text, "LIKENESS_ATTEMPT_TIMEOUT_SECS")?,
            compose_mode: env_parse(&text, "LIKENESS_COMPOSE_MODE")?,
            backend_url: text("LIKENESS_BACKEND_URL"),
            backend_retries: env_parse(&text, "LIKENESS_BACKEND_RETRIES")?,
            embedding_key: text("LIKENESS_EMBEDDING_KEY"),
        };
        self.merge(file);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("excellent_threshold", self.excellent_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [-1, 1], got {value}"));
            }
        }
        if self.excellent_threshold < self.similarity_threshold {
            return invalid(format!(
                "excellent_threshold ({}) is below similarity_threshold ({})",
                self.excellent_threshold, self.similarity_threshold
            ));
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be at least 1".into());
        }
        if self.min_valid_faces == 0 {
            return invalid("min_valid_faces must be at least 1".into());
        }
        if self.max_photos < self.min_valid_faces {
            return invalid(format!(
                "max_photos ({}) is below min_valid_faces ({})",
                self.max_photos, self.min_valid_faces
            ));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return invalid(format!("strength must be within [0, 1], got {}", self.strength));
        }
        if self.crop_padding.is_nan() || self.crop_padding < 0.0 {
            return invalid(format!("crop_padding must not be negative, got {}", self.crop_padding));
        }
        if self.reference_size == 0 {
            return invalid("reference_size must be positive".into());
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn env_parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    var(key)
        .map(|value| {
            value.trim().parse().map_err(|_| ConfigError::Env {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.min_valid_faces, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.similarity_threshold, 0.60);
        assert_eq!(config.excellent_threshold, 0.90);
        assert_eq!(config.compose_mode, ComposeMode::BestEffort);
        assert!(config.backend_url.is_none());
        assert!(config.public_base_url.starts_with("file://"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let mut config = Config::default();
        let file = Config::parse_file(
            r#"
            similarity_threshold = 0.55
            max_retries = 5
            compose_mode = "strict"
            storage_dir = "/srv/likeness/blobs"
            backend_url = "http://gen.internal/v1/generate"
            "#,
        )
        .unwrap();
        config.merge(file);
        config
            .apply_env(env(&[("LIKENESS_MAX_RETRIES", "7"), ("LIKENESS_EMBEDDING_KEY", "pw")]))
            .unwrap();

        assert_eq!(config.similarity_threshold, 0.55);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.compose_mode, ComposeMode::Strict);
        assert_eq!(config.public_base_url, "file:///srv/likeness/blobs");
        assert_eq!(config.backend_url.as_deref(), Some("http://gen.internal/v1/generate"));
        assert_eq!(config.embedding_key.as_deref(), Some("pw"));
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(Config::parse_file("similarity = 0.5").is_err());
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("LIKENESS_MAX_RETRIES", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref key, .. } if key == "LIKENESS_MAX_RETRIES"));

        let err = config.apply_env(env(&[("LIKENESS_COMPOSE_MODE", "sometimes")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validation() {
        let cases: Vec<Box<dyn Fn(&mut Config)>> = vec![
            Box::new(|c: &mut Config| c.similarity_threshold = 1.5),
            Box::new(|c: &mut Config| c.excellent_threshold = 0.5),
            Box::new(|c: &mut Config| c.max_retries = 0),
            Box::new(|c: &mut Config| c.min_valid_faces = 0),
            Box::new(|c: &mut Config| c.max_photos = 2),
            Box::new(|c: &mut Config| c.strength = 1.2),
            Box::new(|c: &mut Config| c.crop_padding = -0.1),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "case {i} accepted");
        }
    }
}
