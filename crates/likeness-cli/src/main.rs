use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use likeness_core::engine::{ARCFACE_MODEL_FILE, SCRFD_MODEL_FILE};
use likeness_service::{Config, Likeness, PhotoSource};
use likeness_store::{EmbeddingCipher, LocalStorage, ProfileStore, Storage, StoredProfile};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "likeness", about = "Face identity profiles and verified illustration generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage identity profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// Check whether an image shows a subject
    Verify {
        #[arg(short, long)]
        subject: String,
        image: PathBuf,
    },
    /// Paste the face in SOURCE onto every face in TARGET
    Compose {
        target: PathBuf,
        source: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Generate a verified illustration through the configured backend
    Generate {
        #[arg(short, long)]
        subject: String,
        #[arg(short, long)]
        prompt: String,
        /// Use the cover strategy (compose, then verify)
        #[arg(long)]
        cover: bool,
        /// First seed; later attempts count up from it
        #[arg(long)]
        seed: Option<u32>,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show configuration, models and stored profiles
    Status,
}

#[derive(Subcommand)]
enum ProfileCommand {
    /// Build or rebuild a profile from photos
    Build {
        #[arg(short, long)]
        subject: String,
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Show a stored profile
    Show { subject: String },
    /// Delete a profile and its reference image
    Delete { subject: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    match cli.command {
        Commands::Profile { command } => match command {
            ProfileCommand::Build { subject, photos } => {
                let svc = Likeness::open(config).await?;
                let photos = photos.into_iter().map(PhotoSource::Path).collect();
                let profile = svc.build_profile(&subject, photos).await?;
                print_json(&json!({
                    "subject_id": profile.subject_id,
                    "valid_face_count": profile.valid_face_count,
                    "used_face_count": profile.used_face_count,
                    "embedding_dim": profile.mean_embedding.dim(),
                    "reference_url": profile.reference_url,
                    "created_at": profile.created_at.to_rfc3339(),
                    "updated_at": profile.updated_at.to_rfc3339(),
                }))?;
            }
            ProfileCommand::Show { subject } => {
                let store = open_store(&config).await?;
                match store.get(&subject).await? {
                    Some(profile) => print_json(&profile_json(&profile))?,
                    None => bail!("no profile for subject {subject:?}"),
                }
            }
            ProfileCommand::Delete { subject } => {
                let store = open_store(&config).await?;
                let storage = LocalStorage::new(&config.storage_dir, &config.public_base_url);
                let deleted = match store.delete(&subject).await? {
                    Some(key) => {
                        storage.delete(&key).await?;
                        true
                    }
                    None => false,
                };
                print_json(&json!({ "subject_id": subject, "deleted": deleted }))?;
            }
        },
        Commands::Verify { subject, image } => {
            let svc = Likeness::open(config).await?;
            let bytes = read(&image).await?;
            let verification = svc.verify(&subject, bytes).await?;
            print_json(&json!({
                "subject_id": subject,
                "verified": verification.verified,
                "similarity": verification.similarity,
                "face_detected": verification.face_detected,
                "threshold": svc.config().similarity_threshold,
            }))?;
        }
        Commands::Compose { target, source, output } => {
            let svc = Likeness::open(config).await?;
            let composed = svc.compose(read(&target).await?, read(&source).await?).await?;
            write(&output, &composed.image).await?;
            print_json(&json!({
                "output": output,
                "faces_replaced": composed.faces_replaced,
            }))?;
        }
        Commands::Generate {
            subject,
            prompt,
            cover,
            seed,
            output,
        } => {
            if config.backend_url.is_none() {
                bail!("no generation backend configured (set LIKENESS_BACKEND_URL)");
            }
            let svc = Likeness::open(config).await?;
            let profile = svc
                .profile(&subject)
                .await?
                .with_context(|| format!("no profile for subject {subject:?}"))?;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received; finishing the current attempt");
                    on_signal.cancel();
                }
            });

            let result = svc
                .generate_verified(&prompt, &profile, cover, &svc.options(seed), &cancel)
                .await?;
            write(&output, &result.image_bytes).await?;

            let mut report = serde_json::to_value(&result)?;
            report["output"] = json!(output);
            print_json(&report)?;
        }
        Commands::Status => {
            let store = open_store(&config).await?;
            let profiles = store.list().await?;
            let model = |file: &str| {
                let path = config.model_dir.join(file);
                json!({ "path": path, "present": path.is_file() })
            };
            print_json(&json!({
                "models": {
                    "detector": model(SCRFD_MODEL_FILE),
                    "recognizer": model(ARCFACE_MODEL_FILE),
                },
                "db_path": config.db_path,
                "storage_dir": config.storage_dir,
                "profiles": profiles.len(),
                "similarity_threshold": config.similarity_threshold,
                "excellent_threshold": config.excellent_threshold,
                "max_retries": config.max_retries,
                "compose_mode": config.compose_mode,
                "backend": config.backend_url,
                "embedding_encryption": config.embedding_key.is_some(),
            }))?;
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> Result<ProfileStore> {
    let cipher = config.embedding_key.as_deref().map(EmbeddingCipher::from_passphrase);
    ProfileStore::open(&config.db_path, cipher)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))
}

fn profile_json(profile: &StoredProfile) -> serde_json::Value {
    json!({
        "subject_id": profile.subject_id,
        "embedding_dim": profile.mean_embedding.dim(),
        "model_version": profile.mean_embedding.model_version,
        "reference_key": profile.reference_key,
        "reference_url": profile.reference_url,
        "valid_face_count": profile.valid_face_count,
        "used_face_count": profile.used_face_count,
        "created_at": profile.created_at.to_rfc3339(),
        "updated_at": profile.updated_at.to_rfc3339(),
    })
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

async fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
