//! likeness-core: face identity primitives.
//!
//! SCRFD face detection and ArcFace recognition via ONNX Runtime, face
//! crops and compose, and the cosine similarity verifier used to decide
//! whether an illustration still shows the same child.

pub mod alignment;
pub mod compose;
pub mod crop;
pub mod detector;
pub mod engine;
pub mod recognizer;
pub mod similarity;
pub mod types;

use std::path::PathBuf;

pub use compose::{ComposeMode, Composed};
pub use detector::FaceDetector;
pub use engine::{EngineError, FaceEngine, OnnxFaceEngine};
pub use recognizer::FaceRecognizer;
pub use similarity::{cosine_similarity, verify_candidates, Verification};
pub use types::{select_best, BoundingBox, Embedding, FaceCandidate, IdentityProfile};

/// Default model directory: `$XDG_DATA_HOME/likeness/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("likeness").join("models")
}

/// `$XDG_DATA_HOME`, falling back to `$HOME/.local/share`.
pub fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
}
