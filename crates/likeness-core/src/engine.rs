//! The Face Engine capability: detect + embed, and compose.

use std::path::Path;

use image::RgbImage;
use thiserror::Error;

use crate::compose::{self, ComposeMode, Composed};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{largest_face, FaceCandidate};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("unreadable image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("engine thread exited")]
    Unavailable,
}

/// Synchronous, CPU-bound face capability.
///
/// Implementations hold heavy model state and are meant to be created once
/// and owned by a single worker thread.
pub trait FaceEngine: Send {
    /// All faces in `image`. An image without faces yields an empty list, not an error.
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceCandidate>, EngineError>;

    /// Paste the face found in `source` onto every face found in `target`.
    /// Never fails: if either side has no face, `target` comes back unchanged.
    fn compose(&mut self, target: &RgbImage, source: &RgbImage) -> Composed;
}

/// SCRFD + ArcFace engine backed by ONNX Runtime.
pub struct OnnxFaceEngine {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    compose_mode: ComposeMode,
}

impl OnnxFaceEngine {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path, compose_mode: ComposeMode) -> Result<Self, EngineError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        tracing::info!(model_dir = %model_dir.display(), %compose_mode, "face engine ready");
        Ok(Self {
            detector,
            recognizer,
            compose_mode,
        })
    }
}

impl FaceEngine for OnnxFaceEngine {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceCandidate>, EngineError> {
        self.detector
            .detect(image)?
            .into_iter()
            .map(|bbox| {
                let embedding = self.recognizer.extract(image, &bbox)?;
                Ok(FaceCandidate { bbox, embedding })
            })
            .collect()
    }

    fn compose(&mut self, target: &RgbImage, source: &RgbImage) -> Composed {
        let source_faces = match self.detector.detect(source) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "compose: source detection failed; leaving target unchanged");
                return Composed::unchanged(target);
            }
        };
        let target_faces = match self.detector.detect(target) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "compose: target detection failed; leaving target unchanged");
                return Composed::unchanged(target);
            }
        };

        let Some(source_box) = largest_face(&source_faces) else {
            tracing::debug!("compose: no face in source");
            return Composed::unchanged(target);
        };
        if target_faces.is_empty() {
            tracing::debug!("compose: no face in target");
            return Composed::unchanged(target);
        }

        compose::compose_faces(target, &target_faces, source, source_box, self.compose_mode)
    }
}
