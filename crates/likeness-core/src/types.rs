use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::similarity::cosine_similarity;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Element-wise arithmetic mean of `samples`.
    ///
    /// Returns `None` for an empty slice or when dimensions disagree. Each
    /// dimension is summed in sorted order, so any permutation of the same
    /// samples yields a bit-identical mean.
    pub fn mean(samples: &[Embedding]) -> Option<Embedding> {
        let first = samples.first()?;
        let dim = first.dim();
        if dim == 0 || samples.iter().any(|s| s.dim() != dim) {
            return None;
        }

        let mut column = Vec::with_capacity(samples.len());
        let values = (0..dim)
            .map(|i| {
                column.clear();
                column.extend(samples.iter().map(|s| s.values[i]));
                column.sort_by(f32::total_cmp);
                let sum: f64 = column.iter().map(|&v| f64::from(v)).sum();
                (sum / samples.len() as f64) as f32
            })
            .collect();

        let model_version = first
            .model_version
            .clone()
            .filter(|v| samples.iter().all(|s| s.model_version.as_deref() == Some(v)));

        Some(Embedding {
            values,
            model_version,
        })
    }

    /// Serialize to little-endian `f32` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Parse little-endian `f32` bytes. `None` if the length is not a multiple of 4.
    pub fn from_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Embedding> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Embedding {
            values,
            model_version,
        })
    }
}

/// One face found in an image: where it is, how sure the detector was, and who it looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

impl FaceCandidate {
    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }
}

/// Larger box ranks higher, ties broken by detection confidence.
fn prominence(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    a.area()
        .total_cmp(&b.area())
        .then_with(|| a.confidence.total_cmp(&b.confidence))
}

/// Pick the subject's face out of a detection list.
///
/// Largest box wins, ties broken by detection confidence. Background faces
/// are usually smaller, which is why this is not "first found".
pub fn select_best(candidates: &[FaceCandidate]) -> Option<&FaceCandidate> {
    candidates.iter().max_by(|a, b| prominence(&a.bbox, &b.bbox))
}

/// [`select_best`] for bare detections.
pub fn largest_face(boxes: &[BoundingBox]) -> Option<&BoundingBox> {
    boxes.iter().max_by(|a, b| prominence(a, b))
}

/// Canonical face representation of one subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub subject_id: String,
    pub mean_embedding: Embedding,
    /// PNG-encoded square reference crop. Used as compose source and backend reference.
    #[serde(skip)]
    pub reference_image: Vec<u8>,
    /// Storage key of the reference image.
    pub reference_key: String,
    /// Public URL of the reference image as returned by storage.
    pub reference_url: String,
    pub valid_face_count: usize,
    pub used_face_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
