//! Similarity verifier: cosine similarity on L2-normalised embeddings and
//! the threshold decision built on top of it.

use serde::{Deserialize, Serialize};

use crate::types::{select_best, Embedding, FaceCandidate};

/// Norm floor that keeps degenerate (all-zero) vectors from dividing by zero.
const NORM_EPSILON: f64 = 1e-12;

/// `dot(a / |a|, b / |b|)`, clamped to [-1, 1].
///
/// Vectors of different length never match and score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    // Accumulate in f64 so large components cannot overflow to inf.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt().max(NORM_EPSILON) * norm_b.sqrt().max(NORM_EPSILON);
    let similarity = (dot / denom).clamp(-1.0, 1.0) as f32;
    if similarity.is_nan() {
        0.0
    } else {
        similarity
    }
}

/// Outcome of checking one image against an identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub verified: bool,
    pub similarity: f32,
    pub face_detected: bool,
}

impl Verification {
    /// An image with no detectable face: a failed check, not an error.
    pub fn no_face() -> Self {
        Self {
            verified: false,
            similarity: 0.0,
            face_detected: false,
        }
    }
}

/// Compare the best face among `candidates` with `reference`.
pub fn verify_candidates(
    reference: &Embedding,
    candidates: &[FaceCandidate],
    threshold: f32,
) -> Verification {
    let Some(best) = select_best(candidates) else {
        return Verification::no_face();
    };

    let similarity = reference.similarity(&best.embedding);
    Verification {
        verified: similarity >= threshold,
        similarity,
        face_detected: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn face(size: f32, values: Vec<f32>) -> FaceCandidate {
        FaceCandidate {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: size,
                height: size,
                confidence: 0.9,
                landmarks: None,
            },
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_self_similarity_is_one() {
        let a = [0.3, -1.2, 4.5, 0.01];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_symmetric() {
        let a = [0.3, -1.2, 4.5, 0.01];
        let b = [-2.0, 0.5, 1.5, 9.0];
        assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
    }

    #[test]
    fn test_bounded() {
        let pairs: [([f32; 3], [f32; 3]); 4] = [
            ([1.0, 0.0, 0.0], [-1.0, 0.0, 0.0]),
            ([1e20, 1e20, 1e20], [1e20, 1e20, 1e20]),
            ([1e-20, 0.0, 0.0], [1e-20, 0.0, 0.0]),
            ([0.2, 0.3, -0.9], [5.0, -7.0, 0.0]),
        ];
        for (a, b) in pairs {
            let s = cosine_similarity(&a, &b);
            assert!((-1.0..=1.0).contains(&s), "{s} out of range for {a:?}, {b:?}");
        }
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_is_finite() {
        let s = cosine_similarity(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]);
        assert_eq!(s, 0.0);
        assert!(cosine_similarity(&[0.0; 4], &[0.0; 4]).is_finite());
    }

    #[test]
    fn test_length_mismatch_scores_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_verify_no_face() {
        let reference = Embedding::new(vec![1.0, 0.0]);
        let v = verify_candidates(&reference, &[], 0.6);
        assert_eq!(v, Verification::no_face());
    }

    #[test]
    fn test_verify_uses_largest_face() {
        let reference = Embedding::new(vec![1.0, 0.0]);
        let faces = vec![face(30.0, vec![1.0, 0.0]), face(200.0, vec![0.0, 1.0])];
        let v = verify_candidates(&reference, &faces, 0.6);
        assert!(v.face_detected);
        assert!(!v.verified);
        assert!(v.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_verify_threshold_is_inclusive() {
        let reference = Embedding::new(vec![1.0, 0.0]);
        let faces = vec![face(100.0, vec![1.0, 0.0])];
        let sim = verify_candidates(&reference, &faces, 0.0).similarity;
        assert!(verify_candidates(&reference, &faces, sim).verified);
    }
}
