//! Async face verification against an identity's mean embedding.

use likeness_core::{verify_candidates, EngineError, Embedding, Verification};

use crate::engine::EngineHandle;

/// Check whether the subject's face appears in `image`.
///
/// No detectable face is a failed check with similarity 0, not an error.
/// Only undecodable input or an engine failure is reported as `Err`.
pub async fn verify(
    engine: &EngineHandle,
    reference: &Embedding,
    image: Vec<u8>,
    threshold: f32,
) -> Result<Verification, EngineError> {
    let candidates = engine.detect_and_embed(image).await?;
    let verification = verify_candidates(reference, &candidates, threshold);
    tracing::debug!(
        faces = candidates.len(),
        similarity = verification.similarity,
        verified = verification.verified,
        "verify"
    );
    Ok(verification)
}
