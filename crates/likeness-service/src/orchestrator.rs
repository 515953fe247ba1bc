//! Verified generation: generate, optionally compose, verify, retry.
//!
//! The retry loop is split in two. [`Search`] is a pure fold over attempt
//! outcomes that tracks the best image and decides when to stop; the
//! [`Orchestrator`] produces those outcomes one at a time against the real
//! backend and engine.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use likeness_core::{EngineError, IdentityProfile};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, GenerationRequest, ImageBackend};
use crate::config::Config;
use crate::engine::EngineHandle;
use crate::verifier;

#[derive(Error, Debug)]
pub enum GenerationError {
    /// Every attempt failed before producing a usable image.
    #[error("no image produced in {attempts} attempt(s); last failure: {last_failure}")]
    NoImageProduced { attempts: u32, last_failure: String },
    #[error("cancelled after {attempts} attempt(s) without an image")]
    Cancelled { attempts: u32 },
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// How hard to push for likeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Generate, paste the reference face, verify. Stops early only on an excellent match.
    Cover,
    /// Generate and verify. Stops on the first verified image.
    Interior,
}

impl Strategy {
    pub fn for_page(is_cover: bool) -> Self {
        if is_cover {
            Strategy::Cover
        } else {
            Strategy::Interior
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Cover => "cover",
            Strategy::Interior => "interior",
        })
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub max_retries: u32,
    pub threshold: f32,
    pub excellent_threshold: f32,
    pub strength: f32,
    pub attempt_timeout: Duration,
    /// First seed; later attempts add one. Random per attempt when unset.
    pub seed: Option<u32>,
}

impl From<&Config> for GenerationOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            threshold: config.similarity_threshold,
            excellent_threshold: config.excellent_threshold,
            strength: config.strength,
            attempt_timeout: config.attempt_timeout(),
            seed: None,
        }
    }
}

/// An attempt that produced an image.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub number: u32,
    pub seed: u32,
    pub image: Vec<u8>,
    pub similarity: f32,
    pub verified: bool,
    pub face_detected: bool,
    pub faces_replaced: usize,
}

#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Produced(Attempt),
    /// Backend error, timeout, or unusable output. The attempt still counts.
    Failed { seed: u32, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    #[serde(skip)]
    pub image_bytes: Vec<u8>,
    pub face_similarity: f32,
    pub face_verified: bool,
    pub face_detected: bool,
    pub attempts: u32,
    pub best_similarity: f32,
    pub face_swap_applied: bool,
    pub seed: u32,
    pub strategy: Strategy,
}

/// Pure state of one retry loop.
#[derive(Debug, Clone)]
pub struct Search {
    strategy: Strategy,
    threshold: f32,
    excellent_threshold: f32,
    attempts: u32,
    best: Option<Attempt>,
    last_failure: Option<String>,
}

impl Search {
    pub fn new(strategy: Strategy, threshold: f32, excellent_threshold: f32) -> Self {
        Self {
            strategy,
            threshold,
            excellent_threshold,
            attempts: 0,
            best: None,
            last_failure: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn best(&self) -> Option<&Attempt> {
        self.best.as_ref()
    }

    /// Fold one outcome in. `Break` means stop now.
    pub fn step(mut self, outcome: AttemptOutcome) -> ControlFlow<Self, Self> {
        self.attempts += 1;
        let attempt = match outcome {
            AttemptOutcome::Produced(attempt) => attempt,
            AttemptOutcome::Failed { reason, .. } => {
                self.last_failure = Some(reason);
                return ControlFlow::Continue(self);
            }
        };

        let done = attempt.verified
            && match self.strategy {
                Strategy::Cover => attempt.similarity >= self.excellent_threshold,
                Strategy::Interior => true,
            };
        if self.best.as_ref().map_or(true, |b| attempt.similarity > b.similarity) {
            self.best = Some(attempt);
        }

        if done {
            ControlFlow::Break(self)
        } else {
            ControlFlow::Continue(self)
        }
    }

    /// Turn the final state into a result. Soft failure is still `Ok`.
    pub fn finish(self) -> Result<GenerationResult, GenerationError> {
        let Some(best) = self.best else {
            return Err(GenerationError::NoImageProduced {
                attempts: self.attempts,
                last_failure: self.last_failure.unwrap_or_else(|| "no attempts were made".into()),
            });
        };
        Ok(GenerationResult {
            face_verified: best.face_detected && best.similarity >= self.threshold,
            face_similarity: best.similarity,
            face_detected: best.face_detected,
            attempts: self.attempts,
            best_similarity: best.similarity,
            face_swap_applied: best.faces_replaced > 0,
            seed: best.seed,
            strategy: self.strategy,
            image_bytes: best.image,
        })
    }
}

/// Run `search` over a ready-made sequence, at most `max_retries` outcomes.
pub fn fold_outcomes(
    search: Search,
    outcomes: impl IntoIterator<Item = AttemptOutcome>,
    max_retries: u32,
) -> Search {
    match outcomes
        .into_iter()
        .take(max_retries as usize)
        .try_fold(search, Search::step)
    {
        ControlFlow::Break(s) | ControlFlow::Continue(s) => s,
    }
}

/// Seeds for successive attempts.
struct Seeds(Option<u32>);

impl Seeds {
    fn next(&mut self) -> u32 {
        match &mut self.0 {
            Some(seed) => {
                let current = *seed;
                *seed = seed.wrapping_add(1);
                current
            }
            None => rand::random(),
        }
    }
}

/// One page of a book.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page: String,
    pub prompt: String,
    pub is_cover: bool,
}

#[derive(Debug)]
pub enum PageOutcome {
    Generated(GenerationResult),
    Skipped { reason: String },
}

#[derive(Debug)]
pub struct PageResult {
    pub page: String,
    pub outcome: PageOutcome,
}

#[derive(Clone)]
pub struct Orchestrator {
    engine: EngineHandle,
    backend: Arc<dyn ImageBackend>,
}

impl Orchestrator {
    pub fn new(engine: EngineHandle, backend: Arc<dyn ImageBackend>) -> Self {
        Self { engine, backend }
    }

    /// Generate an illustration of `profile`'s subject and verify the likeness.
    ///
    /// Returns the best image even when no attempt clears the threshold
    /// (`face_verified = false`). Errors only when no image was produced at
    /// all, or when cancelled before the first one.
    pub async fn generate_verified(
        &self,
        prompt: &str,
        profile: &IdentityProfile,
        strategy: Strategy,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult, GenerationError> {
        let mut search = Search::new(strategy, options.threshold, options.excellent_threshold);
        let mut seeds = Seeds(options.seed);
        let mut cancelled = false;

        for number in 1..=options.max_retries {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let seed = seeds.next();
            let outcome = self.attempt(number, seed, prompt, profile, strategy, options).await?;
            search = match search.step(outcome) {
                ControlFlow::Continue(s) => s,
                ControlFlow::Break(s) => {
                    tracing::info!(
                        subject_id = %profile.subject_id,
                        %strategy,
                        attempts = s.attempts(),
                        "early exit"
                    );
                    search = s;
                    break;
                }
            };
        }

        if cancelled && search.best().is_none() {
            tracing::info!(subject_id = %profile.subject_id, attempts = search.attempts(), "generation cancelled");
            return Err(GenerationError::Cancelled {
                attempts: search.attempts(),
            });
        }

        let result = search.finish();
        match &result {
            Ok(r) => tracing::info!(
                subject_id = %profile.subject_id,
                %strategy,
                attempts = r.attempts,
                similarity = r.face_similarity,
                verified = r.face_verified,
                face_swap = r.face_swap_applied,
                cancelled,
                "generation finished"
            ),
            Err(e) => tracing::warn!(subject_id = %profile.subject_id, %strategy, error = %e, "generation failed"),
        }
        result
    }

    /// Generate a book's pages one after another. A failing page is skipped.
    pub async fn generate_pages(
        &self,
        profile: &IdentityProfile,
        pages: Vec<PageRequest>,
        options: &GenerationOptions,
        cancel: &CancellationToken,
    ) -> Vec<PageResult> {
        let mut results = Vec::with_capacity(pages.len());
        for request in pages {
            let strategy = Strategy::for_page(request.is_cover);
            let outcome = match self
                .generate_verified(&request.prompt, profile, strategy, options, cancel)
                .await
            {
                Ok(result) => PageOutcome::Generated(result),
                Err(e) => {
                    tracing::warn!(subject_id = %profile.subject_id, page = %request.page, error = %e, "skipping page");
                    PageOutcome::Skipped { reason: e.to_string() }
                }
            };
            results.push(PageResult {
                page: request.page,
                outcome,
            });
        }
        results
    }

    /// One generate / compose / verify round.
    ///
    /// Only a dead engine thread is an `Err`; everything else is an outcome.
    async fn attempt(
        &self,
        number: u32,
        seed: u32,
        prompt: &str,
        profile: &IdentityProfile,
        strategy: Strategy,
        options: &GenerationOptions,
    ) -> Result<AttemptOutcome, GenerationError> {
        let request = GenerationRequest {
            prompt: prompt.to_string(),
            reference_image: Some(profile.reference_image.clone()),
            seed,
            strength: options.strength,
        };

        let generated = match tokio::time::timeout(options.attempt_timeout, self.backend.generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(options.attempt_timeout)),
        };
        let raw = match generated {
            Ok(image) => image,
            Err(e) => return Ok(failed(number, seed, e.to_string())),
        };

        let (image, faces_replaced) = match strategy {
            Strategy::Interior => (raw, 0),
            Strategy::Cover => match self.engine.compose(raw, profile.reference_image.clone()).await {
                Ok(out) => (out.image, out.faces_replaced),
                Err(EngineError::Unavailable) => return Err(EngineError::Unavailable.into()),
                Err(e) => return Ok(failed(number, seed, format!("compose: {e}"))),
            },
        };

        let verification =
            match verifier::verify(&self.engine, &profile.mean_embedding, image.clone(), options.threshold).await {
                Ok(v) => v,
                Err(EngineError::Unavailable) => return Err(EngineError::Unavailable.into()),
                Err(e) => return Ok(failed(number, seed, format!("verify: {e}"))),
            };

        tracing::debug!(
            subject_id = %profile.subject_id,
            attempt = number,
            seed,
            %strategy,
            similarity = verification.similarity,
            verified = verification.verified,
            face_detected = verification.face_detected,
            faces_replaced,
            "attempt verified"
        );

        Ok(AttemptOutcome::Produced(Attempt {
            number,
            seed,
            image,
            similarity: verification.similarity,
            verified: verification.verified,
            face_detected: verification.face_detected,
            faces_replaced,
        }))
    }
}

fn failed(number: u32, seed: u32, reason: String) -> AttemptOutcome {
    tracing::warn!(attempt = number, seed, %reason, "attempt produced no usable image");
    AttemptOutcome::Failed { seed, reason }
}
