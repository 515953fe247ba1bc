//! likeness-service: identity profiles and verified generation.
//!
//! Runs the face engine on its own thread, builds identity profiles from
//! source photos, and drives the generate / compose / verify retry loop
//! against an image generation backend.

pub mod backend;
pub mod builder;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod service;
pub mod verifier;

pub use backend::{BackendError, GenerationRequest, HttpBackend, ImageBackend, RetryingBackend};
pub use builder::{BuildError, BuildSettings, PhotoSource, ProfileBuilder};
pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, Analysis, BestFace, ComposeOutput, EngineHandle};
pub use orchestrator::{
    fold_outcomes, Attempt, AttemptOutcome, GenerationError, GenerationOptions, GenerationResult, Orchestrator,
    PageOutcome, PageRequest, PageResult, Search, Strategy,
};
pub use service::{Likeness, ServiceError};
