//! Engine worker: owns the [`FaceEngine`] on a dedicated OS thread.
//!
//! Detection, embedding and compose are CPU-bound and synchronous. Async
//! callers talk to the worker through a bounded channel and await a
//! oneshot reply, so model inference never blocks the runtime.

use image::RgbImage;
use likeness_core::crop::{crop_face, decode_rgb, encode_png};
use likeness_core::{select_best, EngineError, FaceCandidate, FaceEngine};
use tokio::sync::{mpsc, oneshot};

/// Best face of an analysed photo together with its padded square crop.
#[derive(Debug, Clone)]
pub struct BestFace {
    pub candidate: FaceCandidate,
    pub crop: RgbImage,
}

/// Everything the profile builder needs from one photo.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub face_count: usize,
    /// `None` when the photo has no detectable face.
    pub best: Option<BestFace>,
}

/// PNG-encoded compose output.
#[derive(Debug, Clone)]
pub struct ComposeOutput {
    pub image: Vec<u8>,
    pub faces_replaced: usize,
}

enum EngineRequest {
    DetectAndEmbed {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<FaceCandidate>, EngineError>>,
    },
    Analyze {
        image: Vec<u8>,
        padding: f32,
        reply: oneshot::Sender<Result<Analysis, EngineError>>,
    },
    Compose {
        target: Vec<u8>,
        source: Vec<u8>,
        reply: oneshot::Sender<Result<ComposeOutput, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Detect every face in an encoded image and embed it.
    pub async fn detect_and_embed(&self, image: Vec<u8>) -> Result<Vec<FaceCandidate>, EngineError> {
        self.request(|reply| EngineRequest::DetectAndEmbed { image, reply }).await
    }

    /// Detect, embed, and crop the best face with `padding` on each side.
    pub async fn analyze(&self, image: Vec<u8>, padding: f32) -> Result<Analysis, EngineError> {
        self.request(|reply| EngineRequest::Analyze { image, padding, reply }).await
    }

    /// Paste the face in `source` onto the faces in `target`.
    ///
    /// Only undecodable input is an error; missing faces yield `target` unchanged.
    pub async fn compose(&self, target: Vec<u8>, source: Vec<u8>) -> Result<ComposeOutput, EngineError> {
        self.request(|reply| EngineRequest::Compose { target, source, reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::Unavailable)?;
        reply_rx.await.map_err(|_| EngineError::Unavailable)?
    }
}

/// Spawn `engine` on its own OS thread and return a handle to it.
///
/// The engine is expected to be fully loaded already; the thread only
/// serves requests until every handle is dropped.
pub fn spawn_engine(engine: Box<dyn FaceEngine>) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let mut engine = engine;

    std::thread::Builder::new()
        .name("likeness-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::DetectAndEmbed { image, reply } => {
                        let result = run_detect(engine.as_mut(), &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Analyze { image, padding, reply } => {
                        let result = run_analyze(engine.as_mut(), &image, padding);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Compose { target, source, reply } => {
                        let result = run_compose(engine.as_mut(), &target, &source);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

fn run_detect(engine: &mut dyn FaceEngine, bytes: &[u8]) -> Result<Vec<FaceCandidate>, EngineError> {
    let image = decode_rgb(bytes)?;
    let faces = engine.detect_and_embed(&image)?;
    tracing::debug!(faces = faces.len(), width = image.width(), height = image.height(), "detect");
    Ok(faces)
}

fn run_analyze(engine: &mut dyn FaceEngine, bytes: &[u8], padding: f32) -> Result<Analysis, EngineError> {
    let image = decode_rgb(bytes)?;
    let faces = engine.detect_and_embed(&image)?;
    let best = select_best(&faces).map(|candidate| BestFace {
        crop: crop_face(&image, &candidate.bbox, padding),
        candidate: candidate.clone(),
    });
    Ok(Analysis {
        face_count: faces.len(),
        best,
    })
}

fn run_compose(engine: &mut dyn FaceEngine, target: &[u8], source: &[u8]) -> Result<ComposeOutput, EngineError> {
    let target = decode_rgb(target)?;
    let source = decode_rgb(source)?;
    let composed = engine.compose(&target, &source);
    Ok(ComposeOutput {
        image: encode_png(&composed.image)?,
        faces_replaced: composed.faces_replaced,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! A marker-driven fake engine shared by the service tests.
    //!
    //! The red channel of pixel (0, 0) selects the scripted faces; compose
    //! rewrites that pixel so the composed image can be scripted too.

    use std::collections::HashMap;

    use image::{Rgb, RgbImage};
    use likeness_core::crop::encode_png;
    use likeness_core::{BoundingBox, Composed, EngineError, Embedding, FaceCandidate, FaceEngine};

    /// Marker added to the target's marker by compose.
    pub const COMPOSE_SHIFT: u8 = 100;

    #[derive(Default)]
    pub struct FakeEngine {
        faces: HashMap<u8, Vec<FaceCandidate>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self::default()
        }

        /// Images marked `marker` contain one face with `embedding`.
        pub fn with_face(mut self, marker: u8, embedding: Vec<f32>, confidence: f32) -> Self {
            self.faces.entry(marker).or_default().push(candidate(embedding, 100.0, confidence));
            self
        }

        pub fn with_candidates(mut self, marker: u8, candidates: Vec<FaceCandidate>) -> Self {
            self.faces.insert(marker, candidates);
            self
        }

        fn lookup(&self, image: &RgbImage) -> Vec<FaceCandidate> {
            self.faces.get(&image.get_pixel(0, 0)[0]).cloned().unwrap_or_default()
        }
    }

    impl FaceEngine for FakeEngine {
        fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<FaceCandidate>, EngineError> {
            Ok(self.lookup(image))
        }

        fn compose(&mut self, target: &RgbImage, source: &RgbImage) -> Composed {
            if self.lookup(target).is_empty() || self.lookup(source).is_empty() {
                return Composed::unchanged(target);
            }
            let mut image = target.clone();
            let marker = image.get_pixel(0, 0)[0].wrapping_add(COMPOSE_SHIFT);
            image.put_pixel(0, 0, Rgb([marker, 0, 0]));
            Composed {
                image,
                faces_replaced: 1,
            }
        }
    }

    pub fn candidate(embedding: Vec<f32>, size: f32, confidence: f32) -> FaceCandidate {
        FaceCandidate {
            bbox: BoundingBox {
                x: 10.0,
                y: 10.0,
                width: size,
                height: size,
                confidence,
                landmarks: None,
            },
            embedding: Embedding::new(embedding),
        }
    }

    /// A 200x200 PNG whose marker pixel is `marker`.
    pub fn marked_png(marker: u8) -> Vec<u8> {
        let mut image = RgbImage::from_pixel(200, 200, Rgb([30, 60, 90]));
        image.put_pixel(0, 0, Rgb([marker, 0, 0]));
        encode_png(&image).unwrap()
    }
}
