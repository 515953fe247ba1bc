//! Face compose: paste a source face over every face found in a target image.
//!
//! Each target face is filled from the source through a landmark similarity
//! transform (box-to-box when landmarks are missing), colour-matched to the
//! target skin tone, and blended through a feathered ellipse so the seam
//! fades into the illustration.

use std::fmt;
use std::str::FromStr;

use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::alignment::{self, Affine};
use crate::types::BoundingBox;

/// Fraction of the ellipse radius used for the soft edge.
const FEATHER: f32 = 0.25;
/// Margin around the target box that still receives blended pixels.
const REGION_MARGIN: f32 = 0.1;
/// Colour-transfer gain is kept within this range.
const MAX_GAIN: f32 = 2.0;
const STRICT_MIN_CONFIDENCE: f32 = 0.6;
const STRICT_MIN_WIDTH: f32 = 24.0;

/// Which target faces receive the source face.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComposeMode {
    /// Every detected face.
    #[default]
    BestEffort,
    /// Only confident, reasonably sized faces.
    Strict,
}

impl ComposeMode {
    fn accepts(self, face: &BoundingBox) -> bool {
        match self {
            ComposeMode::BestEffort => true,
            ComposeMode::Strict => face.confidence >= STRICT_MIN_CONFIDENCE && face.width >= STRICT_MIN_WIDTH,
        }
    }
}

impl FromStr for ComposeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-effort" | "best_effort" => Ok(ComposeMode::BestEffort),
            "strict" => Ok(ComposeMode::Strict),
            other => Err(format!("unknown compose mode {other:?} (expected best-effort or strict)")),
        }
    }
}

impl fmt::Display for ComposeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComposeMode::BestEffort => "best-effort",
            ComposeMode::Strict => "strict",
        })
    }
}

/// Result of a compose call.
#[derive(Debug, Clone)]
pub struct Composed {
    pub image: RgbImage,
    /// Number of target faces that were replaced. Zero means the target is unchanged.
    pub faces_replaced: usize,
}

impl Composed {
    pub fn unchanged(target: &RgbImage) -> Self {
        Self {
            image: target.clone(),
            faces_replaced: 0,
        }
    }
}

/// Paste `source_face` (located at `source_box` in `source`) onto each
/// accepted face in `target_faces`.
pub fn compose_faces(
    target: &RgbImage,
    target_faces: &[BoundingBox],
    source: &RgbImage,
    source_box: &BoundingBox,
    mode: ComposeMode,
) -> Composed {
    let mut out = target.clone();
    let mut replaced = 0;

    for face in target_faces.iter().filter(|f| mode.accepts(f)) {
        let to_source = match (&face.landmarks, &source_box.landmarks) {
            (Some(t), Some(s)) => alignment::estimate_similarity_transform(t, s),
            _ => alignment::box_transform(face, source_box),
        };
        if paste_face(&mut out, face, source, &to_source) {
            replaced += 1;
        }
    }

    tracing::debug!(
        detected = target_faces.len(),
        replaced,
        %mode,
        "compose finished"
    );
    Composed {
        image: out,
        faces_replaced: replaced,
    }
}

/// Elliptical blend weight in [0, 1] for a pixel relative to `face`.
fn mask_alpha(face: &BoundingBox, x: f32, y: f32) -> f32 {
    let (cx, cy) = face.center();
    let rx = (face.width / 2.0).max(1.0);
    let ry = (face.height / 2.0).max(1.0);
    let r = (((x - cx) / rx).powi(2) + ((y - cy) / ry).powi(2)).sqrt();
    if r <= 1.0 - FEATHER {
        1.0
    } else if r >= 1.0 {
        0.0
    } else {
        (1.0 - r) / FEATHER
    }
}

#[derive(Default)]
struct ChannelStats {
    n: f32,
    sum: [f32; 3],
    sum_sq: [f32; 3],
}

impl ChannelStats {
    fn push(&mut self, px: [f32; 3]) {
        self.n += 1.0;
        for c in 0..3 {
            self.sum[c] += px[c];
            self.sum_sq[c] += px[c] * px[c];
        }
    }

    fn mean_std(&self) -> ([f32; 3], [f32; 3]) {
        let n = self.n.max(1.0);
        let mean = self.sum.map(|s| s / n);
        let std = std::array::from_fn(|c| (self.sum_sq[c] / n - mean[c] * mean[c]).max(0.0).sqrt());
        (mean, std)
    }
}

/// Blend one face. Returns false when no source pixel maps into the region.
fn paste_face(out: &mut RgbImage, face: &BoundingBox, source: &RgbImage, to_source: &Affine) -> bool {
    let (w, h) = out.dimensions();
    let mx = face.width * REGION_MARGIN;
    let my = face.height * REGION_MARGIN;
    let x0 = (face.x - mx).floor().max(0.0) as u32;
    let y0 = (face.y - my).floor().max(0.0) as u32;
    let x1 = ((face.x + face.width + mx).ceil().max(0.0) as u32).min(w);
    let y1 = ((face.y + face.height + my).ceil().max(0.0) as u32).min(h);

    // Pass 1: collect (pixel, alpha, source sample) and colour statistics.
    let mut samples = Vec::new();
    let mut target_stats = ChannelStats::default();
    let mut source_stats = ChannelStats::default();
    for y in y0..y1 {
        for x in x0..x1 {
            let alpha = mask_alpha(face, x as f32, y as f32);
            if alpha <= 0.0 {
                continue;
            }
            let (sx, sy) = alignment::apply(to_source, x as f32, y as f32);
            let Some(src) = alignment::sample_bilinear(source, sx, sy) else {
                continue;
            };
            target_stats.push(out.get_pixel(x, y).0.map(f32::from));
            source_stats.push(src);
            samples.push((x, y, alpha, src));
        }
    }
    if samples.is_empty() {
        return false;
    }

    let (t_mean, t_std) = target_stats.mean_std();
    let (s_mean, s_std) = source_stats.mean_std();
    let gain: [f32; 3] = std::array::from_fn(|c| {
        if s_std[c] > 1e-3 {
            (t_std[c] / s_std[c]).clamp(1.0 / MAX_GAIN, MAX_GAIN)
        } else {
            1.0
        }
    });

    // Pass 2: colour-transfer and blend.
    for (x, y, alpha, src) in samples {
        let dst = out.get_pixel(x, y).0;
        let blended: [u8; 3] = std::array::from_fn(|c| {
            let matched = (src[c] - s_mean[c]) * gain[c] + t_mean[c];
            let v = alpha * matched + (1.0 - alpha) * f32::from(dst[c]);
            v.round().clamp(0.0, 255.0) as u8
        });
        out.put_pixel(x, y, Rgb(blended));
    }
    true
}
