//! Face alignment via 4-DOF similarity transform.
//!
//! Maps detected faces onto the canonical ArcFace 112×112 layout, and
//! provides the point-to-point transforms compose uses to carry a source
//! face onto a target face.

use image::{Rgb, RgbImage};

use crate::types::BoundingBox;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// 2×3 affine matrix `[m00, m01, m02, m10, m11, m12]`.
pub type Affine = [f32; 6];

/// Estimate a similarity transform (scale, rotation, translation) taking
/// `src` points onto `dst` points, least-squares over all five pairs.
///
/// Returns `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
pub fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Affine {
    // Normal equations of the overdetermined system, unknowns [a, b, tx, ty]:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j][k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb).unwrap_or([1.0, 0.0, 0.0, 0.0]);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting. `None` when singular.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(mut m: [[f32; 4]; 4], mut rhs: [f32; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))?;
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Scale-and-translate transform taking the `from` box onto the `to` box.
///
/// Used when either face lacks landmarks.
pub fn box_transform(from: &BoundingBox, to: &BoundingBox) -> Affine {
    let sx = if from.width > 0.0 { to.width / from.width } else { 1.0 };
    let sy = if from.height > 0.0 { to.height / from.height } else { 1.0 };
    [sx, 0.0, to.x - from.x * sx, 0.0, sy, to.y - from.y * sy]
}

pub fn apply(m: &Affine, x: f32, y: f32) -> (f32, f32) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

/// Invert a general 2×3 affine transform. `None` if it collapses the plane.
pub fn invert(m: &Affine) -> Option<Affine> {
    let det = m[0] * m[4] - m[1] * m[3];
    if det.abs() < 1e-12 {
        return None;
    }
    let (i00, i01, i10, i11) = (m[4] / det, -m[1] / det, -m[3] / det, m[0] / det);
    Some([
        i00,
        i01,
        -(i00 * m[2] + i01 * m[5]),
        i10,
        i11,
        -(i10 * m[2] + i11 * m[5]),
    ])
}

/// Bilinear sample at a sub-pixel position. `None` outside the image.
pub fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Option<[f32; 3]> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return None;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let (tl, tr) = (image.get_pixel(x0, y0), image.get_pixel(x1, y0));
    let (bl, br) = (image.get_pixel(x0, y1), image.get_pixel(x1, y1));

    Some(std::array::from_fn(|c| {
        f32::from(tl[c]) * (1.0 - fx) * (1.0 - fy)
            + f32::from(tr[c]) * fx * (1.0 - fy)
            + f32::from(bl[c]) * (1.0 - fx) * fy
            + f32::from(br[c]) * fx * fy
    }))
}

/// Render an `out_size` square by pulling each output pixel from `image`
/// through `output_to_source`. Pixels that land outside the source are black.
pub fn warp(image: &RgbImage, output_to_source: &Affine, out_size: u32) -> RgbImage {
    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let (sx, sy) = apply(output_to_source, ox as f32, oy as f32);
        let px = sample_bilinear(image, sx, sy).unwrap_or([0.0; 3]);
        Rgb(px.map(|v| v.round().clamp(0.0, 255.0) as u8))
    })
}

/// Align a detected face to the canonical 112×112 crop expected by ArcFace.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let forward = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    let inverse = invert(&forward).unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    warp(image, &inverse, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);
        let expected = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        for (got, want) in m.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "{m:?}");
        }
    }

    #[test]
    fn test_scaled_transform() {
        let doubled = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&doubled, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 0.01, "a = {}", m[0]);
        assert!(m[3].abs() < 0.01, "b = {}", m[3]);
    }

    #[test]
    fn test_translation_recovered() {
        let shifted = REFERENCE_LANDMARKS_112.map(|(x, y)| (x + 10.0, y - 4.0));
        let m = estimate_similarity_transform(&REFERENCE_LANDMARKS_112, &shifted);
        let (x, y) = apply(&m, 20.0, 30.0);
        assert!((x - 30.0).abs() < 0.05 && (y - 26.0).abs() < 0.05, "({x}, {y})");
    }

    #[test]
    fn test_invert_roundtrip() {
        let m = [0.8, -0.6, 12.0, 0.6, 0.8, -3.0];
        let inv = invert(&m).unwrap();
        let (x, y) = apply(&m, 17.0, 42.0);
        let (bx, by) = apply(&inv, x, y);
        assert!((bx - 17.0).abs() < 1e-3 && (by - 42.0).abs() < 1e-3);
        assert!(invert(&[0.0; 6]).is_none());
    }

    #[test]
    fn test_box_transform_maps_corners() {
        let from = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 50.0,
            height: 100.0,
            confidence: 1.0,
            landmarks: None,
        };
        let to = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 50.0,
            ..from.clone()
        };
        let m = box_transform(&from, &to);
        assert_eq!(apply(&m, 10.0, 20.0), (0.0, 0.0));
        assert_eq!(apply(&m, 60.0, 120.0), (100.0, 50.0));
    }

    #[test]
    fn test_sample_bilinear_bounds() {
        let img = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));
        assert_eq!(sample_bilinear(&img, 1.5, 2.5), Some([10.0, 20.0, 30.0]));
        assert!(sample_bilinear(&img, -0.1, 0.0).is_none());
        assert!(sample_bilinear(&img, 3.5, 0.0).is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let img = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&img, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([128, 128, 128]));
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        // Bright patch at the left eye of a face twice the canonical size,
        // offset by (100, 50): after alignment it must sit near the reference eye.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 100.0, y * 2.0 + 50.0));
        let mut img = RgbImage::new(400, 400);
        let (lx, ly) = (src[0].0.round() as u32, src[0].1.round() as u32);
        for y in ly - 3..=ly + 3 {
            for x in lx - 3..=lx + 3 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }

        let aligned = align_face(&img, &src);
        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as u32,
            REFERENCE_LANDMARKS_112[0].1.round() as u32,
        );
        let peak = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y)[0])
            .max()
            .unwrap_or(0);
        assert!(peak > 100, "expected bright patch near ({rx}, {ry}), max={peak}");
    }
}
