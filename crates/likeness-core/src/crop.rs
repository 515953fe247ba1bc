//! Face crops and canvas helpers shared by the profile builder and compose.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};

use crate::types::BoundingBox;

/// Square region `(x, y, side)` around `bbox`, grown by `padding` of the
/// face size on every side and shifted/shrunk to stay inside the image.
pub fn padded_square(bbox: &BoundingBox, padding: f32, width: u32, height: u32) -> (u32, u32, u32) {
    let (cx, cy) = bbox.center();
    let face = bbox.width.max(bbox.height).max(1.0);
    let wanted = face * (1.0 + 2.0 * padding.max(0.0));

    let side = (wanted.round() as u32).clamp(1, width.min(height).max(1));
    let half = side as f32 / 2.0;
    let max_x = width.saturating_sub(side) as f32;
    let max_y = height.saturating_sub(side) as f32;
    let x = (cx - half).clamp(0.0, max_x).round() as u32;
    let y = (cy - half).clamp(0.0, max_y).round() as u32;

    (x, y, side)
}

/// Crop the padded square around a face.
pub fn crop_face(image: &RgbImage, bbox: &BoundingBox, padding: f32) -> RgbImage {
    let (x, y, side) = padded_square(bbox, padding, image.width(), image.height());
    imageops::crop_imm(image, x, y, side, side).to_image()
}

/// Resize with the aspect ratio kept and centre the result on a black
/// `size`×`size` canvas.
pub fn letterbox_square(image: &RgbImage, size: u32) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || size == 0 {
        return canvas;
    }

    let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let off_x = i64::from((size - new_w) / 2);
    let off_y = i64::from((size - new_h) / 2);
    imageops::overlay(&mut canvas, &resized, off_x, off_y);
    canvas
}

pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
