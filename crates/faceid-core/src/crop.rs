//! Face crop normalization and image codec helpers.

use image::{ImageFormat, Rgb32FImage, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CropError {
    #[error("image decode failed: {0}")]
    Decode(#[source] image::ImageError),
    #[error("image encode failed: {0}")]
    Encode(#[source] image::ImageError),
    #[error("empty crop")]
    Empty,
}

/// Min-max rescale a float crop into the full 0–255 range.
///
/// The detector emits standardized floats of arbitrary range. A constant
/// crop (max == min) has no range to stretch and maps to black.
pub fn normalize_crop(crop: &Rgb32FImage) -> Result<RgbImage, CropError> {
    let (width, height) = crop.dimensions();
    let raw = crop.as_raw();
    if raw.is_empty() {
        return Err(CropError::Empty);
    }

    let (min, max) = raw
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    let bytes: Vec<u8> = raw
        .iter()
        .map(|&v| {
            if range > 0.0 && v.is_finite() {
                ((v - min) / range * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect();

    RgbImage::from_raw(width, height, bytes).ok_or(CropError::Empty)
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, CropError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(CropError::Encode)?;
    Ok(buf.into_inner())
}

/// Decode any supported image format into 8-bit RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, CropError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(CropError::Decode)
}
