//! Image preprocessing for text recognition
//!
//! Card text bands are small and printed over artwork; each crop is
//! upscaled, reduced to luminance and binarized before it reaches the
//! recognizer.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use tracing::debug;

use crate::config::FractionalRect;

/// Crop a fractional band out of the canonical image
pub fn crop_band(image: &RgbImage, band: &FractionalRect) -> RgbImage {
    let (x, y, w, h) = band.to_pixels(image.width(), image.height());
    imageops::crop_imm(image, x, y, w, h).to_image()
}

/// Crop, upscale and binarize a band for recognition
pub fn prepare_band(image: &RgbImage, band: &FractionalRect, scale: u32, threshold: u8) -> GrayImage {
    let crop = crop_band(image, band);
    let upscaled = apply_upscale(&crop, scale);
    let gray = apply_grayscale(&upscaled);
    let binary = apply_threshold(&gray, threshold);

    debug!(
        "Prepared band {}x{} -> {}x{} (scale {}, threshold {})",
        crop.width(),
        crop.height(),
        binary.width(),
        binary.height(),
        scale,
        threshold
    );

    binary
}

/// Luminance with the standard 0.299/0.587/0.114 weights
fn apply_grayscale(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let Rgb([r, g, b]) = *image.get_pixel(x, y);
        let gray = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([gray as u8])
    })
}

/// Pixels at or above the threshold become white, the rest black
fn apply_threshold(image: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        if image.get_pixel(x, y).0[0] >= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Upscale by an integer factor with a triangle (bilinear) filter.
/// A factor of 1 or less returns the crop unchanged.
fn apply_upscale(image: &RgbImage, scale: u32) -> RgbImage {
    if scale <= 1 || image.width() == 0 || image.height() == 0 {
        return image.clone();
    }
    imageops::resize(image, image.width() * scale, image.height() * scale, FilterType::Triangle)
}
