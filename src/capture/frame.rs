//! Frame data structures for captured video content

use image::{DynamicImage, RgbImage, RgbaImage};
use std::time::Instant;

/// A single frame from the video feed
#[derive(Debug, Clone)]
pub struct Frame {
    /// RGB pixel data
    pub image: RgbImage,
    /// Timestamp when frame was captured
    pub captured_at: Instant,
}

impl Frame {
    /// Wrap an RGB image captured now
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from raw RGBA samples; alpha is dropped
    pub fn from_rgba(data: Vec<u8>, width: u32, height: u32) -> Option<Self> {
        let rgba = RgbaImage::from_raw(width, height, data)?;
        Some(Self::new(DynamicImage::ImageRgba8(rgba).to_rgb8()))
    }

    /// Build a frame from raw RGB samples
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Option<Self> {
        RgbImage::from_raw(width, height, data).map(Self::new)
    }

    /// Convert any decoded image into a frame
    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self::new(image.to_rgb8())
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
