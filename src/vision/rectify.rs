//! Perspective rectification
//!
//! Maps the detected card quadrilateral onto a fixed-size canonical image.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

use crate::capture::Frame;
use crate::config::CanonicalConfig;
use crate::vision::geometry::Quadrilateral;

#[derive(Debug, Error, PartialEq)]
pub enum RectifyError {
    #[error("quadrilateral is degenerate, no projective transform exists")]
    DegenerateQuad,
}

/// Flat, fixed-size image of one card
#[derive(Debug, Clone)]
pub struct CanonicalCard {
    image: RgbImage,
}

impl CanonicalCard {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// JPEG encoding used for the cloud request
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, image::ImageError> {
        let mut buffer = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality);
        self.image.write_with_encoder(encoder)?;
        Ok(buffer)
    }
}

/// Projects card quadrilaterals onto the canonical rectangle
#[derive(Debug, Clone)]
pub struct Rectifier {
    config: CanonicalConfig,
}

impl Rectifier {
    pub fn new(config: CanonicalConfig) -> Self {
        Self { config }
    }

    /// Canonical corners matching `Quadrilateral::corners` order
    fn target_corners(&self) -> [(f32, f32); 4] {
        let w = (self.config.width.max(1) - 1) as f32;
        let h = (self.config.height.max(1) - 1) as f32;
        [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
    }

    /// Resample the frame region under `quad` into a canonical card
    pub fn rectify(&self, frame: &Frame, quad: &Quadrilateral) -> Result<CanonicalCard, RectifyError> {
        let start = Instant::now();
        if quad.area() < 1.0 {
            return Err(RectifyError::DegenerateQuad);
        }

        let from = quad.corners().map(|p| (p.x, p.y));
        let projection =
            Projection::from_control_points(from, self.target_corners()).ok_or(RectifyError::DegenerateQuad)?;

        let mut out = RgbImage::new(self.config.width, self.config.height);
        warp_into(
            &frame.image,
            &projection,
            Interpolation::Bilinear,
            Rgb(self.config.padding),
            &mut out,
        );

        debug!(
            "Rectified {:?} to {}x{} in {:?}",
            quad.corners(),
            self.config.width,
            self.config.height,
            start.elapsed()
        );

        Ok(CanonicalCard::new(out))
    }
}
