//! Card boundary detection
//!
//! Finds the card outline in a single frame. Works on a downsampled luminance
//! copy: equalize, blur away print texture, mark pixels that stand out from
//! their neighbourhood or sit on a Canny edge, then fit quadrilaterals to the
//! resulting contours.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::contours::find_contours;
use imageproc::contrast::equalize_histogram;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::{box_filter, gaussian_blur_f32};
use imageproc::geometry::{approximate_polygon_dp, arc_length, convex_hull};
use imageproc::morphology::dilate;
use imageproc::point::Point as PixelPoint;
use std::time::Instant;
use tracing::{debug, trace};

use crate::capture::Frame;
use crate::config::DetectionConfig;
use crate::vision::geometry::{polygon_area, Point, Quadrilateral};

/// Douglas-Peucker tolerance grows in steps of this fraction of the perimeter
const APPROX_EPSILON_STEP: f64 = 0.01;
/// Largest tolerance tried, in steps
const APPROX_MAX_STEPS: usize = 10;

/// Stateless card boundary detector
#[derive(Debug, Clone)]
pub struct BoundaryDetector {
    config: DetectionConfig,
}

impl BoundaryDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Find the largest card-shaped quadrilateral in the frame
    pub fn detect(&self, frame: &Frame) -> Option<Quadrilateral> {
        let start = Instant::now();
        let (width, height) = frame.dimensions();
        if width < 8 || height < 8 {
            return None;
        }

        let gray = imageops::grayscale(&frame.image);
        let scale = (self.config.max_dimension as f32 / width.max(height) as f32).min(1.0);
        let working = if scale < 1.0 {
            let w = ((width as f32 * scale).round() as u32).max(1);
            let h = ((height as f32 * scale).round() as u32).max(1);
            imageops::resize(&gray, w, h, FilterType::Triangle)
        } else {
            gray
        };

        let mask = self.boundary_mask(&working);
        let best = self.best_quad(&mask);

        debug!(
            "Boundary detection on {}x{} (working {}x{}) in {:?}: {}",
            width,
            height,
            working.width(),
            working.height(),
            start.elapsed(),
            if best.is_some() { "card found" } else { "no card" }
        );

        best.map(|quad| quad.scaled(1.0 / scale))
    }

    /// Binary mask of likely card boundary pixels
    fn boundary_mask(&self, gray: &GrayImage) -> GrayImage {
        let equalized = equalize_histogram(gray);
        let blurred = gaussian_blur_f32(&equalized, self.config.blur_sigma.max(0.1));

        let radius = self.config.threshold_block_radius.max(1);
        let local_mean = box_filter(&blurred, radius, radius);
        let edges = canny(&blurred, self.config.canny_low, self.config.canny_high);

        let offset = self.config.threshold_offset as i16;
        let mut mask = GrayImage::new(gray.width(), gray.height());
        for (x, y, pixel) in mask.enumerate_pixels_mut() {
            let value = blurred.get_pixel(x, y).0[0] as i16;
            let mean = local_mean.get_pixel(x, y).0[0] as i16;
            let on_edge = edges.get_pixel(x, y).0[0] > 0;
            if on_edge || (value - mean).abs() > offset {
                pixel.0[0] = 255;
            }
        }

        dilate(&mask, Norm::LInf, 1)
    }

    /// Largest accepted quadrilateral among the mask contours
    fn best_quad(&self, mask: &GrayImage) -> Option<Quadrilateral> {
        let (width, height) = mask.dimensions();
        let min_area = self.config.min_area_fraction * (width * height) as f32;

        let contours = find_contours::<i32>(mask);
        let mut best: Option<(f32, Quadrilateral)> = None;
        let mut considered = 0usize;

        for contour in &contours {
            if contour.points.len() < 4 {
                continue;
            }
            let outline: Vec<Point> = contour
                .points
                .iter()
                .map(|p| Point::new(p.x as f32, p.y as f32))
                .collect();
            if polygon_area(&outline) < min_area {
                continue;
            }
            considered += 1;

            let Some(quad) = fit_quadrilateral(&contour.points) else {
                trace!("Contour with {} points is not a quadrilateral", contour.points.len());
                continue;
            };
            if !self.accepts(&quad, width, height) {
                continue;
            }

            let area = quad.area();
            if best.map(|(a, _)| area > a).unwrap_or(true) {
                best = Some((area, quad));
            }
        }

        trace!(
            "{} contours, {} above area floor, best area {:?}",
            contours.len(),
            considered,
            best.map(|(a, _)| a)
        );

        best.map(|(_, quad)| quad)
    }

    /// Shape checks applied after corner ordering
    fn accepts(&self, quad: &Quadrilateral, width: u32, height: u32) -> bool {
        if !quad.is_convex() {
            return false;
        }

        let margin = self.config.edge_margin.max(0.0);
        let max_x = width as f32 - 1.0 - margin;
        let max_y = height as f32 - 1.0 - margin;
        let inside = quad
            .corners()
            .iter()
            .all(|p| p.x >= margin && p.y >= margin && p.x <= max_x && p.y <= max_y);
        if !inside {
            return false;
        }

        let aspect = quad.aspect_ratio();
        let accepted = aspect >= self.config.aspect_min && aspect <= self.config.aspect_max;
        if !accepted {
            trace!("Rejecting quad with aspect {:.3}", aspect);
        }
        accepted
    }
}

/// Reduce a contour to four ordered corners.
///
/// The convex hull is simplified with a growing Douglas-Peucker tolerance;
/// the first tolerance that leaves exactly four vertices wins. The closed
/// hull is split at its top-left extreme and the vertex farthest from it,
/// and the two open chains are simplified separately so that both anchors
/// survive.
fn fit_quadrilateral(points: &[PixelPoint<i32>]) -> Option<Quadrilateral> {
    let hull = convex_hull(points);
    if hull.len() < 4 {
        return None;
    }

    let corners = if hull.len() == 4 {
        hull
    } else {
        let start = hull
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.x + p.y)
            .map(|(i, _)| i)?;
        let ring: Vec<PixelPoint<i32>> =
            hull[start..].iter().chain(hull[..start].iter()).copied().collect();

        let anchor = ring[0];
        let far = ring
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| {
                let dx = (p.x - anchor.x) as i64;
                let dy = (p.y - anchor.y) as i64;
                dx * dx + dy * dy
            })
            .map(|(i, _)| i)?;
        if far == 0 {
            return None;
        }

        let perimeter = arc_length(&ring, true);
        if perimeter <= 0.0 {
            return None;
        }

        let mut back: Vec<PixelPoint<i32>> = ring[far..].to_vec();
        back.push(anchor);

        let mut found = None;
        for step in 1..=APPROX_MAX_STEPS {
            let epsilon = perimeter * APPROX_EPSILON_STEP * step as f64;
            let mut approx = approximate_polygon_dp(&ring[..=far], epsilon, false);
            // `far` opens the second chain and `anchor` closes it
            approx.pop();
            approx.extend(approximate_polygon_dp(&back, epsilon, false));
            approx.pop();
            approx.dedup();
            match approx.len() {
                4 => {
                    found = Some(approx);
                    break;
                }
                n if n < 4 => break,
                _ => {}
            }
        }
        found?
    };

    let to_point = |p: &PixelPoint<i32>| Point::new(p.x as f32, p.y as f32);
    Quadrilateral::from_unordered([
        to_point(&corners[0]),
        to_point(&corners[1]),
        to_point(&corners[2]),
        to_point(&corners[3]),
    ])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_polygon_mut;

    /// Dark frame with one bright filled polygon
    pub(crate) fn synthetic_frame(width: u32, height: u32, corners: [(i32, i32); 4]) -> Frame {
        let mut image = RgbImage::from_pixel(width, height, Rgb([40, 40, 40]));
        let poly: Vec<PixelPoint<i32>> = corners
            .iter()
            .map(|&(x, y)| PixelPoint::new(x, y))
            .collect();
        draw_polygon_mut(&mut image, &poly, Rgb([220, 220, 220]));
        Frame::new(image)
    }

    fn assert_near(actual: Point, expected: (f32, f32), tolerance: f32) {
        let d = actual.distance(&Point::new(expected.0, expected.1));
        assert!(
            d <= tolerance,
            "corner {:?} is {:.1}px from expected {:?}",
            actual,
            d,
            expected
        );
    }

    #[test]
    fn test_detects_upright_card() {
        // 200x280 card, aspect 0.714
        let frame = synthetic_frame(640, 480, [(220, 100), (420, 100), (420, 380), (220, 380)]);
        let detector = BoundaryDetector::new(DetectionConfig::default());

        let quad = detector.detect(&frame).expect("card should be detected");
        assert_near(quad.tl, (220.0, 100.0), 16.0);
        assert_near(quad.tr, (420.0, 100.0), 16.0);
        assert_near(quad.bl, (220.0, 380.0), 16.0);
        assert_near(quad.br, (420.0, 380.0), 16.0);
    }

    #[test]
    fn test_detects_perspective_skewed_card() {
        let frame = synthetic_frame(640, 480, [(240, 90), (410, 110), (430, 390), (200, 370)]);
        let detector = BoundaryDetector::new(DetectionConfig::default());

        let quad = detector.detect(&frame).expect("skewed card should be detected");
        assert_near(quad.tl, (240.0, 90.0), 16.0);
        assert_near(quad.br, (430.0, 390.0), 16.0);
        let aspect = quad.aspect_ratio();
        assert!((0.55..=0.90).contains(&aspect), "aspect {}", aspect);
    }

    #[test]
    fn test_detection_is_idempotent() {
        let frame = synthetic_frame(640, 480, [(220, 100), (420, 100), (420, 380), (220, 380)]);
        let detector = BoundaryDetector::new(DetectionConfig::default());

        let first = detector.detect(&frame);
        let second = detector.detect(&frame);
        assert!(first.is_some());
        assert_eq!(first, second);

        let empty = Frame::new(RgbImage::from_pixel(320, 240, Rgb([90, 90, 90])));
        assert_eq!(detector.detect(&empty), None);
        assert_eq!(detector.detect(&empty), None);
    }

    #[test]
    fn test_rejects_narrow_quad() {
        // 140x350 is a valid polygon but its aspect ratio is 0.40
        let frame = synthetic_frame(640, 480, [(250, 65), (390, 65), (390, 415), (250, 415)]);
        let detector = BoundaryDetector::new(DetectionConfig::default());
        assert_eq!(detector.detect(&frame), None);
    }

    #[test]
    fn test_rejects_small_card() {
        // 60x84 covers ~1.6% of the frame, below the 12% area floor
        let frame = synthetic_frame(640, 480, [(300, 200), (360, 200), (360, 284), (300, 284)]);
        let detector = BoundaryDetector::new(DetectionConfig::default());
        assert_eq!(detector.detect(&frame), None);
    }

    #[test]
    fn test_tiny_frame_returns_none() {
        let frame = Frame::new(RgbImage::new(4, 4));
        let detector = BoundaryDetector::new(DetectionConfig::default());
        assert_eq!(detector.detect(&frame), None);
    }

    #[test]
    fn test_fit_quadrilateral_on_square_outline() {
        let mut outline = Vec::new();
        for i in 0..=50 {
            outline.push(PixelPoint::new(10 + i, 10));
            outline.push(PixelPoint::new(60, 10 + i));
            outline.push(PixelPoint::new(60 - i, 60));
            outline.push(PixelPoint::new(10, 60 - i));
        }
        let quad = fit_quadrilateral(&outline).unwrap();
        assert_eq!(quad.tl, Point::new(10.0, 10.0));
        assert_eq!(quad.br, Point::new(60.0, 60.0));
    }

    #[test]
    fn test_fit_quadrilateral_on_chamfered_outline() {
        // 200x280 rectangle with 3px chamfers: an eight-vertex hull
        let outline: Vec<PixelPoint<i32>> = [
            (13, 10),
            (207, 10),
            (210, 13),
            (210, 287),
            (207, 290),
            (13, 290),
            (10, 287),
            (10, 13),
        ]
        .iter()
        .map(|&(x, y)| PixelPoint::new(x, y))
        .collect();
        assert_eq!(convex_hull(&*outline).len(), 8);

        let quad = fit_quadrilateral(&outline).expect("chamfered rectangle is a quadrilateral");
        assert_near(quad.tl, (10.0, 10.0), 5.0);
        assert_near(quad.tr, (210.0, 10.0), 5.0);
        assert_near(quad.bl, (10.0, 290.0), 5.0);
        assert_near(quad.br, (210.0, 290.0), 5.0);
    }

    #[test]
    fn test_fit_quadrilateral_on_dense_skewed_outline() {
        // Every pixel along the edges of a skewed quad
        let corners: [(i32, i32); 4] = [(40, 20), (230, 45), (250, 330), (15, 300)];
        let mut outline = Vec::new();
        for i in 0..4 {
            let (x0, y0) = corners[i];
            let (x1, y1) = corners[(i + 1) % 4];
            let steps = (x1 - x0).abs().max((y1 - y0).abs());
            for s in 0..steps {
                outline.push(PixelPoint::new(
                    x0 + (x1 - x0) * s / steps,
                    y0 + (y1 - y0) * s / steps,
                ));
            }
        }
        let quad = fit_quadrilateral(&outline).expect("skewed outline is a quadrilateral");
        assert_near(quad.tl, (40.0, 20.0), 3.0);
        assert_near(quad.tr, (230.0, 45.0), 3.0);
        assert_near(quad.br, (250.0, 330.0), 3.0);
        assert_near(quad.bl, (15.0, 300.0), 3.0);
    }

    #[test]
    fn test_edge_margin_is_configurable() {
        let quad = Quadrilateral::new(
            Point::new(0.0, 0.0),
            Point::new(200.0, 0.0),
            Point::new(0.0, 280.0),
            Point::new(200.0, 280.0),
        );
        let strict = BoundaryDetector::new(DetectionConfig::default());
        assert!(!strict.accepts(&quad, 320, 320));

        let relaxed = BoundaryDetector::new(DetectionConfig {
            edge_margin: 0.0,
            ..DetectionConfig::default()
        });
        assert!(relaxed.accepts(&quad, 320, 320));
    }
}
