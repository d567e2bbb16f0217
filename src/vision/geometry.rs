//! Quadrilateral geometry
//!
//! Corner ordering, area and proportion checks shared by the boundary
//! detector and the rectifier.

use serde::{Deserialize, Serialize};

/// 2-D point in frame pixel coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn scaled(&self, factor: f32) -> Point {
        Point::new(self.x * factor, self.y * factor)
    }
}

/// Four card corners labelled by role
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Quadrilateral {
    pub tl: Point,
    pub tr: Point,
    pub bl: Point,
    pub br: Point,
}

impl Quadrilateral {
    pub const fn new(tl: Point, tr: Point, bl: Point, br: Point) -> Self {
        Self { tl, tr, bl, br }
    }

    /// Assign corner roles to four unordered points.
    ///
    /// Top-left has the smallest x+y, bottom-right the largest, top-right the
    /// smallest y-x and bottom-left the largest. Returns `None` when two roles
    /// land on the same point.
    pub fn from_unordered(points: [Point; 4]) -> Option<Self> {
        let by = |key: fn(&Point) -> f32, pick_max: bool| -> usize {
            let mut best = 0;
            for i in 1..4 {
                let better = if pick_max {
                    key(&points[i]) > key(&points[best])
                } else {
                    key(&points[i]) < key(&points[best])
                };
                if better {
                    best = i;
                }
            }
            best
        };

        let tl = by(|p| p.x + p.y, false);
        let br = by(|p| p.x + p.y, true);
        let tr = by(|p| p.y - p.x, false);
        let bl = by(|p| p.y - p.x, true);

        let mut seen = [false; 4];
        for i in [tl, tr, bl, br] {
            if seen[i] {
                return None;
            }
            seen[i] = true;
        }

        Some(Self::new(points[tl], points[tr], points[bl], points[br]))
    }

    /// Corners in drawing order (tl, tr, br, bl)
    pub fn ring(&self) -> [Point; 4] {
        [self.tl, self.tr, self.br, self.bl]
    }

    /// Corners in the order used for projective control points (tl, tr, bl, br)
    pub fn corners(&self) -> [Point; 4] {
        [self.tl, self.tr, self.bl, self.br]
    }

    /// Enclosed area (shoelace)
    pub fn area(&self) -> f32 {
        polygon_area(&self.ring())
    }

    /// Average lengths of the horizontal and vertical side pairs
    pub fn side_lengths(&self) -> (f32, f32) {
        let width = (self.tl.distance(&self.tr) + self.bl.distance(&self.br)) / 2.0;
        let height = (self.tl.distance(&self.bl) + self.tr.distance(&self.br)) / 2.0;
        (width, height)
    }

    /// Short edge over long edge, in (0, 1]
    pub fn aspect_ratio(&self) -> f32 {
        let (w, h) = self.side_lengths();
        let long = w.max(h);
        if long <= f32::EPSILON {
            return 0.0;
        }
        w.min(h) / long
    }

    /// True when the corner ring turns the same way at every vertex
    pub fn is_convex(&self) -> bool {
        let ring = self.ring();
        let mut sign = 0.0f32;
        for i in 0..4 {
            let a = ring[i];
            let b = ring[(i + 1) % 4];
            let c = ring[(i + 2) % 4];
            let cross = (b.x - a.x) * (c.y - b.y) - (b.y - a.y) * (c.x - b.x);
            if cross.abs() <= f32::EPSILON {
                return false;
            }
            if sign == 0.0 {
                sign = cross.signum();
            } else if cross.signum() != sign {
                return false;
            }
        }
        true
    }

    /// Multiply every coordinate by `factor`
    pub fn scaled(&self, factor: f32) -> Self {
        Self::new(
            self.tl.scaled(factor),
            self.tr.scaled(factor),
            self.bl.scaled(factor),
            self.br.scaled(factor),
        )
    }
}

/// Area of a simple polygon given in ring order
pub fn polygon_area(points: &[Point]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0f64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        twice += a.x as f64 * b.y as f64 - b.x as f64 * a.y as f64;
    }
    (twice.abs() / 2.0) as f32
}
