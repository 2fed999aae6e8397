//! Geometric primitives for boundary and field processing.
//!
//! Field boxes are axis-aligned [`BoundingBox`]es in pixel coordinates. Document
//! outlines are [`Quad`]s whose corners are ordered top-left, top-right,
//! bottom-right, bottom-left.

use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};
use serde::{Deserialize, Serialize};

/// A 2D point with floating-point coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// X-coordinate of the point.
    pub x: f32,
    /// Y-coordinate of the point.
    pub y: f32,
}

impl Point {
    /// Creates a new point with the given coordinates.
    #[inline]
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Axis-aligned box `(x1, y1)`–`(x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
}

impl BoundingBox {
    /// Creates a box, swapping coordinates if they are given in the wrong order.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Box covering a whole `width` × `height` image.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }

    /// Box width.
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    /// Box height.
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Box area.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Centre point.
    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Area of the intersection with `other`.
    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    /// Intersection over union with `other`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 { 0.0 } else { inter / union }
    }

    /// Vertical overlap divided by the smaller of the two heights.
    pub fn vertical_overlap(&self, other: &BoundingBox) -> f32 {
        let overlap = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let min_h = self.height().min(other.height());
        if min_h <= 0.0 { 0.0 } else { overlap / min_h }
    }

    /// Horizontal gap between the boxes, zero when they overlap horizontally.
    pub fn horizontal_gap(&self, other: &BoundingBox) -> f32 {
        (self.x1.max(other.x1) - self.x2.min(other.x2)).max(0.0)
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.x1.min(other.x1),
            self.y1.min(other.y1),
            self.x2.max(other.x2),
            self.y2.max(other.y2),
        )
    }

    /// Multiplies x coordinates by `sx` and y coordinates by `sy`.
    pub fn scale(&self, sx: f32, sy: f32) -> BoundingBox {
        BoundingBox::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    /// Grows the box by `dx` horizontally and `dy` vertically on each side.
    pub fn expand(&self, dx: f32, dy: f32) -> BoundingBox {
        BoundingBox::new(self.x1 - dx, self.y1 - dy, self.x2 + dx, self.y2 + dy)
    }

    /// Clamps the box into a `width` × `height` frame.
    pub fn clamp(&self, width: u32, height: u32) -> BoundingBox {
        let (w, h) = (width as f32, height as f32);
        BoundingBox::new(
            self.x1.clamp(0.0, w),
            self.y1.clamp(0.0, h),
            self.x2.clamp(0.0, w),
            self.y2.clamp(0.0, h),
        )
    }

    /// Integer crop window `(x, y, w, h)` inside a `width` × `height` frame, if non-empty.
    pub fn to_crop_window(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamped = self.clamp(width, height);
        let x = clamped.x1.floor() as u32;
        let y = clamped.y1.floor() as u32;
        let right = (clamped.x2.ceil() as u32).min(width);
        let bottom = (clamped.y2.ceil() as u32).min(height);
        if right <= x || bottom <= y {
            None
        } else {
            Some((x, y, right - x, bottom - y))
        }
    }

    /// Corners as a quad.
    pub fn to_quad(&self) -> Quad {
        Quad::new([
            Point::new(self.x1, self.y1),
            Point::new(self.x2, self.y1),
            Point::new(self.x2, self.y2),
            Point::new(self.x1, self.y2),
        ])
    }
}

/// Four corners ordered top-left, top-right, bottom-right, bottom-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad {
    /// Corner points.
    pub points: [Point; 4],
}

impl Quad {
    /// Creates a quad from already ordered corners.
    pub fn new(points: [Point; 4]) -> Self {
        Self { points }
    }

    /// Orders an arbitrary set of points by the extreme sums and differences
    /// of their coordinates. Returns `None` for fewer than four points.
    pub fn from_extreme_points(points: &[Point]) -> Option<Self> {
        if points.len() < 4 {
            return None;
        }
        let by = |key: fn(&Point) -> f32, max: bool| -> Point {
            let iter = points.iter().copied();
            let pick = if max {
                iter.max_by(|a, b| key(a).total_cmp(&key(b)))
            } else {
                iter.min_by(|a, b| key(a).total_cmp(&key(b)))
            };
            pick.unwrap_or(points[0])
        };
        let quad = Self::new([
            by(|p| p.x + p.y, false),
            by(|p| p.x - p.y, true),
            by(|p| p.x + p.y, true),
            by(|p| p.x - p.y, false),
        ]);
        (quad.area() >= 1.0).then_some(quad)
    }

    /// Area by the shoelace formula.
    pub fn area(&self) -> f32 {
        let mut area = 0.0;
        for i in 0..4 {
            let j = (i + 1) % 4;
            area += self.points[i].x * self.points[j].y;
            area -= self.points[j].x * self.points[i].y;
        }
        area.abs() / 2.0
    }

    /// Axis-aligned bounds of the quad.
    pub fn bounds(&self) -> BoundingBox {
        let xs = self.points.iter().map(|p| p.x);
        let ys = self.points.iter().map(|p| p.y);
        BoundingBox::new(
            xs.clone().fold(f32::INFINITY, f32::min),
            ys.clone().fold(f32::INFINITY, f32::min),
            xs.fold(f32::NEG_INFINITY, f32::max),
            ys.fold(f32::NEG_INFINITY, f32::max),
        )
    }

    /// Scales every corner.
    pub fn scale(&self, sx: f32, sy: f32) -> Quad {
        Quad::new(self.points.map(|p| Point::new(p.x * sx, p.y * sy)))
    }

    /// Size of the rectified rectangle: averages of opposite edge lengths.
    pub fn rectified_size(&self) -> (u32, u32) {
        let [tl, tr, br, bl] = self.points;
        let width = (tl.distance(&tr) + bl.distance(&br)) / 2.0;
        let height = (tl.distance(&bl) + tr.distance(&br)) / 2.0;
        (width.round() as u32, height.round() as u32)
    }
}

/// Extracts the document quadrangle from a binary instance mask.
///
/// The largest outer contour is taken as the document outline and its corners are
/// chosen by extreme coordinate sums and differences, which follows perspective
/// skew. Returns `None` for an empty or degenerate mask.
pub fn quad_from_mask(mask: &GrayImage) -> Option<Quad> {
    let contours = find_contours::<u32>(mask);
    let outline = contours
        .iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .max_by_key(|c| c.points.len())?;
    let points: Vec<Point> = outline
        .points
        .iter()
        .map(|p| Point::new(p.x as f32, p.y as f32))
        .collect();
    Quad::from_extreme_points(&points)
}
