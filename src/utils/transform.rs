//! Geometric image transforms used for document rectification.
//!
//! This module provides the projective transform solved from four point
//! correspondences, inverse-mapped warping with bilinear sampling, and the
//! lossless (canvas-expanding) rotation used by the rotation retry sweep.

use crate::core::errors::{OCRError, OcrResult};
use crate::domain::Rotation;
use crate::processors::geometry::{Point, Quad};
use image::{Rgb, RgbImage, imageops};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Serialize, Serializer};
use tracing::debug;

/// A 3×3 projective transform from source pixel coordinates to target pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography(pub Matrix3<f32>);

impl Homography {
    /// Identity transform.
    pub fn identity() -> Self {
        Self(Matrix3::identity())
    }

    /// Maps a point through the transform. Returns `None` for points sent to infinity.
    pub fn apply(&self, point: Point) -> Option<Point> {
        let mapped = self.0 * Vector3::new(point.x, point.y, 1.0);
        if mapped.z.abs() <= f32::EPSILON {
            return None;
        }
        Some(Point::new(mapped.x / mapped.z, mapped.y / mapped.z))
    }

    /// Row-major matrix entries.
    pub fn rows(&self) -> [[f32; 3]; 3] {
        let m = &self.0;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }
}

impl Serialize for Homography {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.rows().serialize(serializer)
    }
}

/// Calculates the perspective transformation matrix that maps source points to destination points.
///
/// Solves the 8×8 linear system given by four correspondences.
///
/// # Errors
///
/// Returns [`OCRError::InvalidInput`] when the points are degenerate (e.g. collinear)
/// and the system cannot be solved.
pub fn perspective_transform(src: &[Point; 4], dst: &[Point; 4]) -> OcrResult<Homography> {
    let mut a = nalgebra::DMatrix::<f32>::zeros(8, 8);
    let mut b = nalgebra::DVector::<f32>::zeros(8);

    for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
        a.set_row(
            i * 2,
            &nalgebra::RowDVector::from_row_slice(&[
                s.x,
                s.y,
                1.0,
                0.0,
                0.0,
                0.0,
                -s.x * d.x,
                -s.y * d.x,
            ]),
        );
        b[i * 2] = d.x;

        a.set_row(
            i * 2 + 1,
            &nalgebra::RowDVector::from_row_slice(&[
                0.0,
                0.0,
                0.0,
                s.x,
                s.y,
                1.0,
                -s.x * d.y,
                -s.y * d.y,
            ]),
        );
        b[i * 2 + 1] = d.y;
    }

    let solution = a
        .lu()
        .solve(&b)
        .ok_or_else(|| OCRError::invalid_input("cannot solve perspective transformation"))?;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(OCRError::invalid_input(
            "degenerate perspective transformation",
        ));
    }

    Ok(Homography(Matrix3::new(
        solution[0],
        solution[1],
        solution[2],
        solution[3],
        solution[4],
        solution[5],
        solution[6],
        solution[7],
        1.0,
    )))
}

/// Homography mapping `quad` onto an upright rectangle of its rectified size.
///
/// Returns the transform and the `(width, height)` of the target rectangle.
pub fn rectification_homography(quad: &Quad) -> OcrResult<(Homography, u32, u32)> {
    let (width, height) = quad.rectified_size();
    if width == 0 || height == 0 {
        return Err(OCRError::invalid_input("quadrangle has zero extent"));
    }
    let target = [
        Point::new(0.0, 0.0),
        Point::new(width as f32, 0.0),
        Point::new(width as f32, height as f32),
        Point::new(0.0, height as f32),
    ];
    let homography = perspective_transform(&quad.points, &target)?;
    Ok((homography, width, height))
}

/// Applies a perspective transformation to an image.
///
/// Uses inverse mapping with bilinear interpolation; target pixels that map outside
/// the source are black. Rows are processed in parallel.
///
/// # Errors
///
/// Returns [`OCRError::InvalidInput`] when the matrix cannot be inverted.
pub fn warp_perspective(
    src_image: &RgbImage,
    homography: &Homography,
    dst_width: u32,
    dst_height: u32,
) -> OcrResult<RgbImage> {
    let inverse = homography
        .0
        .try_inverse()
        .ok_or_else(|| OCRError::invalid_input("cannot invert transformation matrix"))?;
    Ok(inverse_map(src_image, dst_width, dst_height, |x, y| {
        let src = inverse * Vector3::new(x, y, 1.0);
        if src.z.abs() <= f32::EPSILON {
            None
        } else {
            Some((src.x / src.z, src.y / src.z))
        }
    }))
}

/// Rotates `image` counter-clockwise by `angle_deg`, expanding the canvas so no
/// pixel is clipped. Uncovered corners are filled with black.
pub fn rotate_expand(image: &RgbImage, angle_deg: f32) -> RgbImage {
    let normalized = angle_deg.rem_euclid(360.0);
    let quarter = |target: f32| (normalized - target).abs() < 1e-3;
    if quarter(0.0) || quarter(360.0) {
        return image.clone();
    } else if quarter(90.0) {
        return imageops::rotate270(image);
    } else if quarter(180.0) {
        return imageops::rotate180(image);
    } else if quarter(270.0) {
        return imageops::rotate90(image);
    }

    let (w, h) = (image.width() as f32, image.height() as f32);
    let theta = normalized.to_radians();
    let (sin, cos) = theta.sin_cos();
    let out_w = (w * cos.abs() + h * sin.abs()).ceil().max(1.0) as u32;
    let out_h = (w * sin.abs() + h * cos.abs()).ceil().max(1.0) as u32;
    let (cx, cy) = (w / 2.0, h / 2.0);
    let (ox, oy) = (out_w as f32 / 2.0, out_h as f32 / 2.0);

    debug!(angle = angle_deg, out_w, out_h, "rotating with canvas expansion");

    // Counter-clockwise in image coordinates (y down) is a negative mathematical angle,
    // so the inverse map applies the positive one.
    inverse_map(image, out_w, out_h, |x, y| {
        let dx = x - ox;
        let dy = y - oy;
        Some((cos * dx - sin * dy + cx, sin * dx + cos * dy + cy))
    })
}

/// Turns the image clockwise by the rotation class so detected content becomes upright.
pub fn rotate_by_class(image: &RgbImage, rotation: Rotation) -> RgbImage {
    match rotation {
        Rotation::Deg0 => image.clone(),
        Rotation::Deg90 => imageops::rotate90(image),
        Rotation::Deg180 => imageops::rotate180(image),
        Rotation::Deg270 => imageops::rotate270(image),
    }
}

fn inverse_map<F>(src_image: &RgbImage, dst_width: u32, dst_height: u32, map: F) -> RgbImage
where
    F: Fn(f32, f32) -> Option<(f32, f32)> + Sync,
{
    let mut dst_image = RgbImage::new(dst_width, dst_height);
    if dst_width == 0 || dst_height == 0 || src_image.width() == 0 || src_image.height() == 0 {
        return dst_image;
    }
    let (src_width, src_height) = src_image.dimensions();
    let max_x = (src_width - 1) as f32;
    let max_y = (src_height - 1) as f32;
    let buffer: &mut [u8] = dst_image.as_mut();

    buffer
        .par_chunks_mut((dst_width * 3) as usize)
        .enumerate()
        .for_each(|(dst_y, row_buffer)| {
            for dst_x in 0..dst_width {
                let mut pixel = Rgb([0, 0, 0]);
                if let Some((sx, sy)) = map(dst_x as f32, dst_y as f32)
                    && sx >= -0.5
                    && sy >= -0.5
                    && sx <= max_x + 0.5
                    && sy <= max_y + 0.5
                {
                    pixel = bilinear_interpolate(src_image, sx.clamp(0.0, max_x), sy.clamp(0.0, max_y));
                }
                let index = (dst_x * 3) as usize;
                row_buffer[index..index + 3].copy_from_slice(&pixel.0);
            }
        });

    dst_image
}

fn bilinear_interpolate(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let x1 = x.floor() as u32;
    let y1 = y.floor() as u32;
    let x2 = (x1 + 1).min(image.width() - 1);
    let y2 = (y1 + 1).min(image.height() - 1);
    let dx = x - x1 as f32;
    let dy = y - y1 as f32;

    let p11 = image.get_pixel(x1, y1);
    let p12 = image.get_pixel(x1, y2);
    let p21 = image.get_pixel(x2, y1);
    let p22 = image.get_pixel(x2, y2);

    let mut result = [0u8; 3];
    for (i, channel) in result.iter_mut().enumerate() {
        let val = (1.0 - dx) * (1.0 - dy) * p11.0[i] as f32
            + dx * (1.0 - dy) * p21.0[i] as f32
            + (1.0 - dx) * dy * p12.0[i] as f32
            + dx * dy * p22.0[i] as f32;
        *channel = val.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(result)
}
