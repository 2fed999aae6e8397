//! Utility functions for image processing.
//!
//! This module provides loading and decoding of input photographs, crop and
//! erosion helpers used by the boundary retries, and conversion of RGB buffers
//! into normalized NCHW tensors for the model artifacts.

use crate::core::errors::{OCRError, OcrResult};
use crate::processors::geometry::BoundingBox;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::{Array4, ArrayD};
use rayon::prelude::*;

/// ImageNet channel means, used by the detection artifacts.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts a DynamicImage to an RgbImage.
pub fn dynamic_to_rgb(img: DynamicImage) -> RgbImage {
    img.to_rgb8()
}

/// Loads an image from a file path and converts it to RgbImage.
///
/// # Errors
///
/// Returns [`OCRError::ImageLoad`] if the file cannot be opened or decoded.
pub fn load_image(path: &std::path::Path) -> OcrResult<RgbImage> {
    let img = image::open(path).map_err(OCRError::ImageLoad)?;
    Ok(dynamic_to_rgb(img))
}

/// Decodes an encoded image (PNG, JPEG, ...) held in memory.
///
/// # Errors
///
/// Returns [`OCRError::ImageLoad`] if the bytes are not a supported image.
pub fn decode_image(bytes: &[u8]) -> OcrResult<RgbImage> {
    let img = image::load_from_memory(bytes).map_err(OCRError::ImageLoad)?;
    Ok(dynamic_to_rgb(img))
}

/// Copies the pixels under `bbox` into a new image. `None` when the window is empty.
pub fn crop(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = bbox.to_crop_window(image.width(), image.height())?;
    Some(imageops::crop_imm(image, x, y, w, h).to_image())
}

/// Removes `ratio` of the width and height from every side of the image.
///
/// Always keeps at least one pixel in each dimension.
pub fn erode(image: &RgbImage, ratio: f32) -> RgbImage {
    let (w, h) = image.dimensions();
    let dx = ((w as f32 * ratio).floor() as u32).min(w.saturating_sub(1) / 2);
    let dy = ((h as f32 * ratio).floor() as u32).min(h.saturating_sub(1) / 2);
    let new_w = (w - 2 * dx).max(1);
    let new_h = (h - 2 * dy).max(1);
    imageops::crop_imm(image, dx, dy, new_w, new_h).to_image()
}

/// Rotates a portrait image a quarter turn clockwise so its long side is horizontal.
///
/// Returns the (possibly rotated) image and whether a rotation happened.
pub fn orient_wide(image: &RgbImage) -> (RgbImage, bool) {
    if image.height() > image.width() {
        (imageops::rotate90(image), true)
    } else {
        (image.clone(), false)
    }
}

/// Resizes `image` to exactly `width` × `height` without keeping the aspect ratio.
pub fn resize_exact(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// Converts an RGB image into a `[1, 3, H, W]` tensor, `(px / 255 - mean) / std` per channel.
pub fn to_nchw_tensor(image: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> OcrResult<ArrayD<f32>> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    if w == 0 || h == 0 {
        return Err(OCRError::invalid_input("cannot build a tensor from an empty image"));
    }
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    let plane = h * w;
    let raw = image.as_raw();
    if let Some(data) = tensor.as_slice_mut() {
        data.par_chunks_mut(plane).enumerate().for_each(|(c, out)| {
            let scale = 1.0 / (255.0 * std[c]);
            let shift = mean[c] / std[c];
            for (i, value) in out.iter_mut().enumerate() {
                *value = raw[i * 3 + c] as f32 * scale - shift;
            }
        });
    }
    Ok(tensor.into_dyn())
}

/// ImageNet-normalized `[1, 3, height, width]` tensor of `image` after a plain resize.
pub fn detection_tensor(image: &RgbImage, width: u32, height: u32) -> OcrResult<ArrayD<f32>> {
    let resized = resize_exact(image, width, height);
    to_nchw_tensor(&resized, IMAGENET_MEAN, IMAGENET_STD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_erode_removes_ratio_per_side() {
        let image = RgbImage::new(100, 50);
        let eroded = erode(&image, 0.1);
        assert_eq!(eroded.dimensions(), (80, 40));
        let tiny = erode(&RgbImage::new(2, 2), 0.4);
        assert_eq!(tiny.dimensions(), (2, 2));
    }

    #[test]
    fn test_orient_wide_rotates_portrait_only() {
        let (out, rotated) = orient_wide(&RgbImage::new(30, 60));
        assert!(rotated);
        assert_eq!(out.dimensions(), (60, 30));
        let (out, rotated) = orient_wide(&RgbImage::new(60, 30));
        assert!(!rotated);
        assert_eq!(out.dimensions(), (60, 30));
    }

    #[test]
    fn test_crop_clamps_to_image() {
        let image = RgbImage::new(10, 10);
        let out = crop(&image, &BoundingBox::new(5.0, 5.0, 20.0, 20.0)).unwrap();
        assert_eq!(out.dimensions(), (5, 5));
        assert!(crop(&image, &BoundingBox::new(11.0, 11.0, 20.0, 20.0)).is_none());
    }

    #[test]
    fn test_to_nchw_tensor_normalizes_channels() {
        let image = RgbImage::from_pixel(2, 1, Rgb([255, 0, 128]));
        let tensor = to_nchw_tensor(&image, [0.5; 3], [0.5; 3]).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
        assert!((tensor[[0, 0, 0, 1]] - 1.0).abs() < 1e-5);
        assert!((tensor[[0, 1, 0, 0]] + 1.0).abs() < 1e-5);
        assert!(tensor[[0, 2, 0, 0]].abs() < 0.01);
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        let err = decode_image(b"not an image").unwrap_err();
        assert!(matches!(err, OCRError::ImageLoad(_)));
    }
}
