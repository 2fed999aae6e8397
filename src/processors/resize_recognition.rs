//! Recognition-specific resizing.
//!
//! Field crops are scaled to the recognition model's fixed input height keeping the
//! aspect ratio, capped at the fixed width and right-padded with black, then
//! normalized to `[-1, 1]`.

use crate::core::errors::{OCRError, OcrResult};
use image::{RgbImage, imageops};
use ndarray::Array3;

/// Fixed recognition input geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecResize {
    /// Input height.
    pub height: u32,
    /// Input width.
    pub width: u32,
}

impl RecResize {
    /// Creates a resizer for a `height` × `width` input.
    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    /// Width a crop occupies after scaling to the input height, capped at the input width.
    pub fn scaled_width(&self, img: &RgbImage) -> u32 {
        if img.height() == 0 {
            return 1;
        }
        let ratio = img.width() as f32 / img.height() as f32;
        ((self.height as f32 * ratio).ceil() as u32).clamp(1, self.width)
    }

    /// Resizes keeping the aspect ratio and right-pads to the fixed width.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty crop.
    pub fn resize_pad(&self, img: &RgbImage) -> OcrResult<RgbImage> {
        if img.width() == 0 || img.height() == 0 {
            return Err(OCRError::invalid_input("cannot resize an empty field crop"));
        }
        let resized_w = self.scaled_width(img);
        // Triangle (bilinear) to match cv2 INTER_LINEAR
        let resized = imageops::resize(img, resized_w, self.height, imageops::FilterType::Triangle);
        let mut padded = RgbImage::new(self.width, self.height);
        imageops::replace(&mut padded, &resized, 0, 0);
        Ok(padded)
    }

    /// Converts a resized crop to a `[3, H, W]` tensor normalized to `[-1, 1]`.
    ///
    /// Only the content columns are normalized; padding stays zero.
    pub fn to_tensor(&self, padded: &RgbImage, content_width: u32) -> Array3<f32> {
        let (h, w) = (self.height as usize, self.width as usize);
        let mut tensor = Array3::<f32>::zeros((3, h, w));
        let content = (content_width as usize).min(w).min(padded.width() as usize);
        for y in 0..h.min(padded.height() as usize) {
            for x in 0..content {
                let px = padded.get_pixel(x as u32, y as u32);
                for c in 0..3 {
                    tensor[[c, y, x]] = px[c] as f32 / 127.5 - 1.0;
                }
            }
        }
        tensor
    }

    /// Full preprocessing of one crop into a `[3, H, W]` tensor.
    pub fn preprocess(&self, img: &RgbImage) -> OcrResult<Array3<f32>> {
        let padded = self.resize_pad(img)?;
        Ok(self.to_tensor(&padded, self.scaled_width(img)))
    }
}
