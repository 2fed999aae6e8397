//! Utility functions for the extraction cascade.
//!
//! This module provides image loading and manipulation, geometric transforms and
//! debug rendering.

pub mod image;
pub mod transform;
pub mod visualization;

pub use self::image::{crop, decode_image, detection_tensor, erode, load_image, orient_wide};
pub use self::transform::{Homography, rotate_by_class, rotate_expand, warp_perspective};
