//! Pre- and post-processing building blocks.
//!
//! Geometry primitives shared by the cascade stages, mask-to-quadrangle
//! extraction, recognition resizing and greedy decoding of recognition outputs.

pub mod decode;
pub mod geometry;
pub mod resize_recognition;

pub use decode::GreedyDecoder;
pub use geometry::{BoundingBox, Point, Quad, quad_from_mask};
pub use resize_recognition::RecResize;
