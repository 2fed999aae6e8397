//! Debug rendering of detected field boxes.
//!
//! Draws every field box of a [`FieldBoxSet`] onto a copy of the rectified frame:
//! detected boxes in green, injected backup boxes in orange.

use crate::domain::FieldBoxSet;
use crate::processors::geometry::BoundingBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

/// Color for detected field boxes.
const BBOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Color for injected backup boxes.
const SYNTHETIC_COLOR: Rgb<u8> = Rgb([255, 140, 0]);
/// Border thickness in pixels.
const THICKNESS: i32 = 2;

/// Returns a copy of `frame` with every field box outlined.
pub fn draw_field_boxes(frame: &RgbImage, boxes: &FieldBoxSet) -> RgbImage {
    let mut canvas = frame.clone();
    for field in boxes {
        let color = if field.synthetic {
            SYNTHETIC_COLOR
        } else {
            BBOX_COLOR
        };
        draw_bounding_box(&mut canvas, &field.bbox, color);
    }
    canvas
}

fn draw_bounding_box(img: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (img_w, img_h) = (img.width() as i32, img.height() as i32);
    let x = bbox.x1.round() as i32;
    let y = bbox.y1.round() as i32;
    let w = bbox.width().round() as i32;
    let h = bbox.height().round() as i32;

    for t in 0..THICKNESS {
        let (tw, th) = (w - 2 * t, h - 2 * t);
        if tw <= 0 || th <= 0 || x + t >= img_w || y + t >= img_h {
            break;
        }
        draw_hollow_rect_mut(img, Rect::at(x + t, y + t).of_size(tw as u32, th as u32), color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldBox;

    #[test]
    fn test_draws_outline_only() {
        let frame = RgbImage::new(50, 50);
        let boxes = FieldBoxSet::from_unsorted(vec![
            FieldBox::new("name", 0.9, BoundingBox::new(10.0, 10.0, 30.0, 30.0)),
            FieldBox::synthetic("id_number", BoundingBox::new(5.0, 40.0, 20.0, 48.0)),
        ]);
        let drawn = draw_field_boxes(&frame, &boxes);
        assert_eq!(drawn.get_pixel(10, 10), &BBOX_COLOR);
        assert_eq!(drawn.get_pixel(20, 20), &Rgb([0, 0, 0]));
        assert_eq!(drawn.get_pixel(5, 40), &SYNTHETIC_COLOR);
        assert_eq!(frame.get_pixel(10, 10), &Rgb([0, 0, 0]));
    }
}
