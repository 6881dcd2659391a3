//! Box overlay for the streaming path.
//!
//! Draws rectangle outlines only. Labels and counts are left to whoever
//! consumes the stats endpoint.

use image::{Rgb, RgbImage};

use crate::detect::{Category, Detection};
use crate::frame::RawFrame;

const BOX_THICKNESS: i32 = 2;

fn category_color(category: Category) -> Rgb<u8> {
    match category {
        Category::Person => Rgb([0, 255, 0]),
        Category::Vehicle => Rgb([255, 0, 0]),
    }
}

/// Return a copy of `frame` with every detection's box drawn on it.
///
/// The input frame is left untouched. Boxes are clamped to the frame; a box
/// entirely outside it draws nothing.
pub fn annotate(frame: &RawFrame, detections: &[Detection]) -> RawFrame {
    let pixels = frame.pixels().to_vec();
    if detections.is_empty() {
        return frame.with_pixels(pixels);
    }
    let Some(mut image) = RgbImage::from_raw(frame.width, frame.height, pixels) else {
        return frame.with_pixels(frame.pixels().to_vec());
    };

    for detection in detections {
        let bbox = detection.bbox;
        draw_rectangle(
            &mut image,
            bbox.x.round() as i32,
            bbox.y.round() as i32,
            (bbox.x + bbox.w).round() as i32,
            (bbox.y + bbox.h).round() as i32,
            category_color(detection.category),
        );
    }

    frame.with_pixels(image.into_raw())
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let max_x = image.width() as i32 - 1;
    let max_y = image.height() as i32 - 1;
    if right < 0 || bottom < 0 || left > max_x || top > max_y {
        return;
    }
    let left = left.clamp(0, max_x);
    let right = right.clamp(0, max_x);
    let top = top.clamp(0, max_y);
    let bottom = bottom.clamp(0, max_y);
    if left > right || top > bottom {
        return;
    }

    for t in 0..BOX_THICKNESS {
        for x in left..=right {
            put(image, x, top + t, color);
            put(image, x, bottom - t, color);
        }
        for y in top..=bottom {
            put(image, left + t, y, color);
            put(image, right - t, y, color);
        }
    }
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}
