use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

use crate::geometry::Rect;

pub const WHITE: Luma<u8> = Luma([u8::MAX]);
pub const BLACK: Luma<u8> = Luma([u8::MIN]);

/// Bleed the given luma value outwards from any pixels that match it.
pub fn bleed(img: &GrayImage, luma: &Luma<u8>) -> GrayImage {
    let mut out = img.clone();
    for (x, y, pixel) in img.enumerate_pixels() {
        if *pixel != *luma {
            continue;
        }

        if x > 0 {
            out.put_pixel(x - 1, y, *pixel);
        }
        if x + 1 < img.width() {
            out.put_pixel(x + 1, y, *pixel);
        }
        if y > 0 {
            out.put_pixel(x, y - 1, *pixel);
        }
        if y + 1 < img.height() {
            out.put_pixel(x, y + 1, *pixel);
        }
    }

    out
}

/// Dilates dark pixels by one pixel so that printed edges absorb a little
/// registration noise.
pub fn outline(img: &GrayImage) -> GrayImage {
    bleed(img, &BLACK)
}

/// Generates an image from two images where corresponding pixels in `compare`
/// that are darker than their counterpart in `base` show up with the luminosity
/// difference between the two. This is useful for determining where a
/// light-background form was filled out, for example.
///
/// ```text
///         BASE                  COMPARE                 DIFF
/// ┌───────────────────┐  ┌───────────────────┐  ┌───────────────────┐
/// │                   │  │        █ █ ███    │  │        █ █ ███    │
/// │ █ █               │  │ █ █    ███  █     │  │        ███  █     │
/// │  █                │  │  █     █ █ ███    │  │        █ █ ███    │
/// │ █ █ █████████████ │  │ █ █ █████████████ │  │                   │
/// └───────────────────┘  └───────────────────┘  └───────────────────┘
/// ```
///
/// Only the overlapping area of the two images is compared.
pub fn diff(base: &GrayImage, compare: &GrayImage) -> GrayImage {
    let width = base.width().min(compare.width());
    let height = base.height().min(compare.height());
    let mut out = GrayImage::from_pixel(width, height, WHITE);

    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let base_luma = base.get_pixel(x, y).0[0];
        let compare_luma = compare.get_pixel(x, y).0[0];
        let darkening = base_luma.saturating_sub(compare_luma);
        *pixel = Luma([u8::MAX - darkening]);
    }

    out
}

/// Determines the number of pixels in an image that match the given luma.
pub fn count_pixels(img: &GrayImage, luma: &Luma<u8>) -> u32 {
    img.pixels().filter(|p| *p == luma).count() as u32
}

/// Copies `bounds` out of `img`. Any part of `bounds` outside the image is
/// filled with `fill`.
pub fn crop(img: &GrayImage, bounds: &Rect, fill: Luma<u8>) -> GrayImage {
    let mut out = GrayImage::from_pixel(bounds.width, bounds.height, fill);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let source_x = bounds.x + x as i32;
        let source_y = bounds.y + y as i32;
        if source_x < 0 || source_y < 0 {
            continue;
        }
        if let Some(source) = img.get_pixel_checked(source_x as u32, source_y as u32) {
            *pixel = *source;
        }
    }
    out
}

/// Rotates an image 180° in place.
pub fn flip_in_place(img: &mut GrayImage) {
    imageops::rotate180_in_place(img);
}

/// Scales `img` to exactly `width` x `height`.
pub fn resize_to(img: &GrayImage, width: u32, height: u32) -> GrayImage {
    if img.dimensions() == (width, height) {
        return img.clone();
    }
    imageops::resize(img, width, height, FilterType::Triangle)
}

/// Scales `img` down so that it is no wider than `max_width`, returning the
/// scaled image and the factor applied.
pub fn size_image_to_fit(img: &GrayImage, max_width: u32) -> (GrayImage, f32) {
    if img.width() <= max_width {
        return (img.clone(), 1.0);
    }
    let scale = max_width as f32 / img.width() as f32;
    let height = ((img.height() as f32 * scale).round() as u32).max(1);
    (resize_to(img, max_width, height), scale)
}
