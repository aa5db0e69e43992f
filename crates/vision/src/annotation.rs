//! Drawing primitives for detector overlays on RGB display frames.
//!
//! Text uses a built-in 5x7 bitmap font scaled by an integer factor, so no
//! font assets are needed at runtime.

use image::{Rgb, RgbImage};
use ml_core::{BoundingBox, TrackMask};

pub(crate) const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub(crate) const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub(crate) const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
pub(crate) const CYAN: Rgb<u8> = Rgb([0, 255, 255]);
pub(crate) const ORANGE: Rgb<u8> = Rgb([255, 69, 0]);
pub(crate) const GREY: Rgb<u8> = Rgb([192, 192, 192]);
pub(crate) const MAGENTA: Rgb<u8> = Rgb([255, 0, 255]);
pub(crate) const BLUE: Rgb<u8> = Rgb([0, 0, 255]);

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;

/// Outline `bbox` with a border `thickness` pixels wide, growing inwards.
pub(crate) fn draw_rectangle(image: &mut RgbImage, bbox: BoundingBox, color: Rgb<u8>, thickness: i32) {
    let bbox = bbox.clamp_to(image.width(), image.height());
    for inset in 0..thickness.max(1) {
        let left = bbox.x1 + inset;
        let top = bbox.y1 + inset;
        let right = bbox.x2 - inset;
        let bottom = bbox.y2 - inset;
        if left > right || top > bottom {
            break;
        }
        for x in left..=right {
            put_pixel(image, x, top, color);
            put_pixel(image, x, bottom, color);
        }
        for y in top..=bottom {
            put_pixel(image, left, y, color);
            put_pixel(image, right, y, color);
        }
    }
}

pub(crate) fn fill_circle(image: &mut RgbImage, cx: i32, cy: i32, radius: i32, color: Rgb<u8>) {
    let r2 = radius * radius;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= r2 {
                put_pixel(image, cx + dx, cy + dy, color);
            }
        }
    }
}

/// Additively blend `color * alpha` into every pixel covered by `mask`.
pub(crate) fn blend_mask(image: &mut RgbImage, mask: &TrackMask, color: Rgb<u8>, alpha: f32) {
    let width = image.width().min(mask.width());
    let height = image.height().min(mask.height());
    let add = color.0.map(|channel| (channel as f32 * alpha).round() as u8);
    for y in 0..height {
        for x in 0..width {
            if mask.contains(x as i32, y as i32) {
                let pixel = image.get_pixel_mut(x, y);
                for (value, delta) in pixel.0.iter_mut().zip(add) {
                    *value = value.saturating_add(delta);
                }
            }
        }
    }
}

/// Draw `text` with its top-left corner at (`x`, `y`). Lowercase is rendered
/// as uppercase; characters without a glyph advance the cursor blank.
pub(crate) fn draw_label(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    let scale = scale.max(1);
    let mut cursor = x;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        let px = cursor + col * scale;
                        let py = y + row as i32 * scale;
                        for sy in 0..scale {
                            for sx in 0..scale {
                                put_pixel(image, px + sx, py + sy, color);
                            }
                        }
                    }
                }
            }
        }
        cursor += GLYPH_ADVANCE * scale;
    }
}

/// Place a label just above a box, or inside it when the box touches the top edge.
pub(crate) fn label_origin(bbox: BoundingBox, scale: i32) -> (i32, i32) {
    let height = GLYPH_HEIGHT * scale.max(1);
    let y = if bbox.y1 - height - 3 >= 0 {
        bbox.y1 - height - 3
    } else {
        bbox.y1 + 3
    };
    (bbox.x1, y)
}

fn put_pixel(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0, 0, 0, 0, 0, 0, 0],
        _ => return None,
    };
    Some(bits)
}
