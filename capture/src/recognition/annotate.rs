use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use presence_cam_common::frame::BoundingBox;

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const TIMESTAMP_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
/// Pixels per font dot.
pub const TEXT_SCALE: u32 = 2;

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;
const LABEL_GAP: u32 = 3;
const TIMESTAMP_MARGIN: u32 = 10;

/// Draw a hollow rectangle `thickness` pixels wide, growing inwards from
/// the box edge. Parts outside the image are skipped.
pub fn draw_box(image: &mut RgbImage, bbox: BoundingBox, color: Rgb<u8>, thickness: u32) {
    let Some(bbox) = bbox.clip(image.width(), image.height()) else {
        return;
    };
    let t = thickness.max(1);
    let x_end = bbox.x + bbox.width;
    let y_end = bbox.y + bbox.height;

    for y in bbox.y..y_end {
        let on_horizontal = y < bbox.y + t || y + t >= y_end;
        for x in bbox.x..x_end {
            if on_horizontal || x < bbox.x + t || x + t >= x_end {
                image.put_pixel(x, y, color);
            }
        }
    }
}

/// Width and height in pixels of `text` rendered at `scale`.
pub fn text_size(text: &str, scale: u32) -> (u32, u32) {
    let chars = text.chars().count() as u32;
    (chars * GLYPH_ADVANCE * scale, GLYPH_HEIGHT * scale)
}

/// Render `text` with its top-left corner at `(x, y)` using the built-in
/// 5x7 bitmap font. Lowercase letters render as capitals; characters
/// without a glyph render as a hollow cell. Pixels off the image are
/// skipped.
pub fn draw_text(image: &mut RgbImage, text: &str, x: u32, y: u32, color: Rgb<u8>, scale: u32) {
    let scale = scale.max(1);
    let (width, height) = image.dimensions();
    let mut origin_x = x;

    for ch in text.chars() {
        if origin_x >= width {
            break;
        }
        let rows = glyph(ch);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                    continue;
                }
                let px = origin_x + col * scale;
                let py = y + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        if px + dx < width && py + dy < height {
                            image.put_pixel(px + dx, py + dy, color);
                        }
                    }
                }
            }
        }
        origin_x += GLYPH_ADVANCE * scale;
    }
}

/// Write `text` just above `bbox`, or just inside its top edge when the box
/// touches the top of the frame.
pub fn label_face(image: &mut RgbImage, bbox: BoundingBox, text: &str, color: Rgb<u8>) {
    let (_, text_height) = text_size(text, TEXT_SCALE);
    let y = if bbox.y >= text_height + LABEL_GAP {
        bbox.y - text_height - LABEL_GAP
    } else {
        bbox.y + LABEL_GAP * 2
    };
    draw_text(image, text, bbox.x + LABEL_GAP, y, color, TEXT_SCALE);
}

/// Capture time in the bottom-left corner, e.g.
/// `SUNDAY 18 OCTOBER 2026 03:04:05PM`.
pub fn stamp_time(image: &mut RgbImage, captured_at: DateTime<Utc>) {
    let text = captured_at.format("%A %d %B %Y %I:%M:%S%p").to_string();
    let (_, text_height) = text_size(&text, TEXT_SCALE);
    let y = image.height().saturating_sub(text_height + TIMESTAMP_MARGIN);
    draw_text(image, &text, TIMESTAMP_MARGIN, y, TIMESTAMP_COLOR, TEXT_SCALE);
}

/// Rows of a 5x7 glyph, most significant of the low five bits leftmost.
fn glyph(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        ' ' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        'A' => [0x0E, 0x11, 0x11, 0x11, 0x1F, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        _ => [0x1F, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1F],
    }
}
