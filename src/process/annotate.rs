//! Overlay drawing on copied frames.

use crate::frame::{Frame, PixelFormat};

/// Axis-aligned box in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl PixelRect {
    /// Box from a center and size in (possibly fractional, possibly
    /// out-of-frame) pixel units, clamped to the frame.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 || ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
            return None;
        }
        let max_x = (width - 1) as f32;
        let max_y = (height - 1) as f32;
        let x0 = (cx - w / 2.0).clamp(0.0, max_x);
        let y0 = (cy - h / 2.0).clamp(0.0, max_y);
        let x1 = (cx + w / 2.0).clamp(0.0, max_x);
        let y1 = (cy + h / 2.0).clamp(0.0, max_y);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self {
            x: x0 as u32,
            y: y0 as u32,
            w: (x1 - x0) as u32 + 1,
            h: (y1 - y0) as u32 + 1,
        })
    }
}

/// Overlay color in RGB; gray frames take the green channel.
#[derive(Clone, Copy, Debug)]
pub struct Color(pub u8, pub u8, pub u8);

pub const ALERT: Color = Color(255, 0, 0);
pub const DETECTION: Color = Color(0, 255, 0);

fn channels(color: Color, format: PixelFormat) -> ([u8; 4], usize) {
    let Color(r, g, b) = color;
    match format {
        PixelFormat::Rgb => ([r, g, b, 0], 3),
        PixelFormat::Bgr => ([b, g, r, 0], 3),
        PixelFormat::Rgba => ([r, g, b, 255], 4),
        PixelFormat::Gray => ([g, 0, 0, 0], 1),
    }
}

fn draw_rect_in_place(
    pixels: &mut [u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    rect: PixelRect,
    thickness: u32,
    color: Color,
) {
    let (value, bpp) = channels(color, format);
    let x_end = (rect.x + rect.w).min(width);
    let y_end = (rect.y + rect.h).min(height);
    let t = thickness.max(1);
    for y in rect.y..y_end {
        for x in rect.x..x_end {
            let on_edge = x < rect.x + t || x + t >= x_end || y < rect.y + t || y + t >= y_end;
            if !on_edge {
                continue;
            }
            let idx = (y as usize * width as usize + x as usize) * bpp;
            if let Some(px) = pixels.get_mut(idx..idx + bpp) {
                px.copy_from_slice(&value[..bpp]);
            }
        }
    }
}

/// Copy of `frame` with a frame-wide border.
pub fn draw_border(frame: &Frame, thickness: u32, color: Color) -> Frame {
    frame.map_pixels(|pixels, width, height, format| {
        let rect = PixelRect {
            x: 0,
            y: 0,
            w: width,
            h: height,
        };
        draw_rect_in_place(pixels, width, height, format, rect, thickness, color);
    })
}

/// Copy of `frame` with one outline per box.
pub fn draw_boxes(frame: &Frame, boxes: &[PixelRect], thickness: u32, color: Color) -> Frame {
    frame.map_pixels(|pixels, width, height, format| {
        for rect in boxes {
            draw_rect_in_place(pixels, width, height, format, *rect, thickness, color);
        }
    })
}
