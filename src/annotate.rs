//! Annotation renderer.
//!
//! Draws every detection box with a `LABEL NN%` caption over a copy of the frame
//! and encodes the result. Rendering is deterministic: identical inputs produce
//! identical bytes.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ImageEncoder, Rgb, RgbImage};

use crate::aggregate::TargetPolicy;
use crate::detect::Detection;
use crate::frame::Frame;

const TARGET_COLOR: Rgb<u8> = Rgb([255, 32, 32]);
const OTHER_COLOR: Rgb<u8> = Rgb([255, 208, 0]);
const CAPTION_BG: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const JPEG_QUALITY: u8 = 90;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactFormat {
    Png,
    Jpeg,
}

impl ArtifactFormat {
    /// Keep the uploaded encoding where possible; video evidence is stored as JPEG.
    pub fn for_extension(ext: &str) -> Self {
        match ext {
            "png" => ArtifactFormat::Png,
            _ => ArtifactFormat::Jpeg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArtifactFormat::Png => "png",
            ArtifactFormat::Jpeg => "jpg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArtifactFormat::Png => "image/png",
            ArtifactFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnnotationRenderer {
    policy: TargetPolicy,
}

impl AnnotationRenderer {
    pub fn new(policy: TargetPolicy) -> Self {
        Self { policy }
    }

    /// Render `detections` over `frame` and encode as `format`.
    pub fn render(
        &self,
        frame: &Frame,
        detections: &[Detection],
        format: ArtifactFormat,
    ) -> Result<Vec<u8>> {
        let mut image = frame.pixels().clone();
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot annotate an empty frame"));
        }

        for det in detections {
            let color = self.color_for(det);
            let left = det.bbox.x1.round() as i32;
            let top = det.bbox.y1.round() as i32;
            let right = det.bbox.x2.round() as i32 - 1;
            let bottom = det.bbox.y2.round() as i32 - 1;
            for inset in 0..BOX_THICKNESS {
                draw_rectangle(
                    &mut image,
                    left + inset,
                    top + inset,
                    right - inset,
                    bottom - inset,
                    color,
                );
            }
        }

        for det in detections {
            let caption = format!(
                "{} {:.0}%",
                det.label.to_uppercase(),
                det.confidence * 100.0
            );
            let x = det.bbox.x1.round() as i32;
            let y = (det.bbox.y1.round() as i32 - GLYPH_HEIGHT - 3).max(0);
            let text_width = caption.chars().count() as i32 * GLYPH_ADVANCE;
            fill_rect(&mut image, x, y, x + text_width, y + GLYPH_HEIGHT + 1, CAPTION_BG);
            draw_label(&mut image, x + 1, y + 1, &caption, self.color_for(det));
        }

        encode(&image, format)
    }

    fn color_for(&self, det: &Detection) -> Rgb<u8> {
        if self.policy.is_target(det) {
            TARGET_COLOR
        } else {
            OTHER_COLOR
        }
    }
}

fn encode(image: &RgbImage, format: ArtifactFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    match format {
        ArtifactFormat::Png => PngEncoder::new(&mut buffer)
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                image::ExtendedColorType::Rgb8,
            )
            .context("PNG encode failed")?,
        ArtifactFormat::Jpeg => JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY)
            .encode_image(image)
            .context("JPEG encode failed")?,
    }
    Ok(buffer)
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if left > right || top > bottom {
        return;
    }
    for x in left..=right {
        put(image, x, top, color);
        put(image, x, bottom, color);
    }
    for y in top..=bottom {
        put(image, left, y, color);
        put(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);
    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put(image, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// 5x7 bitmap font. Unknown characters render as blank space.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x1E, 0x10, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x1E, 0x10, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x19, 0x15, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x0E, 0x01, 0x01, 0x11, 0x0E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1E, 0x01, 0x01, 0x0E, 0x01, 0x01, 0x1E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        _ => return None,
    };
    Some(bits)
}
