//! Decoded frames.
//!
//! - `Frame`: one decoded RGB frame tagged with its 0-based index in the source.
//! - `MediaKind`: whether a request carries a still image or a video.
//!
//! Frames are produced by the ingestion layer one at a time and dropped as soon as
//! inference on them has finished, unless the frame is kept as evidence for the
//! annotated artifact.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

/// Extensions accepted for still images.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Extensions accepted for video uploads.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "mjpeg", "mjpg"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => IMAGE_EXTENSIONS,
            MediaKind::Video => VIDEO_EXTENSIONS,
        }
    }

    /// Returns true when a declared content type is compatible with this kind.
    ///
    /// Clients frequently send `application/octet-stream`, which is accepted for both.
    pub fn accepts_content_type(self, content_type: &str) -> bool {
        let ct = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if ct.is_empty() || ct == "application/octet-stream" {
            return true;
        }
        match self {
            MediaKind::Image => ct.starts_with("image/"),
            MediaKind::Video => ct.starts_with("video/") || ct == "multipart/x-mixed-replace",
        }
    }
}

/// Lowercased extension of a client-declared file name, if any.
pub fn file_extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// One decoded frame.
///
/// Not `Clone`: a frame is either consumed by inference and dropped, or moved into
/// the orchestrator as evidence.
#[derive(Debug)]
pub struct Frame {
    pub index: u64,
    pixels: RgbImage,
}

impl Frame {
    pub fn new(index: u64, pixels: RgbImage) -> Self {
        Self { index, pixels }
    }

    /// Decode an encoded still image (JPEG or PNG).
    pub fn decode(index: u64, encoded: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(encoded).context("decode image")?;
        let pixels = decoded.to_rgb8();
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(anyhow!("decoded image has zero dimensions"));
        }
        Ok(Self::new(index, pixels))
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> RgbImage {
        self.pixels
    }
}
