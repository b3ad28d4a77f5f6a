//! Source ingestion.
//!
//! This module turns a staged upload into a lazy sequence of sampled frames:
//! - Still images (JPEG/PNG) yield exactly one frame
//! - Motion-JPEG files are split and decoded without native dependencies
//! - Container formats (mp4, avi, mov, mkv, webm) need the `video-ffmpeg` feature
//!
//! The ingestion layer MUST NOT:
//! - Fetch remote URLs
//! - Keep more than one decoded frame alive per request
//! - Log frame content

#[cfg(feature = "video-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod mjpeg;
pub mod sampler;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::path::Path;

use crate::frame::{file_extension, Frame, MediaKind};

pub use mjpeg::MjpegDecoder;
pub use sampler::{FrameSampler, SampledFrames, DEFAULT_FRAME_STRIDE, DEFAULT_MAX_SAMPLED_FRAMES};

/// Sequential frame decoder for one source.
///
/// A decoder lives on the worker thread that opened it.
pub trait FrameDecoder {
    /// Advance past the next frame without producing pixels.
    /// Returns `Ok(false)` at end of stream.
    fn skip_frame(&mut self) -> Result<bool>;

    /// Decode the next frame. Returns `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Single still image.
pub struct ImageDecoder {
    encoded: Option<Vec<u8>>,
}

impl ImageDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let encoded = std::fs::read(path)
            .with_context(|| format!("read image source {}", path.display()))?;
        Ok(Self::from_bytes(encoded))
    }

    pub fn from_bytes(encoded: Vec<u8>) -> Self {
        Self {
            encoded: Some(encoded),
        }
    }
}

impl FrameDecoder for ImageDecoder {
    fn skip_frame(&mut self) -> Result<bool> {
        Ok(self.encoded.take().is_some())
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(encoded) = self.encoded.take() else {
            return Ok(None);
        };
        Frame::decode(0, &encoded).map(|frame| Some(frame.into_pixels()))
    }
}

/// Open a decoder for a staged source file.
pub fn open_source(path: &Path, kind: MediaKind) -> Result<Box<dyn FrameDecoder>> {
    match kind {
        MediaKind::Image => Ok(Box::new(ImageDecoder::open(path)?)),
        MediaKind::Video => {
            let ext = path
                .to_str()
                .and_then(file_extension)
                .ok_or_else(|| anyhow!("video source has no extension"))?;
            match ext.as_str() {
                "mjpeg" | "mjpg" => Ok(Box::new(MjpegDecoder::open(path)?)),
                _ => open_container(path),
            }
        }
    }
}

#[cfg(feature = "video-ffmpeg")]
fn open_container(path: &Path) -> Result<Box<dyn FrameDecoder>> {
    Ok(Box::new(file_ffmpeg::FfmpegDecoder::open(path)?))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_container(path: &Path) -> Result<Box<dyn FrameDecoder>> {
    Err(anyhow!(
        "decoding {} requires the video-ffmpeg feature",
        path.display()
    ))
}
