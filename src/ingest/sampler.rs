//! Frame sampling policy.
//!
//! `SampledFrames` is a lazy, single-pass iterator: frames between samples are
//! skipped without producing pixels, and at most one decoded frame is alive at a
//! time. Re-sampling requires reopening the source.

use anyhow::{anyhow, Result};

use super::FrameDecoder;
use crate::frame::Frame;

/// Default spacing, in frames, between sampled video frames.
pub const DEFAULT_FRAME_STRIDE: u64 = 30;

/// Default cap on the number of frames sampled from one source.
pub const DEFAULT_MAX_SAMPLED_FRAMES: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSampler {
    stride: u64,
    max_frames: u64,
}

impl FrameSampler {
    pub fn new(stride: u64, max_frames: u64) -> Result<Self> {
        if stride == 0 {
            return Err(anyhow!("frame stride must be > 0"));
        }
        if max_frames == 0 {
            return Err(anyhow!("max sampled frames must be > 0"));
        }
        Ok(Self { stride, max_frames })
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn max_frames(&self) -> u64 {
        self.max_frames
    }

    /// Lazily sample a decoder: every frame whose index is divisible by the stride.
    pub fn sample(&self, decoder: Box<dyn FrameDecoder>) -> SampledFrames {
        SampledFrames {
            decoder,
            stride: self.stride,
            max_frames: self.max_frames,
            next_index: 0,
            yielded: 0,
            truncated: false,
            done: false,
        }
    }
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self {
            stride: DEFAULT_FRAME_STRIDE,
            max_frames: DEFAULT_MAX_SAMPLED_FRAMES,
        }
    }
}

/// Iterator over sampled frames.
///
/// Yields `Err` only when the very first read of the source fails. A decode error
/// later in the stream ends the sequence and is recorded via `truncated()`.
pub struct SampledFrames {
    decoder: Box<dyn FrameDecoder>,
    stride: u64,
    max_frames: u64,
    next_index: u64,
    yielded: u64,
    truncated: bool,
    done: bool,
}

impl SampledFrames {
    /// Frames read from the source so far, sampled or not.
    pub fn frames_read(&self) -> u64 {
        self.next_index
    }

    /// True when the stream ended early on a decode error.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn fail(&mut self, err: anyhow::Error) -> Option<Result<Frame>> {
        self.done = true;
        if self.next_index == 0 {
            return Some(Err(err.context("source unreadable")));
        }
        self.truncated = true;
        log::warn!(
            "sampler: decode failed after {} frames, treating as end of stream: {:#}",
            self.next_index,
            err
        );
        None
    }
}

impl Iterator for SampledFrames {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.yielded >= self.max_frames {
            log::info!(
                "sampler: reached cap of {} sampled frames, stopping",
                self.max_frames
            );
            self.done = true;
            return None;
        }

        while self.next_index % self.stride != 0 {
            match self.decoder.skip_frame() {
                Ok(true) => self.next_index += 1,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => return self.fail(err),
            }
        }

        match self.decoder.next_frame() {
            Ok(Some(pixels)) => {
                let frame = Frame::new(self.next_index, pixels);
                self.next_index += 1;
                self.yielded += 1;
                Some(Ok(frame))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => self.fail(err),
        }
    }
}
