//! Motion-JPEG file decoder.
//!
//! An `.mjpeg`/`.mjpg` file is a plain concatenation of JPEG images. Frames are
//! split while streaming from disk by walking marker segments, so APPn payloads
//! (EXIF thumbnails carry their own SOI/EOI) never end a frame early. Only
//! sampled frames are actually decoded.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use super::FrameDecoder;

const MAX_JPEG_BYTES: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;

pub struct MjpegDecoder {
    reader: Box<dyn Read>,
    buffer: Vec<u8>,
    /// Offset of the current frame's SOI in `buffer`.
    frame_start: Option<usize>,
    /// Parse position; bytes before it are never rescanned.
    pos: usize,
    in_scan: bool,
    bytes_read: u64,
    frames_found: u64,
    eof: bool,
}

impl MjpegDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open mjpeg source {}", path.display()))?;
        Ok(Self::from_reader(Box::new(BufReader::new(file))))
    }

    pub fn from_reader(reader: Box<dyn Read>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK),
            frame_start: None,
            pos: 0,
            in_scan: false,
            bytes_read: 0,
            frames_found: 0,
            eof: false,
        }
    }

    /// Next encoded JPEG, or `None` at a clean end of stream.
    fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(end) = self.advance()? {
                let start = self.frame_start.take().unwrap_or(0);
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                self.pos = 0;
                self.in_scan = false;
                self.frames_found += 1;
                return Ok(Some(frame));
            }

            if self.eof {
                self.buffer.clear();
                if self.frame_start.take().is_some() {
                    return Err(anyhow!("mjpeg stream ends inside a frame"));
                }
                if self.frames_found == 0 && self.bytes_read > 0 {
                    return Err(anyhow!("no JPEG frames in mjpeg stream"));
                }
                return Ok(None);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                self.eof = true;
                continue;
            }
            self.bytes_read += read as u64;
            self.buffer.extend_from_slice(&chunk[..read]);

            if let Some(start) = self.frame_start {
                if self.buffer.len() - start > MAX_JPEG_BYTES {
                    return Err(anyhow!(
                        "mjpeg frame exceeds {} bytes without end marker",
                        MAX_JPEG_BYTES
                    ));
                }
            }
        }
    }

    /// Parse as far as the buffered bytes allow. Returns the end offset of a
    /// complete frame once its EOI is reached.
    fn advance(&mut self) -> Result<Option<usize>> {
        if self.frame_start.is_none() {
            match find_soi(&self.buffer[self.pos..]) {
                Some(offset) => {
                    let start = self.pos + offset;
                    self.frame_start = Some(start);
                    self.pos = start + 2;
                }
                None => {
                    // Keep a trailing 0xFF that may begin the next SOI.
                    let keep = usize::from(self.buffer.last() == Some(&0xFF));
                    self.buffer.drain(..self.buffer.len() - keep);
                    self.pos = 0;
                    return Ok(None);
                }
            }
        }

        let buf = &self.buffer;
        while self.pos + 1 < buf.len() {
            if self.in_scan {
                if buf[self.pos] != 0xFF {
                    self.pos += 1;
                    continue;
                }
                match buf[self.pos + 1] {
                    // Stuffed byte, restart marker or fill byte: still entropy-coded data.
                    0x00 | 0xD0..=0xD7 => self.pos += 2,
                    0xFF => self.pos += 1,
                    _ => self.in_scan = false,
                }
                continue;
            }

            if buf[self.pos] != 0xFF {
                return Err(anyhow!(
                    "malformed mjpeg frame: expected marker at byte {}",
                    self.pos
                ));
            }
            let marker = buf[self.pos + 1];
            match marker {
                0xFF => self.pos += 1,
                EOI => return Ok(Some(self.pos + 2)),
                SOI => {
                    return Err(anyhow!("malformed mjpeg frame: nested start of image"));
                }
                0x01 | 0xD0..=0xD7 => self.pos += 2,
                _ => {
                    if self.pos + 4 > buf.len() {
                        return Ok(None);
                    }
                    let len = u16::from_be_bytes([buf[self.pos + 2], buf[self.pos + 3]]) as usize;
                    if len < 2 {
                        return Err(anyhow!("malformed mjpeg segment length {}", len));
                    }
                    self.pos += 2 + len;
                    if marker == SOS {
                        self.in_scan = true;
                    }
                }
            }
        }
        Ok(None)
    }
}

impl FrameDecoder for MjpegDecoder {
    fn skip_frame(&mut self) -> Result<bool> {
        Ok(self.next_jpeg()?.is_some())
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(jpeg) = self.next_jpeg()? else {
            return Ok(None);
        };
        let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg)
            .context("decode mjpeg frame")?;
        Ok(Some(decoded.to_rgb8()))
    }
}

fn find_soi(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == [0xFF, SOI])
}
