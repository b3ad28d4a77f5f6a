use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const DEFAULT_MIN_RED: u8 = 180;
const DEFAULT_MIN_RED_BLUE_GAP: u8 = 80;
/// Minimum fraction of the frame that must be flame-coloured.
const DEFAULT_MIN_COVERAGE: f32 = 0.001;
const MIN_FLAME_PIXELS: u64 = 16;

/// CPU backend using a flame-colour rule (bright red dominant, R >= G > B).
///
/// Emits at most one `fire` detection per frame: the box enclosing every
/// flame-coloured pixel. Confidence is the fill ratio of that box, so a compact
/// blaze scores higher than scattered red highlights.
pub struct ColorBackend {
    label: String,
    min_red: u8,
    min_red_blue_gap: u8,
    min_coverage: f32,
    confidence_threshold: f32,
}

impl ColorBackend {
    pub fn new() -> Self {
        Self {
            label: "fire".to_string(),
            min_red: DEFAULT_MIN_RED,
            min_red_blue_gap: DEFAULT_MIN_RED_BLUE_GAP,
            min_coverage: DEFAULT_MIN_COVERAGE,
            confidence_threshold: 0.0,
        }
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn is_flame(&self, r: u8, g: u8, b: u8) -> bool {
        r >= self.min_red && r >= g && g > b && r.saturating_sub(b) >= self.min_red_blue_gap
    }
}

impl Default for ColorBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for ColorBackend {
    fn name(&self) -> &'static str {
        "color"
    }

    fn labels(&self) -> Vec<String> {
        vec![self.label.clone()]
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (width, height) = (frame.width(), frame.height());
        let mut count = 0u64;
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);

        for (x, y, px) in frame.pixels().enumerate_pixels() {
            let [r, g, b] = px.0;
            if self.is_flame(r, g, b) {
                count += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        let total = width as u64 * height as u64;
        if count < MIN_FLAME_PIXELS || total == 0 {
            return Ok(Vec::new());
        }
        if (count as f32 / total as f32) < self.min_coverage {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        );
        let confidence = (count as f32 / bbox.area()).clamp(0.0, 1.0);
        if confidence < self.confidence_threshold {
            return Ok(Vec::new());
        }

        Ok(vec![Detection::new(self.label.clone(), confidence, bbox)])
    }
}
