use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// One localized finding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class_name")]
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Index of the frame this detection came from (0 for still images).
    #[serde(default)]
    pub frame_index: u64,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
            frame_index: 0,
        }
    }

    /// Check the detection invariants against the frame it was produced from.
    pub fn validate(&self, width: u32, height: u32) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(anyhow!("detection label is empty"));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(anyhow!(
                "detection confidence {} outside [0, 1]",
                self.confidence
            ));
        }
        let b = &self.bbox;
        let coords = [b.x1, b.y1, b.x2, b.y2];
        if coords.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("detection bbox has non-finite coordinates"));
        }
        if !(b.x1 < b.x2 && b.y1 < b.y2) {
            return Err(anyhow!(
                "detection bbox ({}, {}, {}, {}) is degenerate",
                b.x1,
                b.y1,
                b.x2,
                b.y2
            ));
        }
        let (w, h) = (width as f32, height as f32);
        if b.x1 < 0.0 || b.y1 < 0.0 || b.x2 > w || b.y2 > h {
            return Err(anyhow!(
                "detection bbox ({}, {}, {}, {}) outside {}x{} frame",
                b.x1,
                b.y1,
                b.x2,
                b.y2,
                width,
                height
            ));
        }
        Ok(())
    }
}

/// Detections produced from one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionBatch {
    pub frame_index: u64,
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    /// Tag every detection with the frame index.
    pub fn new(frame_index: u64, detections: Vec<Detection>) -> Self {
        let detections = detections
            .into_iter()
            .map(|mut d| {
                d.frame_index = frame_index;
                d
            })
            .collect();
        Self {
            frame_index,
            detections,
        }
    }
}
