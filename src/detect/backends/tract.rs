#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{resize, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single input `[1, 3, size, size]` (RGB, 0..1) and a single output
/// `[1, 4 + classes, anchors]` with boxes as centre/size in model pixels.
/// The model file is loaded once; it performs no network I/O.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    labels: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, labels: Vec<String>) -> Result<Self> {
        let model_path = model_path.as_ref();
        if labels.is_empty() {
            return Err(anyhow!("tract backend requires at least one label"));
        }
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels,
            confidence_threshold: 0.25,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let size = self.input_size;
        let resized = resize(frame.pixels(), size, size, FilterType::Triangle);
        let size = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        input.into_tensor()
    }

    fn decode_output(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        if classes != self.labels.len() {
            return Err(anyhow!(
                "model emits {} classes but {} labels are configured",
                classes,
                self.labels.len()
            ));
        }

        let (fw, fh) = (frame.width() as f32, frame.height() as f32);
        let scale_x = fw / self.input_size as f32;
        let scale_y = fh / self.input_size as f32;

        let mut candidates = Vec::new();
        for i in 0..shape[2] {
            let (mut best, mut best_class) = (0.0f32, 0usize);
            for c in 0..classes {
                let score = view[[0, 4 + c, i]];
                if score > best {
                    best = score;
                    best_class = c;
                }
            }
            if best < self.confidence_threshold {
                continue;
            }
            let (cx, cy) = (view[[0, 0, i]], view[[0, 1, i]]);
            let (w, h) = (view[[0, 2, i]], view[[0, 3, i]]);
            let bbox = BoundingBox::new(
                ((cx - w / 2.0) * scale_x).clamp(0.0, fw),
                ((cy - h / 2.0) * scale_y).clamp(0.0, fh),
                ((cx + w / 2.0) * scale_x).clamp(0.0, fw),
                ((cy + h / 2.0) * scale_y).clamp(0.0, fh),
            );
            if bbox.x1 >= bbox.x2 || bbox.y1 >= bbox.y2 {
                continue;
            }
            candidates.push(Detection::new(
                self.labels[best_class].clone(),
                best.clamp(0.0, 1.0),
                bbox,
            ));
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Per-label greedy NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for cand in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.label == cand.label && k.bbox.iou(&cand.bbox) > iou_threshold);
        if !suppressed {
            kept.push(cand);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode_output(outputs, frame)
    }
}
