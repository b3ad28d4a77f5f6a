use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::detect::Detection;

/// Where a request's media came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "camera-frame")]
    CameraFrame,
    #[serde(rename = "upload")]
    Upload,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::CameraFrame => "camera-frame",
            SourceType::Upload => "upload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "camera-frame" => Some(SourceType::CameraFrame),
            "upload" => Some(SourceType::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request provenance recorded next to the result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Provenance {
    pub source_type: SourceType,
    pub subject_id: Option<String>,
    /// Client-declared file name of the upload.
    pub file_name: Option<String>,
    /// Detection profile that served the request.
    pub profile: String,
}

/// Aggregate outcome of one request.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineResult {
    /// Stable key of the log record and stem of the artifact file name.
    pub id: String,
    pub detections: Vec<Detection>,
    pub target_present: bool,
    pub max_confidence: f32,
    /// Persisted annotated image, present only when a target was found.
    pub artifact_ref: Option<String>,
    pub frames_sampled: u64,
    /// A target was found but the annotated image could not be produced.
    pub degraded: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
