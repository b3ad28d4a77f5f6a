use serde::Serialize;

use crate::detect::{BackendRegistry, Detection};
use crate::log::DetectionLogRecord;
use crate::pipeline::PipelineResult;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Body for `/detect/stream` and `/detect/upload`.
#[derive(Debug, Serialize)]
pub(crate) struct DetectResponse<'a> {
    pub id: &'a str,
    pub has_fire: bool,
    pub confidence_score: f32,
    pub detections: &'a [Detection],
    pub message: &'a str,
}

impl<'a> From<&'a PipelineResult> for DetectResponse<'a> {
    fn from(result: &'a PipelineResult) -> Self {
        Self {
            id: &result.id,
            has_fire: result.target_present,
            confidence_score: result.max_confidence,
            detections: &result.detections,
            message: &result.message,
        }
    }
}

/// Body for `/predict_fire` and `/predict_metal`.
#[derive(Debug, Serialize)]
pub(crate) struct PredictResponse<'a> {
    pub id: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_fire: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_target: Option<bool>,
    pub confidence_score: f32,
    pub file_name: Option<&'a str>,
    pub detections: &'a [Detection],
    pub result_image: Option<&'a str>,
    pub date: String,
}

impl<'a> PredictResponse<'a> {
    pub fn fire(result: &'a PipelineResult, record: &'a DetectionLogRecord) -> Self {
        let mut response = Self::base(result, record);
        response.has_fire = Some(result.target_present);
        response
    }

    pub fn metal(result: &'a PipelineResult, record: &'a DetectionLogRecord) -> Self {
        let mut response = Self::base(result, record);
        response.has_target = Some(result.target_present);
        response
    }

    fn base(result: &'a PipelineResult, record: &'a DetectionLogRecord) -> Self {
        Self {
            id: &result.id,
            message: &result.message,
            has_fire: None,
            has_target: None,
            confidence_score: result.max_confidence,
            file_name: record.file_name.as_deref(),
            detections: &result.detections,
            result_image: result.artifact_ref.as_deref(),
            date: result.created_at.format(DATE_FORMAT).to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub backends: Vec<BackendStatus>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BackendStatus {
    pub profile: String,
    pub backend: &'static str,
}

impl HealthResponse {
    pub fn from_registry(registry: &BackendRegistry) -> Self {
        Self {
            status: "ok",
            model_loaded: registry.all_loaded(),
            backends: registry
                .list()
                .into_iter()
                .map(|(profile, backend)| BackendStatus { profile, backend })
                .collect(),
        }
    }
}

/// Error body: a stable code and, once a result exists, its id.
pub(crate) fn error_body(code: &str, id: Option<&str>) -> String {
    match id {
        Some(id) => serde_json::json!({ "error": code, "id": id }).to_string(),
        None => serde_json::json!({ "error": code }).to_string(),
    }
}
