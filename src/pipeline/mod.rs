//! Detection pipeline.
//!
//! A request moves through these states, each logged at debug level with the
//! request id:
//!
//! `Validating -> Ingesting -> Sampling -> Inferring -> Aggregating -> Persisting
//! -> LogWriting -> Responding`, or `Failed` from any of them.
//!
//! The staged upload is removed on every exit path. The annotated artifact is
//! written only when a target was found, and removed again if the log write that
//! follows it fails. No log record is written for a failed or cancelled request.

mod cancel;
mod orchestrator;
mod result;

use std::fmt;

use crate::aggregate::TargetPolicy;
use crate::detect::SharedDetector;
use crate::frame::MediaKind;

pub use cancel::CancelToken;
pub use orchestrator::{Orchestrator, PipelineOutcome};
pub use result::{PipelineResult, Provenance, SourceType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Validating,
    Ingesting,
    Sampling,
    Inferring,
    Aggregating,
    Persisting,
    LogWriting,
    Responding,
    /// Terminal; carries the error code.
    Failed(&'static str),
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Failed(code) => write!(f, "Failed({})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A detection use case: which model to ask and which labels matter.
#[derive(Clone, Debug)]
pub struct DetectionProfile {
    pub name: String,
    pub policy: TargetPolicy,
    pub detector: SharedDetector,
    /// Message recorded when a target is present.
    pub alert_message: String,
    /// Message recorded when nothing relevant was found.
    pub clear_message: String,
}

impl DetectionProfile {
    pub fn new(name: impl Into<String>, policy: TargetPolicy, detector: SharedDetector) -> Self {
        let name = name.into();
        Self {
            alert_message: format!("{} detected", name),
            clear_message: "safe".to_string(),
            name,
            policy,
            detector,
        }
    }

    pub fn with_messages(mut self, alert: impl Into<String>, clear: impl Into<String>) -> Self {
        self.alert_message = alert.into();
        self.clear_message = clear.into();
        self
    }
}

/// Media handed to the pipeline by a caller.
#[derive(Clone, Debug)]
pub struct PipelineRequest {
    /// Client-declared file name; its extension selects the decoder.
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub kind: MediaKind,
    pub source_type: SourceType,
    pub subject_id: Option<String>,
}

impl PipelineRequest {
    pub fn image(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            bytes,
            kind: MediaKind::Image,
            source_type: SourceType::CameraFrame,
            subject_id: None,
        }
    }

    pub fn video(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            bytes,
            kind: MediaKind::Video,
            source_type: SourceType::Upload,
            subject_id: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    pub fn with_subject(mut self, subject_id: Option<String>) -> Self {
        self.subject_id = subject_id;
        self
    }
}
