//! Error kinds that cross the pipeline boundary.
//!
//! Internals work with `anyhow::Result` and attach context freely. Anything that
//! reaches a caller is converted into a `PipelineError`, whose `Display` text is
//! never sent over the wire: the API uses `status()` and `code()` instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing media type. User-correctable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Request body exceeded the configured limit.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Storage or decode failure while taking in the source.
    #[error("ingestion failed: {0:#}")]
    Ingestion(anyhow::Error),

    /// Inference backend failure.
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),

    /// Annotation failure. Degrades artifact persistence only.
    #[error("render failed: {0:#}")]
    Render(anyhow::Error),

    /// The result was computed but could not be durably recorded.
    #[error("log write failed for {id}: {source:#}")]
    LogWrite { id: String, source: anyhow::Error },

    /// A record with this id already exists.
    #[error("detection log {0} already exists")]
    DuplicateLog(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Client disconnect, timeout or explicit cancellation.
    #[error("request cancelled: {0}")]
    Cancelled(String),
}

impl PipelineError {
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Validation(_) => 422,
            PipelineError::PayloadTooLarge(_) => 413,
            PipelineError::Ingestion(_)
            | PipelineError::Inference(_)
            | PipelineError::Render(_)
            | PipelineError::LogWrite { .. } => 500,
            PipelineError::DuplicateLog(_) => 409,
            PipelineError::Auth(_) => 401,
            PipelineError::Cancelled(_) => 408,
        }
    }

    /// Stable, non-leaking error code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "unsupported_media",
            PipelineError::PayloadTooLarge(_) => "payload_too_large",
            PipelineError::Ingestion(_) => "ingestion_failed",
            PipelineError::Inference(_) => "inference_failed",
            PipelineError::Render(_) => "render_failed",
            PipelineError::LogWrite { .. } => "log_write_failed",
            PipelineError::DuplicateLog(_) => "duplicate_log",
            PipelineError::Auth(_) => "unauthorized",
            PipelineError::Cancelled(_) => "request_cancelled",
        }
    }

    /// Request id to echo back, if the failure happened after the result existed.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            PipelineError::LogWrite { id, .. } | PipelineError::DuplicateLog(id) => Some(id),
            _ => None,
        }
    }
}

/// Credential rejection. Reasons are for the server log only.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid authentication scheme")]
    BadScheme,
    #[error("unknown credential")]
    Unknown,
    #[error("session expired")]
    Expired,
    #[error("credential backend failure: {0:#}")]
    Backend(anyhow::Error),
}
