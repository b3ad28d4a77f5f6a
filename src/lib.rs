//! firewatch
//!
//! Media detection and logging service: still images, camera frames and uploaded
//! video go through an object detector, and each request produces one structured
//! result, one durable log record and, when a target is found, one annotated image.
//!
//! # Architecture
//!
//! Every request runs through the same pipeline:
//!
//! 1. **Validate**: extension allow-list and declared content type, nothing on disk yet.
//! 2. **Stage**: the upload lands in scoped temporary storage, removed on every exit path.
//! 3. **Sample**: images yield one frame, video every `frame_stride`-th frame.
//! 4. **Infer**: frames go one at a time through the shared detector handle.
//! 5. **Aggregate**: per-frame detections fold into a single decision.
//! 6. **Persist**: an annotated artifact is written only when a target is present.
//! 7. **Log**: one insert-only record, keyed by the id returned to the client.
//!
//! # Module Structure
//!
//! - `frame`: decoded frames and media kinds
//! - `ingest`: frame decoders and the lazy frame sampler
//! - `detect`: detector backends, the shared handle and the per-profile registry
//! - `aggregate`: target policy and detection aggregation
//! - `annotate`: bounding-box rendering and image encoding
//! - `storage`: staged uploads and persisted artifacts
//! - `log`: detection log records and stores
//! - `auth`: bearer credential verification
//! - `pipeline`: the request state machine
//! - `api`: HTTP routes
//! - `config`: file and environment configuration

pub mod aggregate;
pub mod annotate;
pub mod api;
pub mod auth;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod log;
pub mod pipeline;
pub mod storage;

pub use aggregate::{aggregate, Aggregate, Aggregator, TargetPolicy};
pub use annotate::{AnnotationRenderer, ArtifactFormat};
pub use auth::{CredentialVerifier, SessionTokenVerifier, StaticTokenVerifier, Subject};
pub use detect::{
    BackendRegistry, BoundingBox, ColorBackend, Detection, DetectionBatch, DetectorBackend,
    SharedDetector, StubBackend,
};
#[cfg(feature = "backend-tract")]
pub use detect::TractBackend;
pub use error::{AuthError, PipelineError};
pub use frame::{Frame, MediaKind};
pub use ingest::{FrameDecoder, FrameSampler, SampledFrames};
pub use log::{
    DetectionLogRecord, DetectionLogStore, DetectionLogWriter, InMemoryDetectionLogStore,
    SqliteDetectionLogStore,
};
pub use pipeline::{
    CancelToken, DetectionProfile, Orchestrator, PipelineOutcome, PipelineRequest,
    PipelineResult, PipelineState, Provenance, SourceType,
};
pub use storage::{ArtifactStore, StagedUpload};
