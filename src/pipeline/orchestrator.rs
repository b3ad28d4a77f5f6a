use anyhow::{anyhow, Context};
use chrono::Utc;
use uuid::Uuid;

use super::{
    CancelToken, DetectionProfile, PipelineRequest, PipelineResult, PipelineState, Provenance,
};
use crate::aggregate::Aggregator;
use crate::annotate::{AnnotationRenderer, ArtifactFormat};
use crate::detect::{Detection, DetectionBatch, SharedDetector};
use crate::error::PipelineError;
use crate::frame::{file_extension, Frame, MediaKind};
use crate::ingest::{open_source, FrameSampler};
use crate::log::{DetectionLogRecord, DetectionLogWriter};
use crate::storage::ArtifactStore;

/// Result of a completed request: what was computed and what was recorded.
#[derive(Clone, Debug)]
pub struct PipelineOutcome {
    pub result: PipelineResult,
    pub record: DetectionLogRecord,
}

/// Drives one request at a time through the pipeline. Shared across worker threads.
#[derive(Clone)]
pub struct Orchestrator {
    store: ArtifactStore,
    writer: DetectionLogWriter,
    sampler: FrameSampler,
}

/// State tracker for one run.
struct Run<'a> {
    id: &'a str,
    state: PipelineState,
}

impl<'a> Run<'a> {
    fn new(id: &'a str) -> Self {
        log::debug!("request {}: {}", id, PipelineState::Validating);
        Self {
            id,
            state: PipelineState::Validating,
        }
    }

    fn enter(&mut self, next: PipelineState) {
        if self.state != next {
            log::debug!("request {}: {} -> {}", self.id, self.state, next);
            self.state = next;
        }
    }

    fn fail(&mut self, err: &PipelineError) {
        let from = self.state;
        self.state = PipelineState::Failed(err.code());
        match err {
            PipelineError::Validation(_) | PipelineError::Cancelled(_) => {
                log::info!("request {}: {} in {}: {}", self.id, self.state, from, err)
            }
            _ => log::error!("request {}: {} in {}: {}", self.id, self.state, from, err),
        }
    }
}

impl Orchestrator {
    pub fn new(store: ArtifactStore, writer: DetectionLogWriter, sampler: FrameSampler) -> Self {
        Self {
            store,
            writer,
            sampler,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn writer(&self) -> &DetectionLogWriter {
        &self.writer
    }

    pub fn sampler(&self) -> &FrameSampler {
        &self.sampler
    }

    /// Run a request to completion.
    ///
    /// On success exactly one log record exists for the returned id. On failure
    /// no record exists, the staged upload is gone and no artifact is left behind.
    pub fn run(
        &self,
        profile: &DetectionProfile,
        request: PipelineRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let id = Uuid::new_v4().to_string();
        let mut run = Run::new(&id);
        match self.execute(&mut run, profile, request, cancel) {
            Ok(outcome) => {
                run.enter(PipelineState::Responding);
                Ok(outcome)
            }
            Err(err) => {
                run.fail(&err);
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        run: &mut Run<'_>,
        profile: &DetectionProfile,
        request: PipelineRequest,
        cancel: &CancelToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        let PipelineRequest {
            file_name,
            content_type,
            bytes,
            kind,
            source_type,
            subject_id,
        } = request;
        let ext = validate(&file_name, content_type.as_deref(), &bytes, kind)?;
        cancel.check()?;

        run.enter(PipelineState::Ingesting);
        let mut staged = self
            .store
            .stage(run.id, &ext, &bytes)
            .map_err(PipelineError::Ingestion)?;
        drop(bytes);
        let decoder = open_source(staged.path(), kind).map_err(PipelineError::Ingestion)?;

        run.enter(PipelineState::Sampling);
        let mut frames = self.sampler.sample(decoder);
        let mut aggregator = Aggregator::new(profile.policy.clone());
        let mut evidence: Option<(Frame, Vec<Detection>)> = None;
        let mut stopped_early = false;
        loop {
            cancel.check()?;
            let frame = match frames.next() {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(PipelineError::Ingestion(err)),
            };
            run.enter(PipelineState::Inferring);
            let detections = match infer_frame(&profile.detector, &frame) {
                Ok(detections) => detections,
                Err(err) if kind == MediaKind::Video => {
                    log::warn!(
                        "request {}: inference failed at frame {}, stopping early: {:#}",
                        run.id,
                        frame.index,
                        err
                    );
                    stopped_early = true;
                    break;
                }
                Err(err) => return Err(PipelineError::Inference(err)),
            };
            let batch = DetectionBatch::new(frame.index, detections);
            if evidence.is_none() && profile.policy.batch_has_target(&batch) {
                evidence = Some((frame, batch.detections.clone()));
            }
            aggregator.push(batch);
        }
        if frames.truncated() {
            log::warn!(
                "request {}: source truncated after {} frames",
                run.id,
                frames.frames_read()
            );
        }
        drop(frames);

        run.enter(PipelineState::Aggregating);
        let aggregate = aggregator.finish();
        let created_at = Utc::now();
        log::info!(
            "request {}: profile={} frames={} detections={} target={} confidence={:.3}",
            run.id,
            profile.name,
            aggregate.frames_sampled,
            aggregate.detections.len(),
            aggregate.target_present,
            aggregate.max_confidence
        );
        cancel.check()?;

        let mut artifact_ref = None;
        let mut artifact_missing = false;
        if aggregate.requires_artifact() {
            run.enter(PipelineState::Persisting);
            match self.persist_evidence(run.id, &ext, profile, evidence) {
                Ok(name) => artifact_ref = Some(name),
                Err(err) => {
                    log::warn!(
                        "request {}: annotated image unavailable: {:#}",
                        run.id,
                        err
                    );
                    artifact_missing = true;
                }
            }
        }

        let mut message = if aggregate.target_present {
            profile.alert_message.clone()
        } else {
            profile.clear_message.clone()
        };
        if artifact_missing {
            message.push_str(" (annotated image unavailable)");
        }
        if stopped_early {
            message.push_str(" (video analysis stopped early)");
        }
        let degraded = artifact_missing || stopped_early;
        let result = PipelineResult {
            id: run.id.to_string(),
            detections: aggregate.detections,
            target_present: aggregate.target_present,
            max_confidence: aggregate.max_confidence,
            artifact_ref,
            frames_sampled: aggregate.frames_sampled,
            degraded,
            message,
            created_at,
        };
        let provenance = Provenance {
            source_type,
            subject_id,
            file_name: Some(file_name),
            profile: profile.name.clone(),
        };

        if let Err(err) = cancel.check() {
            self.discard_artifact(&result);
            return Err(err);
        }
        run.enter(PipelineState::LogWriting);
        let record = match self.writer.write(&result, &provenance) {
            Ok(record) => record,
            Err(err) => {
                self.discard_artifact(&result);
                return Err(err);
            }
        };

        if let Err(err) = staged.release() {
            log::error!("request {}: {:#}", run.id, err);
        }
        Ok(PipelineOutcome { result, record })
    }

    fn persist_evidence(
        &self,
        id: &str,
        ext: &str,
        profile: &DetectionProfile,
        evidence: Option<(Frame, Vec<Detection>)>,
    ) -> anyhow::Result<String> {
        let (frame, detections) =
            evidence.ok_or_else(|| anyhow!("no evidence frame retained"))?;
        let format = ArtifactFormat::for_extension(ext);
        let encoded = AnnotationRenderer::new(profile.policy.clone())
            .render(&frame, &detections, format)
            .map_err(PipelineError::Render)?;
        self.store
            .persist_artifact(id, format.extension(), &encoded)
            .context("write annotated artifact")
    }

    fn discard_artifact(&self, result: &PipelineResult) {
        if let Some(name) = &result.artifact_ref {
            if let Err(err) = self.store.remove_artifact(name) {
                log::error!("request {}: orphaned artifact {}: {:#}", result.id, name, err);
            }
        }
    }
}

/// Check extension, body and declared content type. Touches nothing on disk.
fn validate(
    file_name: &str,
    content_type: Option<&str>,
    bytes: &[u8],
    kind: MediaKind,
) -> Result<String, PipelineError> {
    let ext = file_extension(file_name)
        .ok_or_else(|| PipelineError::Validation("file name has no extension".into()))?;
    if !kind.allowed_extensions().contains(&ext.as_str()) {
        return Err(PipelineError::Validation(format!(
            "extension '{}' not allowed, expected one of {}",
            ext,
            kind.allowed_extensions().join(", ")
        )));
    }
    if let Some(ct) = content_type {
        if !kind.accepts_content_type(ct) {
            return Err(PipelineError::Validation(format!(
                "content type '{}' does not match {:?} upload",
                ct, kind
            )));
        }
    }
    if bytes.is_empty() {
        return Err(PipelineError::Validation("empty upload".into()));
    }
    Ok(ext)
}

/// One inference call; any detection breaking the output contract fails the call.
fn infer_frame(detector: &SharedDetector, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
    let detections = detector
        .infer(frame)
        .with_context(|| format!("backend '{}' on frame {}", detector.name(), frame.index))?;
    for det in &detections {
        det.validate(frame.width(), frame.height()).with_context(|| {
            format!(
                "backend '{}' returned an invalid detection on frame {}",
                detector.name(),
                frame.index
            )
        })?;
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::TargetPolicy;
    use crate::detect::{BoundingBox, DetectorBackend};
    use crate::log::{DetectionLogStore, InMemoryDetectionLogStore, Inserted};
    use crate::pipeline::SourceType;
    use anyhow::{bail, Result};
    use image::codecs::jpeg::JpegEncoder;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedBackend {
        script: HashMap<u64, Vec<Detection>>,
        fail_at: Option<u64>,
        cancel_at: Option<(u64, CancelToken)>,
        calls: Arc<Mutex<Vec<u64>>>,
    }

    impl DetectorBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn labels(&self) -> Vec<String> {
            vec!["fire".to_string(), "smoke".to_string()]
        }

        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            self.calls.lock().unwrap().push(frame.index);
            if let Some((index, token)) = &self.cancel_at {
                if *index == frame.index {
                    token.cancel();
                }
            }
            if self.fail_at == Some(frame.index) {
                bail!("device lost");
            }
            Ok(self.script.get(&frame.index).cloned().unwrap_or_default())
        }
    }

    struct BrokenStore;

    impl DetectionLogStore for BrokenStore {
        fn insert(&mut self, _record: &DetectionLogRecord) -> Result<Inserted> {
            bail!("database is locked")
        }

        fn fetch(&mut self, _id: &str) -> Result<Option<DetectionLogRecord>> {
            Ok(None)
        }

        fn recent(&mut self, _limit: usize) -> Result<Vec<DetectionLogRecord>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        orchestrator: Orchestrator,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_writer(DetectionLogWriter::new(InMemoryDetectionLogStore::new()))
        }

        fn with_writer(writer: DetectionLogWriter) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = ArtifactStore::new(dir.path().join("temp"), dir.path().join("log")).unwrap();
            let sampler = FrameSampler::new(30, 1000).unwrap();
            Self {
                _dir: dir,
                orchestrator: Orchestrator::new(store, writer, sampler),
            }
        }

        fn records(&self) -> usize {
            self.orchestrator.writer().recent(100).unwrap().len()
        }

        fn staging_empty(&self) -> bool {
            dir_is_empty(self.orchestrator.store().staging_dir())
        }

        fn artifacts_empty(&self) -> bool {
            dir_is_empty(self.orchestrator.store().artifact_dir())
        }
    }

    fn dir_is_empty(path: &Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    fn profile(backend: ScriptedBackend) -> DetectionProfile {
        DetectionProfile::new("fire", TargetPolicy::fire(), SharedDetector::new(backend))
    }

    fn fire(conf: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new("fire", conf, BoundingBox::new(x1, y1, x2, y2))
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([40, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn mjpeg(frames: usize) -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));
        let mut one = Vec::new();
        JpegEncoder::new(&mut one).encode_image(&img).unwrap();
        one.repeat(frames)
    }

    #[test]
    fn image_with_fire_persists_artifact_and_record() {
        let fx = Fixture::new();
        let mut backend = ScriptedBackend::default();
        backend.script.insert(0, vec![fire(0.92, 10.0, 10.0, 50.0, 50.0)]);

        let outcome = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::image("cam.png", png(64, 64)),
                &CancelToken::new(),
            )
            .unwrap();

        let result = &outcome.result;
        assert!(result.target_present);
        assert_eq!(result.max_confidence, 0.92);
        assert_eq!(result.frames_sampled, 1);
        assert!(!result.degraded);
        assert_eq!(result.message, "fire detected");
        let artifact = result.artifact_ref.clone().unwrap();
        assert_eq!(artifact, format!("{}.png", result.id));
        assert!(fx.orchestrator.store().read_artifact(&artifact).is_ok());

        assert_eq!(fx.records(), 1);
        assert_eq!(outcome.record.id, result.id);
        assert_eq!(outcome.record.source_type, SourceType::CameraFrame);
        assert_eq!(outcome.record.file_name.as_deref(), Some("cam.png"));
        assert!(fx.staging_empty());
    }

    #[test]
    fn image_without_detections_writes_record_only() {
        let fx = Fixture::new();
        let outcome = fx
            .orchestrator
            .run(
                &profile(ScriptedBackend::default()),
                PipelineRequest::image("cam.jpg", png(16, 16)),
                &CancelToken::new(),
            )
            .unwrap();

        assert!(!outcome.result.target_present);
        assert_eq!(outcome.result.max_confidence, 0.0);
        assert!(outcome.result.artifact_ref.is_none());
        assert_eq!(outcome.record.message, "safe");
        assert_eq!(fx.records(), 1);
        assert!(fx.artifacts_empty());
        assert!(fx.staging_empty());
    }

    #[test]
    fn non_target_detections_do_not_persist_artifacts() {
        let fx = Fixture::new();
        let mut backend = ScriptedBackend::default();
        backend.script.insert(
            0,
            vec![Detection::new("smoke", 0.8, BoundingBox::new(1.0, 1.0, 8.0, 8.0))],
        );
        let outcome = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::image("cam.png", png(16, 16)),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(!outcome.result.target_present);
        assert_eq!(outcome.result.detections.len(), 1);
        assert!(fx.artifacts_empty());
    }

    #[test]
    fn video_is_sampled_every_stride_frames() {
        let fx = Fixture::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = ScriptedBackend {
            calls: calls.clone(),
            ..Default::default()
        };
        backend.script.insert(30, vec![fire(0.67, 1.0, 1.0, 6.0, 6.0)]);

        let outcome = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::video("clip.mjpeg", mjpeg(61)),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![0, 30, 60]);
        assert_eq!(outcome.result.frames_sampled, 3);
        assert!(outcome.result.target_present);
        assert_eq!(outcome.result.max_confidence, 0.67);
        assert_eq!(outcome.result.detections[0].frame_index, 30);
        assert_eq!(outcome.record.source_type, SourceType::Upload);
        let artifact = outcome.result.artifact_ref.unwrap();
        assert!(artifact.ends_with(".jpg"));
        assert!(fx.staging_empty());
    }

    #[test]
    fn unsupported_extension_has_no_side_effects() {
        let fx = Fixture::new();
        let err = fx
            .orchestrator
            .run(
                &profile(ScriptedBackend::default()),
                PipelineRequest::image("notes.txt", b"hello".to_vec()),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(err.status(), 422);
        assert_eq!(fx.records(), 0);
        assert!(fx.staging_empty());
        assert!(fx.artifacts_empty());
    }

    #[test]
    fn mismatched_content_type_and_empty_body_are_rejected() {
        let fx = Fixture::new();
        let p = profile(ScriptedBackend::default());
        let err = fx
            .orchestrator
            .run(
                &p,
                PipelineRequest::image("cam.png", png(4, 4)).with_content_type("video/mp4"),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let err = fx
            .orchestrator
            .run(&p, PipelineRequest::image("cam.png", Vec::new()), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(fx.records(), 0);
    }

    #[test]
    fn invalid_backend_detection_fails_image_request() {
        let fx = Fixture::new();
        let mut backend = ScriptedBackend::default();
        backend.script.insert(0, vec![fire(1.5, 1.0, 1.0, 4.0, 4.0)]);
        let err = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::image("cam.png", png(16, 16)),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));

        let mut backend = ScriptedBackend::default();
        backend.script.insert(0, vec![fire(0.5, 1.0, 1.0, 40.0, 4.0)]);
        let err = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::image("cam.png", png(16, 16)),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
        assert_eq!(fx.records(), 0);
        assert!(fx.staging_empty());
    }

    #[test]
    fn video_inference_failure_stops_early() {
        let fx = Fixture::new();
        let mut backend = ScriptedBackend {
            fail_at: Some(30),
            ..Default::default()
        };
        backend.script.insert(0, vec![fire(0.4, 1.0, 1.0, 6.0, 6.0)]);
        let outcome = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::video("clip.mjpg", mjpeg(61)),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(outcome.result.frames_sampled, 1);
        assert!(outcome.result.target_present);
        assert!(outcome.result.degraded);
        assert!(outcome.result.artifact_ref.is_some());
        assert_eq!(
            outcome.record.message,
            "fire detected (video analysis stopped early)"
        );
        assert_eq!(fx.records(), 1);
        assert!(fx.staging_empty());
    }

    #[test]
    fn video_inference_failure_on_first_frame_yields_empty_degraded_result() {
        let fx = Fixture::new();
        let backend = ScriptedBackend {
            fail_at: Some(0),
            ..Default::default()
        };
        let outcome = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::video("clip.mjpeg", mjpeg(5)),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(outcome.result.frames_sampled, 0);
        assert!(!outcome.result.target_present);
        assert_eq!(outcome.result.max_confidence, 0.0);
        assert!(outcome.result.degraded);
        assert_eq!(outcome.record.message, "safe (video analysis stopped early)");
        assert!(outcome.record.degraded);
        assert_eq!(fx.records(), 1);
        assert!(fx.artifacts_empty());
        assert!(fx.staging_empty());
    }

    #[test]
    fn video_without_any_frame_is_an_ingestion_failure() {
        let fx = Fixture::new();
        let err = fx
            .orchestrator
            .run(
                &profile(ScriptedBackend::default()),
                PipelineRequest::video("clip.mjpeg", b"this is plain text, not video".to_vec()),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion(_)));
        assert_eq!(err.status(), 500);
        assert_eq!(fx.records(), 0);
        assert!(fx.staging_empty());
        assert!(fx.artifacts_empty());
    }

    #[test]
    fn undecodable_upload_is_an_ingestion_failure() {
        let fx = Fixture::new();
        let err = fx
            .orchestrator
            .run(
                &profile(ScriptedBackend::default()),
                PipelineRequest::image("cam.png", b"not a png".to_vec()),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion(_)));
        assert_eq!(fx.records(), 0);
        assert!(fx.staging_empty());
    }

    #[test]
    fn staging_failure_is_an_ingestion_failure() {
        let fx = Fixture::new();
        let staging = fx.orchestrator.store().staging_dir().to_path_buf();
        std::fs::remove_dir(&staging).unwrap();
        std::fs::write(&staging, b"in the way").unwrap();
        let err = fx
            .orchestrator
            .run(
                &profile(ScriptedBackend::default()),
                PipelineRequest::image("cam.png", png(4, 4)),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ingestion(_)));
        assert_eq!(fx.records(), 0);
    }

    #[test]
    fn log_write_failure_removes_artifact_and_reports_id() {
        let fx = Fixture::with_writer(DetectionLogWriter::new(BrokenStore));
        let mut backend = ScriptedBackend::default();
        backend.script.insert(0, vec![fire(0.9, 2.0, 2.0, 10.0, 10.0)]);
        let err = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::image("cam.png", png(16, 16)),
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::LogWrite { .. }));
        assert!(err.request_id().is_some());
        assert!(fx.artifacts_empty());
        assert!(fx.staging_empty());
    }

    #[test]
    fn artifact_write_failure_degrades_result() {
        let fx = Fixture::new();
        let artifacts = fx.orchestrator.store().artifact_dir().to_path_buf();
        std::fs::remove_dir(&artifacts).unwrap();
        std::fs::write(&artifacts, b"not a directory").unwrap();

        let mut backend = ScriptedBackend::default();
        backend.script.insert(0, vec![fire(0.9, 2.0, 2.0, 10.0, 10.0)]);
        let outcome = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::image("cam.png", png(16, 16)),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(outcome.result.target_present);
        assert!(outcome.result.degraded);
        assert!(outcome.record.result_image.is_none());
        assert!(outcome.record.message.contains("annotated image unavailable"));
        assert_eq!(fx.records(), 1);
        assert!(fx.staging_empty());
    }

    #[test]
    fn cancellation_mid_video_writes_nothing() {
        let fx = Fixture::new();
        let token = CancelToken::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut backend = ScriptedBackend {
            cancel_at: Some((30, token.clone())),
            calls: calls.clone(),
            ..Default::default()
        };
        backend.script.insert(0, vec![fire(0.9, 1.0, 1.0, 6.0, 6.0)]);
        let err = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::video("clip.mjpeg", mjpeg(91)),
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert_eq!(*calls.lock().unwrap(), vec![0, 30]);
        assert_eq!(fx.records(), 0);
        assert!(fx.staging_empty());
        assert!(fx.artifacts_empty());
    }

    #[test]
    fn cancellation_after_persisting_removes_artifact() {
        let fx = Fixture::new();
        let artifacts = fx.orchestrator.store().artifact_dir().to_path_buf();
        let token = CancelToken::new().with_disconnect_probe(move || !dir_is_empty(&artifacts));
        let mut backend = ScriptedBackend::default();
        backend.script.insert(0, vec![fire(0.9, 2.0, 2.0, 10.0, 10.0)]);
        let err = fx
            .orchestrator
            .run(
                &profile(backend),
                PipelineRequest::image("cam.png", png(16, 16)),
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert_eq!(fx.records(), 0);
        assert!(fx.artifacts_empty());
        assert!(fx.staging_empty());
    }

    #[test]
    fn expired_deadline_cancels_before_staging() {
        let fx = Fixture::new();
        let token = CancelToken::new().with_deadline(std::time::Instant::now());
        let err = fx
            .orchestrator
            .run(
                &profile(ScriptedBackend::default()),
                PipelineRequest::image("cam.png", png(4, 4)),
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert_eq!(err.status(), 408);
        assert_eq!(fx.records(), 0);
        assert!(fx.staging_empty());
    }

    #[test]
    fn request_ids_are_unique() {
        let fx = Fixture::new();
        let p = profile(ScriptedBackend::default());
        let a = fx
            .orchestrator
            .run(&p, PipelineRequest::image("a.png", png(4, 4)), &CancelToken::new())
            .unwrap();
        let b = fx
            .orchestrator
            .run(&p, PipelineRequest::image("b.png", png(4, 4)), &CancelToken::new())
            .unwrap();
        assert_ne!(a.result.id, b.result.id);
        assert_eq!(fx.records(), 2);
    }
}
