use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use firewatch::api::{ApiConfig, ApiHandle, ApiServer, ApiState};
use firewatch::auth::token_digest_hex;
use firewatch::{
    ArtifactStore, BackendRegistry, BoundingBox, Detection, DetectionLogWriter, DetectionProfile, DetectorBackend,
    Frame, FrameSampler, Orchestrator, SharedDetector, SqliteDetectionLogStore,
    StaticTokenVerifier, StubBackend, TargetPolicy,
};

const TOKEN: &str = "test-token";
const BOUNDARY: &str = "firewatch-test-boundary";

/// Reports fire at the listed frame indices, scaled to each frame.
struct FireAt {
    frames: Vec<u64>,
    confidence: f32,
}

impl DetectorBackend for FireAt {
    fn name(&self) -> &'static str {
        "fire-at"
    }

    fn labels(&self) -> Vec<String> {
        vec!["fire".to_string()]
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if !self.frames.contains(&frame.index) {
            return Ok(Vec::new());
        }
        let (w, h) = (frame.width() as f32, frame.height() as f32);
        Ok(vec![Detection::new(
            "fire",
            self.confidence,
            BoundingBox::new(w * 0.15, h * 0.15, w * 0.8, h * 0.8),
        )])
    }
}

/// Blocks inside `detect` until released, to hold a worker busy.
struct Gate {
    entered: mpsc::Sender<()>,
    release: mpsc::Receiver<()>,
}

impl DetectorBackend for Gate {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn labels(&self) -> Vec<String> {
        vec!["fire".to_string()]
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        let _ = self.entered.send(());
        let _ = self.release.recv_timeout(Duration::from_secs(10));
        Ok(Vec::new())
    }
}

struct TestApi {
    dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new<B: DetectorBackend + 'static>(fire_backend: B, max_concurrent: usize) -> Result<Self> {
        let dir = tempdir()?;
        let store = SqliteDetectionLogStore::open(&dir.path().join("firewatch.db").to_string_lossy())?;
        let orchestrator = Orchestrator::new(
            ArtifactStore::new(dir.path().join("temp"), dir.path().join("log"))?,
            DetectionLogWriter::new(store),
            FrameSampler::new(30, 1000)?,
        );

        let mut registry = BackendRegistry::new();
        registry.register("fire", fire_backend);
        registry.insert(
            "metal",
            SharedDetector::new(StubBackend::with_labels(vec![
                "steel".to_string(),
                "aluminum".to_string(),
                "copper".to_string(),
            ])),
        );
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "fire".to_string(),
            DetectionProfile::new("fire", TargetPolicy::fire(), registry.require("fire")?),
        );
        profiles.insert(
            "metal".to_string(),
            DetectionProfile::new(
                "metal",
                TargetPolicy::new(["steel", "aluminum", "copper"]),
                registry.require("metal")?,
            )
            .with_messages("metal detected", "no metal detected"),
        );

        let state = ApiState {
            orchestrator,
            profiles,
            registry,
            verifier: Arc::new(StaticTokenVerifier::from_hex_digests([token_digest_hex(TOKEN)])?),
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_body_bytes: 4 * 1024 * 1024,
            max_concurrent_requests: max_concurrent,
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, state).spawn()?;
        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn send(&self, request: &[u8]) -> Result<Response> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.write_all(request)?;
        read_response(&mut stream)
    }

    fn get(&self, path: &str, token: Option<&str>) -> Result<Response> {
        let auth = token
            .map(|t| format!("Authorization: Bearer {t}\r\n"))
            .unwrap_or_default();
        self.send(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{auth}\r\n").as_bytes())
    }

    fn upload(&self, path: &str, field: &str, file_name: &str, data: &[u8]) -> Result<Response> {
        self.send(&upload_request(path, field, file_name, data, Some(TOKEN)))
    }

    fn artifact_count(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("log")).unwrap().count()
    }

    fn staging_count(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("temp")).unwrap().count()
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

struct Response {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

fn read_response(stream: &mut TcpStream) -> Result<Response> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has a header terminator");
    let headers = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    Ok(Response {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

fn upload_request(
    path: &str,
    field: &str,
    file_name: &str,
    data: &[u8],
    token: Option<&str>,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    let auth = token
        .map(|t| format!("Authorization: Bearer {t}\r\n"))
        .unwrap_or_default();
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\n{auth}Content-Type: multipart/form-data; boundary={BOUNDARY}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(&body);
    request
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([50, 60, 70]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn mjpeg(frames: usize) -> Vec<u8> {
    let img = RgbImage::from_pixel(16, 16, Rgb([50, 60, 70]));
    let mut one = Vec::new();
    JpegEncoder::new(&mut one).encode_image(&img).unwrap();
    one.repeat(frames)
}

fn no_fire() -> FireAt {
    FireAt {
        frames: Vec::new(),
        confidence: 0.0,
    }
}

#[test]
fn health_is_public_and_reports_backends() -> Result<()> {
    let api = TestApi::new(no_fire(), 4)?;
    let response = api.get("/health", None)?;
    assert_eq!(response.status, 200);
    let value = response.json();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["model_loaded"], true);
    assert_eq!(value["backends"].as_array().unwrap().len(), 2);
    Ok(())
}

#[test]
fn detection_routes_require_bearer_token() -> Result<()> {
    let api = TestApi::new(no_fire(), 4)?;

    let response = api.send(&upload_request("/detect/stream", "frame", "cam.png", &png(8, 8), None))?;
    assert_eq!(response.status, 401);
    assert_eq!(response.json()["error"], "unauthorized");

    let response = api.send(&upload_request(
        "/detect/stream",
        "frame",
        "cam.png",
        &png(8, 8),
        Some("wrong"),
    ))?;
    assert_eq!(response.status, 401);

    let response = api.get("/detections?token=test-token", None)?;
    assert_eq!(response.status, 400);

    let response = api.get("/detections", None)?;
    assert_eq!(response.status, 401);
    assert_eq!(api.staging_count(), 0);
    Ok(())
}

#[test]
fn predict_fire_returns_result_and_serves_artifact() -> Result<()> {
    let api = TestApi::new(
        FireAt {
            frames: vec![0],
            confidence: 0.92,
        },
        4,
    )?;

    let response = api.upload("/predict_fire", "file", "cam.png", &png(64, 64))?;
    assert_eq!(response.status, 200);
    let value = response.json();
    assert_eq!(value["has_fire"], true);
    assert!((value["confidence_score"].as_f64().unwrap() - 0.92).abs() < 1e-6);
    assert_eq!(value["message"], "fire detected");
    assert_eq!(value["file_name"], "cam.png");
    assert_eq!(value["detections"][0]["class_name"], "fire");
    assert_eq!(value["date"].as_str().unwrap().len(), "2024-01-01 00:00:00".len());
    let id = value["id"].as_str().unwrap().to_string();
    let image = value["result_image"].as_str().unwrap().to_string();
    assert_eq!(image, format!("{id}.png"));
    assert_eq!(api.artifact_count(), 1);
    assert_eq!(api.staging_count(), 0);

    let artifact = api.get(&format!("/log/{image}"), None)?;
    assert_eq!(artifact.status, 200);
    assert!(artifact.headers.contains("Content-Type: image/png"));
    assert!(image::load_from_memory(&artifact.body).is_ok());

    let record = api.get(&format!("/detections/{id}"), Some(TOKEN))?;
    assert_eq!(record.status, 200);
    let record = record.json();
    assert_eq!(record["id"], id.as_str());
    assert_eq!(record["source_type"], "upload");
    assert_eq!(record["result_image"], image.as_str());
    assert!(record["subject_id"].as_str().unwrap().starts_with("token:"));

    let recent = api.get("/detections?limit=5", Some(TOKEN))?;
    assert_eq!(recent.status, 200);
    assert_eq!(recent.json().as_array().unwrap().len(), 1);
    Ok(())
}

#[test]
fn stream_frame_without_fire_is_logged_without_artifact() -> Result<()> {
    let api = TestApi::new(no_fire(), 4)?;
    let response = api.upload("/detect/stream", "frame", "frame.jpg", &png(16, 16))?;
    assert_eq!(response.status, 200);
    let value = response.json();
    assert_eq!(value["has_fire"], false);
    assert_eq!(value["confidence_score"], 0.0);
    assert_eq!(value["message"], "safe");
    assert_eq!(api.artifact_count(), 0);

    let record = api.get(&format!("/detections/{}", value["id"].as_str().unwrap()), Some(TOKEN))?;
    assert_eq!(record.json()["source_type"], "camera-frame");
    Ok(())
}

#[test]
fn video_upload_samples_every_thirtieth_frame() -> Result<()> {
    let api = TestApi::new(
        FireAt {
            frames: vec![30],
            confidence: 0.71,
        },
        4,
    )?;
    let response = api.upload("/detect/upload", "video", "clip.mjpeg", &mjpeg(61))?;
    assert_eq!(response.status, 200);
    let value = response.json();
    assert_eq!(value["has_fire"], true);
    assert!((value["confidence_score"].as_f64().unwrap() - 0.71).abs() < 1e-6);
    assert_eq!(value["detections"].as_array().unwrap().len(), 1);
    assert_eq!(value["detections"][0]["frame_index"], 30);
    assert_eq!(api.artifact_count(), 1);
    assert_eq!(api.staging_count(), 0);
    Ok(())
}

#[test]
fn predict_metal_uses_metal_profile() -> Result<()> {
    let api = TestApi::new(no_fire(), 4)?;
    let response = api.upload("/predict_metal", "file", "scrap.jpeg", &png(16, 16))?;
    assert_eq!(response.status, 200);
    let value = response.json();
    assert_eq!(value["has_target"], false);
    assert!(value.get("has_fire").is_none());
    assert_eq!(value["message"], "no metal detected");
    assert!(value["result_image"].is_null());
    Ok(())
}

#[test]
fn unsupported_media_is_rejected_without_side_effects() -> Result<()> {
    let api = TestApi::new(no_fire(), 4)?;
    let response = api.upload("/predict_fire", "file", "notes.txt", b"hello")?;
    assert_eq!(response.status, 422);
    assert_eq!(response.json()["error"], "unsupported_media");
    assert_eq!(api.staging_count(), 0);
    assert_eq!(api.artifact_count(), 0);

    let recent = api.get("/detections", Some(TOKEN))?;
    assert_eq!(recent.json().as_array().unwrap().len(), 0);

    let response = api.send(
        format!(
            "POST /predict_fire HTTP/1.1\r\nAuthorization: Bearer {TOKEN}\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{{}}"
        )
        .as_bytes(),
    )?;
    assert_eq!(response.status, 422);
    assert_eq!(response.json()["error"], "invalid_request");
    Ok(())
}

#[test]
fn oversize_body_is_rejected_before_reading() -> Result<()> {
    let api = TestApi::new(no_fire(), 4)?;
    let response = api.send(
        format!(
            "POST /detect/upload HTTP/1.1\r\nAuthorization: Bearer {TOKEN}\r\nContent-Type: multipart/form-data; boundary=x\r\nContent-Length: {}\r\n\r\n",
            512 * 1024 * 1024
        )
        .as_bytes(),
    )?;
    assert_eq!(response.status, 413);
    assert_eq!(response.json()["error"], "payload_too_large");
    Ok(())
}

#[test]
fn unknown_routes_and_bad_artifact_names_are_not_found() -> Result<()> {
    let api = TestApi::new(no_fire(), 4)?;
    assert_eq!(api.get("/nope", None)?.status, 404);
    assert_eq!(api.get("/log/..%2Fsecret.png", None)?.status, 404);
    assert_eq!(api.get("/log/missing.png", None)?.status, 404);
    assert_eq!(api.get("/detections/unknown-id", Some(TOKEN))?.status, 404);
    assert_eq!(api.get("/predict_fire", Some(TOKEN))?.status, 405);
    Ok(())
}

#[test]
fn connections_beyond_capacity_get_503() -> Result<()> {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let api = TestApi::new(
        Gate {
            entered: entered_tx,
            release: release_rx,
        },
        1,
    )?;

    let addr = api.handle().addr;
    let busy = std::thread::spawn(move || -> Result<u16> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(&upload_request(
            "/detect/stream",
            "frame",
            "cam.png",
            &png(8, 8),
            Some(TOKEN),
        ))?;
        Ok(read_response(&mut stream)?.status)
    });
    entered_rx.recv_timeout(Duration::from_secs(10))?;

    // Rejected on accept, before anything is read.
    let mut stream = TcpStream::connect(addr)?;
    let rejected = read_response(&mut stream)?;
    assert_eq!(rejected.status, 503);
    assert_eq!(rejected.json()["error"], "busy");

    release_tx.send(())?;
    assert_eq!(busy.join().unwrap()?, 200);

    let mut status = 0;
    for _ in 0..50 {
        status = api.get("/health", None)?.status;
        if status == 200 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(status, 200);
    Ok(())
}

#[test]
fn quoted_upload_names_survive_multipart_parsing() -> Result<()> {
    let api = TestApi::new(no_fire(), 4)?;
    let response = api.upload("/predict_fire", "file", "yard;north.png", &png(16, 16))?;
    assert_eq!(response.status, 200);
    let value = response.json();
    assert_eq!(value["file_name"], "yard;north.png");
    assert_eq!(value["has_fire"], false);
    Ok(())
}
