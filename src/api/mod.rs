//! HTTP API.
//!
//! A small blocking HTTP/1.1 server: one accept loop, one worker thread per
//! accepted connection, bounded by `max_concurrent_requests`. Every connection
//! carries exactly one request and is closed after the response.
//!
//! Authenticated routes resolve the bearer credential before reading any media
//! into the pipeline. Response bodies never carry internal error detail.

mod http;
mod multipart;
mod response;

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::annotate::ArtifactFormat;
use crate::auth::{parse_bearer, CredentialVerifier, Subject};
use crate::config::{FirewatchConfig, FIRE_PROFILE, METAL_PROFILE};
use crate::detect::BackendRegistry;
use crate::error::PipelineError;
use crate::frame::{file_extension, MediaKind};
use crate::pipeline::{CancelToken, DetectionProfile, Orchestrator, PipelineRequest, SourceType};
use crate::storage::sanitize_artifact_name;

use http::{read_request, write_json_response, write_response, HttpRequest, ReadError};
use response::{error_body, DetectResponse, HealthResponse, PredictResponse};

const DEFAULT_RECENT_LIMIT: usize = 20;
const MAX_RECENT_LIMIT: usize = 200;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_body_bytes: usize,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub artifact_mount: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            max_body_bytes: 64 * 1024 * 1024,
            max_concurrent_requests: 16,
            request_timeout: Duration::from_secs(120),
            artifact_mount: "/log".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn from_settings(cfg: &FirewatchConfig) -> Self {
        Self {
            addr: cfg.api.addr.clone(),
            max_body_bytes: cfg.api.max_body_bytes,
            max_concurrent_requests: cfg.api.max_concurrent_requests,
            request_timeout: cfg.api.request_timeout,
            artifact_mount: cfg.storage.artifact_mount.clone(),
        }
    }
}

/// Everything a request handler needs. Shared by all worker threads.
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub profiles: BTreeMap<String, DetectionProfile>,
    pub registry: BackendRegistry,
    pub verifier: Arc<dyn CredentialVerifier>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections and wait briefly for in-flight requests.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        let started = Instant::now();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if started.elapsed() > DRAIN_TIMEOUT {
                log::warn!(
                    "api stopped with {} requests still running",
                    self.in_flight.load(Ordering::SeqCst)
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self {
            cfg,
            state: Arc::new(state),
        }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("api listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let server = Server {
            cfg: Arc::new(self.cfg),
            state: self.state,
            in_flight: in_flight.clone(),
        };
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = server.run(listener, shutdown_thread) {
                log::error!("api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            in_flight,
            join: Some(join),
        })
    }
}

struct Server {
    cfg: Arc<ApiConfig>,
    state: Arc<ApiState>,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when a worker finishes.
struct InFlightSlot(Arc<AtomicUsize>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Server {
    fn run(&self, listener: TcpListener, shutdown: Arc<AtomicBool>) -> Result<()> {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn dispatch(&self, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nonblocking(false) {
            log::warn!("api: cannot configure connection from {}: {}", peer, err);
            return;
        }
        let previous = self.in_flight.fetch_add(1, Ordering::SeqCst);
        let slot = InFlightSlot(self.in_flight.clone());
        if previous >= self.cfg.max_concurrent_requests {
            drop(slot);
            log::warn!("api: at capacity, rejecting connection from {}", peer);
            if let Err(err) = write_json_response(&mut stream, 503, &error_body("busy", None)) {
                log::debug!("api: 503 write to {} failed: {}", peer, err);
            }
            return;
        }

        let cfg = self.cfg.clone();
        let state = self.state.clone();
        let spawned = std::thread::Builder::new()
            .name("firewatch-worker".to_string())
            .spawn(move || {
                let _slot = slot;
                if let Err(err) = handle_connection(stream, &cfg, &state) {
                    log::warn!("api: request from {} failed: {:#}", peer, err);
                }
            });
        if let Err(err) = spawned {
            log::error!("api: cannot spawn worker: {}", err);
        }
    }
}

enum Route<'a> {
    Health,
    Recent,
    Record(&'a str),
    Artifact(&'a str),
    Detect(Endpoint),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Endpoint {
    Stream,
    Upload,
    PredictFire,
    PredictMetal,
}

impl Endpoint {
    fn field(self) -> &'static str {
        match self {
            Endpoint::Stream => "frame",
            Endpoint::Upload => "video",
            Endpoint::PredictFire | Endpoint::PredictMetal => "file",
        }
    }

    fn kind(self) -> MediaKind {
        match self {
            Endpoint::Upload => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }

    fn source_type(self) -> SourceType {
        match self {
            Endpoint::Stream => SourceType::CameraFrame,
            _ => SourceType::Upload,
        }
    }

    fn profile(self) -> &'static str {
        match self {
            Endpoint::PredictMetal => METAL_PROFILE,
            _ => FIRE_PROFILE,
        }
    }
}

fn route<'a>(method: &str, path: &'a str, mount: &str) -> Result<Route<'a>, u16> {
    let (route, allowed) = match path {
        "/health" => (Route::Health, "GET"),
        "/detections" => (Route::Recent, "GET"),
        "/detect/stream" => (Route::Detect(Endpoint::Stream), "POST"),
        "/detect/upload" => (Route::Detect(Endpoint::Upload), "POST"),
        "/predict_fire" => (Route::Detect(Endpoint::PredictFire), "POST"),
        "/predict_metal" => (Route::Detect(Endpoint::PredictMetal), "POST"),
        _ => {
            if let Some(id) = path.strip_prefix("/detections/") {
                (Route::Record(id), "GET")
            } else if let Some(name) = path
                .strip_prefix(mount)
                .and_then(|rest| rest.strip_prefix('/'))
            {
                (Route::Artifact(name), "GET")
            } else {
                return Err(404);
            }
        }
    };
    if method != allowed {
        return Err(405);
    }
    Ok(route)
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, state: &ApiState) -> Result<()> {
    let request = match read_request(&mut stream, cfg.max_body_bytes) {
        Ok(request) => request,
        Err(ReadError::TooLarge(len)) => {
            let err = PipelineError::PayloadTooLarge(len);
            log::info!("api: {}", err);
            write_json_response(&mut stream, err.status(), &error_body(err.code(), None))?;
            return Ok(());
        }
        Err(ReadError::LengthRequired) => {
            write_json_response(&mut stream, 411, &error_body("length_required", None))?;
            return Ok(());
        }
        Err(ReadError::Malformed(err)) => {
            write_json_response(&mut stream, 400, &error_body("bad_request", None))?;
            return Err(err);
        }
        Err(ReadError::Io(err)) => return Err(err.into()),
    };

    let route = match route(&request.method, &request.path, &cfg.artifact_mount) {
        Ok(route) => route,
        Err(status) => {
            let code = if status == 405 {
                "method_not_allowed"
            } else {
                "not_found"
            };
            write_json_response(&mut stream, status, &error_body(code, None))?;
            return Ok(());
        }
    };

    match route {
        Route::Health => {
            let body = HealthResponse::from_registry(&state.registry);
            write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&body)?)?;
            Ok(())
        }
        Route::Artifact(name) => serve_artifact(&mut stream, state, name),
        Route::Recent => {
            if authenticate(&mut stream, &request, state)?.is_none() {
                return Ok(());
            }
            let limit = match request.query_param("limit") {
                None => DEFAULT_RECENT_LIMIT,
                Some(raw) => match raw.parse::<usize>() {
                    Ok(n) if n > 0 => n.min(MAX_RECENT_LIMIT),
                    _ => {
                        write_json_response(&mut stream, 422, &error_body("invalid_request", None))?;
                        return Ok(());
                    }
                },
            };
            let records = state.orchestrator.writer().recent(limit)?;
            write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&records)?)?;
            Ok(())
        }
        Route::Record(id) => {
            if authenticate(&mut stream, &request, state)?.is_none() {
                return Ok(());
            }
            match state.orchestrator.writer().fetch(id)? {
                Some(record) => {
                    write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&record)?)?
                }
                None => write_json_response(&mut stream, 404, &error_body("not_found", None))?,
            }
            Ok(())
        }
        Route::Detect(endpoint) => {
            let Some(subject) = authenticate(&mut stream, &request, state)? else {
                return Ok(());
            };
            handle_detect(stream, cfg, state, request, endpoint, subject)
        }
    }
}

/// Resolve the caller. Writes the rejection and returns `None` when refused.
fn authenticate(
    stream: &mut TcpStream,
    request: &HttpRequest,
    state: &ApiState,
) -> Result<Option<Subject>> {
    if request.has_query_token() {
        write_json_response(stream, 400, &error_body("token_query_param_not_allowed", None))?;
        return Ok(None);
    }
    let resolved = parse_bearer(request.header("authorization"))
        .and_then(|token| state.verifier.resolve(token));
    match resolved {
        Ok(subject) => Ok(Some(subject)),
        Err(reason) => {
            let err = PipelineError::from(reason);
            log::warn!("api: {} rejected: {}", request.path, err);
            write_json_response(stream, err.status(), &error_body(err.code(), None))?;
            Ok(None)
        }
    }
}

fn handle_detect(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    state: &ApiState,
    mut request: HttpRequest,
    endpoint: Endpoint,
    subject: Subject,
) -> Result<()> {
    let Some(profile) = state.profiles.get(endpoint.profile()) else {
        write_json_response(&mut stream, 404, &error_body("profile_not_configured", None))?;
        return Ok(());
    };

    let body = std::mem::take(&mut request.body);
    let part = request
        .header("content-type")
        .and_then(multipart::boundary)
        .ok_or_else(|| anyhow!("expected multipart/form-data with a boundary"))
        .and_then(|boundary| multipart::parse(body, &boundary))
        .map(|parts| multipart::take_file(parts, endpoint.field()));
    let part = match part {
        Ok(Some(part)) => part,
        Ok(None) => {
            log::info!("api: {} without a '{}' file part", request.path, endpoint.field());
            write_json_response(&mut stream, 422, &error_body("invalid_request", None))?;
            return Ok(());
        }
        Err(err) => {
            log::info!("api: {} multipart rejected: {:#}", request.path, err);
            write_json_response(&mut stream, 422, &error_body("invalid_request", None))?;
            return Ok(());
        }
    };
    drop(request);

    let probe = stream.try_clone()?;
    let cancel = CancelToken::new()
        .with_timeout(cfg.request_timeout)
        .with_disconnect_probe(move || client_gone(&probe));

    let mut pipeline_request = PipelineRequest {
        file_name: part.file_name.unwrap_or_default(),
        content_type: part.content_type,
        bytes: part.data,
        kind: endpoint.kind(),
        source_type: endpoint.source_type(),
        subject_id: Some(subject.id),
    };
    if pipeline_request.content_type.as_deref() == Some("") {
        pipeline_request.content_type = None;
    }

    match state.orchestrator.run(profile, pipeline_request, &cancel) {
        Ok(outcome) => {
            let body = match endpoint {
                Endpoint::Stream | Endpoint::Upload => {
                    serde_json::to_vec(&DetectResponse::from(&outcome.result))?
                }
                Endpoint::PredictFire => {
                    serde_json::to_vec(&PredictResponse::fire(&outcome.result, &outcome.record))?
                }
                Endpoint::PredictMetal => {
                    serde_json::to_vec(&PredictResponse::metal(&outcome.result, &outcome.record))?
                }
            };
            write_response(&mut stream, 200, "application/json", &body)?;
        }
        Err(err) => {
            if matches!(err, PipelineError::Cancelled(_)) && client_gone(&stream) {
                return Ok(());
            }
            write_json_response(
                &mut stream,
                err.status(),
                &error_body(err.code(), err.request_id()),
            )?;
        }
    }
    Ok(())
}

/// True once the peer has closed its side of the connection.
fn client_gone(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut byte = [0u8; 1];
    let gone = match stream.peek(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    };
    let _ = stream.set_nonblocking(false);
    gone
}

fn serve_artifact(stream: &mut TcpStream, state: &ApiState, name: &str) -> Result<()> {
    if sanitize_artifact_name(name).is_err() {
        write_json_response(stream, 404, &error_body("not_found", None))?;
        return Ok(());
    }
    match state.orchestrator.store().read_artifact(name) {
        Ok(bytes) => {
            let ext = file_extension(name).unwrap_or_default();
            let format = ArtifactFormat::for_extension(&ext);
            write_response(stream, 200, format.content_type(), &bytes)?;
        }
        Err(err) => {
            log::debug!("api: artifact {} unavailable: {:#}", name, err);
            write_json_response(stream, 404, &error_body("not_found", None))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_method_and_path() {
        assert!(matches!(route("GET", "/health", "/log"), Ok(Route::Health)));
        assert!(matches!(route("GET", "/detections", "/log"), Ok(Route::Recent)));
        assert!(matches!(
            route("GET", "/detections/abc", "/log"),
            Ok(Route::Record("abc"))
        ));
        assert!(matches!(
            route("GET", "/log/abc.png", "/log"),
            Ok(Route::Artifact("abc.png"))
        ));
        assert!(matches!(
            route("POST", "/predict_metal", "/log"),
            Ok(Route::Detect(Endpoint::PredictMetal))
        ));
        assert!(matches!(route("GET", "/detect/upload", "/log"), Err(405)));
        assert!(matches!(route("GET", "/logs/abc.png", "/log"), Err(404)));
        assert!(matches!(route("GET", "/nope", "/log"), Err(404)));
    }

    #[test]
    fn endpoints_map_to_fields_and_profiles() {
        assert_eq!(Endpoint::Stream.field(), "frame");
        assert_eq!(Endpoint::Upload.kind(), MediaKind::Video);
        assert_eq!(Endpoint::Stream.source_type(), SourceType::CameraFrame);
        assert_eq!(Endpoint::PredictMetal.profile(), METAL_PROFILE);
        assert_eq!(Endpoint::PredictFire.profile(), FIRE_PROFILE);
    }
}
