use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::aggregate::TargetPolicy;
use crate::auth::{CredentialVerifier, SessionTokenVerifier, StaticTokenVerifier};
use crate::detect::{BackendRegistry, ColorBackend, SharedDetector, StubBackend};
use crate::ingest::{FrameSampler, DEFAULT_FRAME_STRIDE, DEFAULT_MAX_SAMPLED_FRAMES};
use crate::pipeline::DetectionProfile;
use crate::storage::{ArtifactStore, DEFAULT_ARTIFACT_DIR, DEFAULT_STAGING_DIR};

const DEFAULT_DB_PATH: &str = "firewatch.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 16;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_ARTIFACT_MOUNT: &str = "/log";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;

pub const FIRE_PROFILE: &str = "fire";
pub const METAL_PROFILE: &str = "metal";

/// Routes served by the API; the artifact mount must not shadow them.
const RESERVED_PREFIXES: &[&str] = &["/detect", "/detections", "/predict_fire", "/predict_metal", "/health"];

#[derive(Debug, Deserialize, Default)]
struct FirewatchConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    storage: Option<StorageConfigFile>,
    sampling: Option<SamplingConfigFile>,
    profiles: Option<BTreeMap<String, ProfileConfigFile>>,
    auth: Option<AuthConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_body_bytes: Option<usize>,
    max_concurrent_requests: Option<usize>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    staging_dir: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
    artifact_mount: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplingConfigFile {
    frame_stride: Option<u64>,
    max_sampled_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ProfileConfigFile {
    target_labels: Option<Vec<String>>,
    alert_message: Option<String>,
    clear_message: Option<String>,
    backend: Option<BackendConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BackendConfigFile {
    kind: Option<BackendKind>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    labels: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthConfigFile {
    scheme: Option<AuthScheme>,
    sessions_db: Option<String>,
    token_sha256: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Stub,
    Color,
    Tract,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Session,
    Static,
}

#[derive(Debug, Clone)]
pub struct FirewatchConfig {
    pub db_path: String,
    pub api: ApiSettings,
    pub storage: StorageSettings,
    pub sampling: SamplingSettings,
    pub profiles: BTreeMap<String, ProfileSettings>,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub max_body_bytes: usize,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub staging_dir: PathBuf,
    pub artifact_dir: PathBuf,
    /// URL prefix under which persisted artifacts are served.
    pub artifact_mount: String,
}

#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub frame_stride: u64,
    pub max_sampled_frames: u64,
}

#[derive(Debug, Clone)]
pub struct ProfileSettings {
    pub target_labels: Vec<String>,
    pub alert_message: String,
    pub clear_message: String,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub labels: Vec<String>,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub scheme: AuthScheme,
    pub sessions_db: String,
    pub token_sha256: Vec<String>,
}

impl FirewatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FIREWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FirewatchConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api = file.api.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let sampling = file.sampling.unwrap_or_default();
        let auth = file.auth.unwrap_or_default();

        let mut profiles = default_profiles();
        for (name, profile) in file.profiles.unwrap_or_default() {
            let name = name.trim().to_ascii_lowercase();
            let base = profiles
                .remove(&name)
                .unwrap_or_else(|| blank_profile(&name));
            profiles.insert(name, merge_profile(base, profile));
        }

        Self {
            api: ApiSettings {
                addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
                max_body_bytes: api.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
                max_concurrent_requests: api
                    .max_concurrent_requests
                    .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS),
                request_timeout: Duration::from_secs(
                    api.request_timeout_secs
                        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
                ),
            },
            storage: StorageSettings {
                staging_dir: storage
                    .staging_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR)),
                artifact_dir: storage
                    .artifact_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR)),
                artifact_mount: storage
                    .artifact_mount
                    .unwrap_or_else(|| DEFAULT_ARTIFACT_MOUNT.to_string()),
            },
            sampling: SamplingSettings {
                frame_stride: sampling.frame_stride.unwrap_or(DEFAULT_FRAME_STRIDE),
                max_sampled_frames: sampling
                    .max_sampled_frames
                    .unwrap_or(DEFAULT_MAX_SAMPLED_FRAMES),
            },
            profiles,
            auth: AuthSettings {
                scheme: auth.scheme.unwrap_or(AuthScheme::Session),
                sessions_db: auth.sessions_db.unwrap_or_else(|| db_path.clone()),
                token_sha256: auth.token_sha256.unwrap_or_default(),
            },
            db_path,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("FIREWATCH_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(path) = std::env::var("FIREWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                if self.auth.sessions_db == self.db_path {
                    self.auth.sessions_db = path.clone();
                }
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("FIREWATCH_STAGING_DIR") {
            if !dir.trim().is_empty() {
                self.storage.staging_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("FIREWATCH_ARTIFACT_DIR") {
            if !dir.trim().is_empty() {
                self.storage.artifact_dir = PathBuf::from(dir);
            }
        }
        if let Ok(stride) = std::env::var("FIREWATCH_FRAME_STRIDE") {
            self.sampling.frame_stride = stride
                .trim()
                .parse()
                .map_err(|_| anyhow!("FIREWATCH_FRAME_STRIDE must be a positive integer"))?;
        }
        if let Ok(timeout) = std::env::var("FIREWATCH_REQUEST_TIMEOUT_SECS") {
            let seconds: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("FIREWATCH_REQUEST_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.api.request_timeout = Duration::from_secs(seconds);
        }
        if let Ok(tokens) = std::env::var("FIREWATCH_STATIC_TOKENS") {
            let parsed = split_csv(&tokens);
            if !parsed.is_empty() {
                self.auth.scheme = AuthScheme::Static;
                self.auth.token_sha256 = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.sampling.frame_stride == 0 {
            return Err(anyhow!("sampling.frame_stride must be greater than zero"));
        }
        if self.sampling.max_sampled_frames == 0 {
            return Err(anyhow!("sampling.max_sampled_frames must be greater than zero"));
        }
        if self.api.max_body_bytes == 0 {
            return Err(anyhow!("api.max_body_bytes must be greater than zero"));
        }
        if self.api.max_concurrent_requests == 0 {
            return Err(anyhow!("api.max_concurrent_requests must be greater than zero"));
        }
        if self.api.request_timeout.is_zero() {
            return Err(anyhow!("api.request_timeout_secs must be greater than zero"));
        }

        let mount = self.storage.artifact_mount.trim().trim_end_matches('/');
        if !mount.starts_with('/') || mount.len() < 2 {
            return Err(anyhow!(
                "storage.artifact_mount must be an absolute path prefix like /log"
            ));
        }
        if RESERVED_PREFIXES.iter().any(|p| *p == mount) {
            return Err(anyhow!("storage.artifact_mount '{}' shadows an API route", mount));
        }
        self.storage.artifact_mount = mount.to_string();

        if self.profiles.is_empty() {
            return Err(anyhow!("at least one detection profile is required"));
        }
        for (name, profile) in &mut self.profiles {
            profile.target_labels = profile
                .target_labels
                .iter()
                .map(|l| l.trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty())
                .collect();
            if profile.target_labels.is_empty() {
                return Err(anyhow!("profile '{}' has no target labels", name));
            }
            let backend = &profile.backend;
            if !(0.0..=1.0).contains(&backend.confidence_threshold) {
                return Err(anyhow!(
                    "profile '{}' confidence_threshold must be within [0, 1]",
                    name
                ));
            }
            if backend.kind == BackendKind::Tract {
                if backend.model_path.is_none() {
                    return Err(anyhow!("profile '{}' tract backend needs model_path", name));
                }
                if backend.input_size == 0 || backend.labels.is_empty() {
                    return Err(anyhow!(
                        "profile '{}' tract backend needs input_size and labels",
                        name
                    ));
                }
            }
        }

        if self.auth.scheme == AuthScheme::Static {
            if self.auth.token_sha256.is_empty() {
                return Err(anyhow!("auth.scheme 'static' requires token_sha256 digests"));
            }
            StaticTokenVerifier::from_hex_digests(&self.auth.token_sha256)
                .context("auth.token_sha256")?;
        }
        Ok(())
    }

    pub fn frame_sampler(&self) -> Result<FrameSampler> {
        FrameSampler::new(
            self.sampling.frame_stride,
            self.sampling.max_sampled_frames,
        )
    }

    pub fn artifact_store(&self) -> Result<ArtifactStore> {
        ArtifactStore::new(&self.storage.staging_dir, &self.storage.artifact_dir)
    }

    /// Load one backend per profile.
    pub fn build_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        for (name, profile) in &self.profiles {
            let detector = profile
                .backend
                .build()
                .with_context(|| format!("load backend for profile '{}'", name))?;
            log::info!("profile {}: backend {}", name, detector.name());
            registry.insert(name, detector);
        }
        Ok(registry)
    }

    pub fn build_profiles(&self, registry: &BackendRegistry) -> Result<BTreeMap<String, DetectionProfile>> {
        let mut out = BTreeMap::new();
        for (name, settings) in &self.profiles {
            let detector = registry.require(name)?;
            let profile = DetectionProfile::new(
                name.clone(),
                TargetPolicy::new(settings.target_labels.iter().cloned()),
                detector,
            )
            .with_messages(settings.alert_message.clone(), settings.clear_message.clone());
            out.insert(name.clone(), profile);
        }
        Ok(out)
    }

    pub fn build_verifier(&self) -> Result<Arc<dyn CredentialVerifier>> {
        Ok(match self.auth.scheme {
            AuthScheme::Session => Arc::new(SessionTokenVerifier::open(&self.auth.sessions_db)?),
            AuthScheme::Static => Arc::new(StaticTokenVerifier::from_hex_digests(
                &self.auth.token_sha256,
            )?),
        })
    }
}

impl BackendSettings {
    pub fn build(&self) -> Result<SharedDetector> {
        Ok(match self.kind {
            BackendKind::Stub => {
                if self.labels.is_empty() {
                    SharedDetector::new(StubBackend::new())
                } else {
                    SharedDetector::new(StubBackend::with_labels(self.labels.clone()))
                }
            }
            BackendKind::Color => {
                let mut backend = ColorBackend::new().with_threshold(self.confidence_threshold);
                if let Some(label) = self.labels.first() {
                    backend = backend.with_label(label.clone());
                }
                SharedDetector::new(backend)
            }
            BackendKind::Tract => self.build_tract()?,
        })
    }

    #[cfg(feature = "backend-tract")]
    fn build_tract(&self) -> Result<SharedDetector> {
        let path = self
            .model_path
            .as_ref()
            .ok_or_else(|| anyhow!("tract backend needs model_path"))?;
        let backend = crate::detect::TractBackend::new(path, self.input_size, self.labels.clone())?
            .with_threshold(self.confidence_threshold);
        Ok(SharedDetector::new(backend))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn build_tract(&self) -> Result<SharedDetector> {
        Err(anyhow!(
            "tract backend requested but firewatch was built without the backend-tract feature"
        ))
    }
}

fn default_profiles() -> BTreeMap<String, ProfileSettings> {
    let mut profiles = BTreeMap::new();
    profiles.insert(
        FIRE_PROFILE.to_string(),
        ProfileSettings {
            target_labels: vec!["fire".to_string()],
            alert_message: "fire detected".to_string(),
            clear_message: "safe".to_string(),
            backend: BackendSettings {
                kind: BackendKind::Color,
                model_path: None,
                input_size: DEFAULT_INPUT_SIZE,
                labels: vec!["fire".to_string()],
                confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            },
        },
    );
    let metals: Vec<String> = ["steel", "aluminum", "copper"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    profiles.insert(
        METAL_PROFILE.to_string(),
        ProfileSettings {
            target_labels: metals.clone(),
            alert_message: "metal detected".to_string(),
            clear_message: "no metal detected".to_string(),
            backend: BackendSettings {
                kind: BackendKind::Stub,
                model_path: None,
                input_size: DEFAULT_INPUT_SIZE,
                labels: metals,
                confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            },
        },
    );
    profiles
}

fn blank_profile(name: &str) -> ProfileSettings {
    ProfileSettings {
        target_labels: Vec::new(),
        alert_message: format!("{} detected", name),
        clear_message: "safe".to_string(),
        backend: BackendSettings {
            kind: BackendKind::Stub,
            model_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            labels: Vec::new(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        },
    }
}

fn merge_profile(mut base: ProfileSettings, file: ProfileConfigFile) -> ProfileSettings {
    if let Some(labels) = file.target_labels {
        base.target_labels = labels;
    }
    if let Some(alert) = file.alert_message {
        base.alert_message = alert;
    }
    if let Some(clear) = file.clear_message {
        base.clear_message = clear;
    }
    if let Some(backend) = file.backend {
        if let Some(kind) = backend.kind {
            base.backend.kind = kind;
        }
        if backend.model_path.is_some() {
            base.backend.model_path = backend.model_path;
        }
        if let Some(size) = backend.input_size {
            base.backend.input_size = size;
        }
        if let Some(labels) = backend.labels {
            base.backend.labels = labels;
        }
        if let Some(threshold) = backend.confidence_threshold {
            base.backend.confidence_threshold = threshold;
        }
    }
    base
}

fn read_config_file(path: &Path) -> Result<FirewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
