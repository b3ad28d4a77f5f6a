use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Long-lived handle to one loaded backend.
///
/// Cloning the handle shares the same model instance. Calls are serialized by the
/// inner `Mutex` because `DetectorBackend::detect` takes `&mut self`; pipelines
/// treat every `infer` call as independent.
#[derive(Clone)]
pub struct SharedDetector {
    name: &'static str,
    inner: Arc<Mutex<dyn DetectorBackend>>,
}

impl SharedDetector {
    pub fn new<B: DetectorBackend + 'static>(backend: B) -> Self {
        Self {
            name: backend.name(),
            inner: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn infer(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("backend '{}' lock poisoned", self.name))?;
        guard.detect(frame)
    }

    pub fn labels(&self) -> Result<Vec<String>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("backend '{}' lock poisoned", self.name))?;
        Ok(guard.labels())
    }

    pub fn warm_up(&self) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("backend '{}' lock poisoned", self.name))?;
        guard.warm_up()
    }

    /// A backend is loaded as long as its lock has not been poisoned by a panic.
    pub fn is_loaded(&self) -> bool {
        !self.inner.is_poisoned()
    }
}

impl fmt::Debug for SharedDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDetector")
            .field("name", &self.name)
            .finish()
    }
}

/// Registry of loaded detectors keyed by detection profile (e.g. "fire", "metal").
#[derive(Clone, Debug, Default)]
pub struct BackendRegistry {
    detectors: BTreeMap<String, SharedDetector>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under a profile name, replacing any previous one.
    pub fn register<B: DetectorBackend + 'static>(&mut self, profile: &str, backend: B) {
        self.insert(profile, SharedDetector::new(backend));
    }

    /// Register an already shared detector. Several profiles may share one model.
    pub fn insert(&mut self, profile: &str, detector: SharedDetector) {
        self.detectors.insert(profile.to_string(), detector);
    }

    pub fn get(&self, profile: &str) -> Option<SharedDetector> {
        self.detectors.get(profile).cloned()
    }

    pub fn require(&self, profile: &str) -> Result<SharedDetector> {
        self.get(profile)
            .ok_or_else(|| anyhow!("no backend registered for profile '{}'", profile))
    }

    /// Profile names with the backend serving each.
    pub fn list(&self) -> Vec<(String, &'static str)> {
        self.detectors
            .iter()
            .map(|(profile, det)| (profile.clone(), det.name()))
            .collect()
    }

    /// True when at least one backend is registered and none is poisoned.
    pub fn all_loaded(&self) -> bool {
        !self.detectors.is_empty() && self.detectors.values().all(SharedDetector::is_loaded)
    }

    /// Warm every registered backend once.
    pub fn warm_up_all(&self) -> Result<()> {
        for (profile, det) in &self.detectors {
            det.warm_up()
                .map_err(|e| anyhow!("warm-up failed for profile '{}': {:#}", profile, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubBackend;
    use image::RgbImage;

    #[test]
    fn registry_resolves_profiles() {
        let mut registry = BackendRegistry::new();
        assert!(!registry.all_loaded());
        registry.register("fire", StubBackend::new());
        assert!(registry.all_loaded());
        assert_eq!(registry.list(), vec![("fire".to_string(), "stub")]);
        assert!(registry.get("fire").is_some());
        assert!(registry.require("metal").is_err());
    }

    #[test]
    fn shared_detector_is_usable_across_threads() {
        let det = SharedDetector::new(StubBackend::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let det = det.clone();
                std::thread::spawn(move || {
                    let frame = Frame::new(i, RgbImage::new(4, 4));
                    det.infer(&frame).map(|d| d.len())
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), 0);
        }
    }
}
