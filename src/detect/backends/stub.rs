use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend for testing and health checks. Never detects anything.
pub struct StubBackend {
    labels: Vec<String>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            labels: vec!["fire".to_string(), "smoke".to_string()],
        }
    }

    pub fn with_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn labels(&self) -> Vec<String> {
        self.labels.clone()
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}
