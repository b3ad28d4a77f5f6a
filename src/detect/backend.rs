use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// # Audit Boundary
///
/// Implementations receive a decoded frame and return detections in that frame's
/// pixel coordinates. They MUST NOT:
/// - Retain the frame beyond the `detect` call
/// - Write to disk or make network requests
///
/// `detect` takes `&mut self`; callers share a backend through
/// [`SharedDetector`](crate::detect::SharedDetector), which serializes access.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Labels this backend can emit.
    fn labels(&self) -> Vec<String>;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
