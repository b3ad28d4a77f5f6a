//! Inference adapter.
//!
//! The pipeline only ever talks to a [`SharedDetector`]: one long-lived model
//! instance per profile, safe to call from many request threads.

mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{ColorBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::{BackendRegistry, SharedDetector};
pub use result::{BoundingBox, Detection, DetectionBatch};
