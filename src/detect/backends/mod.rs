pub mod color;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use color::ColorBackend;
pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
