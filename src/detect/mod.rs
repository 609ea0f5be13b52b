mod backend;
mod backends;
mod factory;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use factory::{BackendFactory, DetectorFactory};
pub use result::{Detection, DetectionResult};
