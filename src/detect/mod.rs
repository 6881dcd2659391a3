mod adapter;
mod backend;
mod backends;
mod registry;
mod result;

pub use adapter::{DetectionAdapter, SharedDetector};
pub use backend::DetectorBackend;
pub use backends::NullBackend;
#[cfg(feature = "backend-tract")]
pub use backends::{TractBackend, TractConfig};
pub use registry::BackendRegistry;
pub use result::{BoundingBox, Category, Detection, RawDetection};
