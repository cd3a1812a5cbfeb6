pub mod capture;
pub mod model;
pub mod registry;

pub use capture::{CaptureSet, Frame, FrameSource};
pub use model::{look_at, Cached, CameraModel, Projection, Vec3};
pub use registry::{CameraInfo, CameraRegistry};
