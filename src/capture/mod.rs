pub mod camera;
pub mod convert;
pub mod frame;
pub mod synthetic;

pub use camera::{CameraSink, CameraSource, CaptureRouter, CaptureStage, SensorKind};
pub use convert::{PixelConverter, SoftwareConverter};
pub use frame::{Frame, PixelFormat, RawFrame};
pub use synthetic::SyntheticCamera;
