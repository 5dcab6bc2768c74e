pub mod readback;
pub mod synthetic;

pub use readback::{ReadbackCallback, ReadbackRequest, RenderCaptureStage, Renderer};
pub use synthetic::SyntheticRenderer;
