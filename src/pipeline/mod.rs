pub mod compose;
pub mod controller;
pub mod pool;
pub mod resize;
pub mod session;
pub mod stats;

pub use compose::{AlphaCompositor, ComposeInputs, ComposeStage, Compositor, SyncPolicy};
pub use controller::{Collaborators, LifecycleEvent, PipelineController, SessionReport};
pub use pool::{BufferPool, Lease, PoolSnapshot};
pub use resize::{NearestResizer, ResizeGeometry, ResizeStage, Resizer};
pub use session::{Clock, ManualClock, MonotonicClock, Session};
pub use stats::{PipelineStats, StatsSnapshot};
