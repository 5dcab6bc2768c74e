pub mod capture;
pub mod encode;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::camera::SensorKind;
pub use crate::capture::frame::{Frame, PixelFormat};
pub use crate::error::{PipelineError, Result};
pub use crate::pipeline::controller::{
    Collaborators, LifecycleEvent, PipelineController, SessionReport,
};

/// Environment variable prefix for configuration overrides,
/// e.g. `MIXCAST__RECORDING__FPS=15`
pub const ENV_PREFIX: &str = "MIXCAST";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub recording: RecordingConfig,
    pub passthrough: PassthroughConfig,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
}

/// Which sources end up in the recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureType {
    /// Render blended over passthrough
    Ar,
    /// Render only
    Vr,
    PassthroughOnly,
}

impl CaptureType {
    pub fn uses_passthrough(self) -> bool {
        self != CaptureType::Vr
    }

    pub fn uses_render(self) -> bool {
        self != CaptureType::PassthroughOnly
    }
}

/// What the camera callback does when no passthrough buffer is free
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBackpressure {
    /// Hold the camera thread until a buffer frees up or the session ends
    Wait,
    /// Drop the camera frame and count it
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub capture_type: CaptureType,
    pub fps: u32,
    pub output_dir: PathBuf,
    /// Render camera to read back
    pub render_camera: String,
    /// How far, in frame intervals, a passthrough frame may lag its render frame
    pub sync_tolerance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughConfig {
    pub sensor: SensorKind,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub raw_pool_size: usize,
    pub resized_pool_size: usize,
    pub render_pool_size: usize,
    pub output_pool_size: usize,
    /// Upper bound on how long a stage takes to notice cancellation
    pub poll_interval_ms: u64,
    pub capture_backpressure: CaptureBackpressure,
    pub pin_stage_threads: bool,
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recording: RecordingConfig {
                capture_type: CaptureType::Ar,
                fps: 30,
                output_dir: PathBuf::from("recordings"),
                render_camera: "main".into(),
                sync_tolerance: 0.5,
            },
            passthrough: PassthroughConfig {
                sensor: SensorKind::Rgb,
                width: 1536,
                height: 1404,
            },
            output: OutputConfig {
                width: 1024,
                height: 1024,
            },
            pipeline: PipelineConfig {
                raw_pool_size: 3,
                resized_pool_size: 3,
                render_pool_size: 6,
                output_pool_size: 4,
                poll_interval_ms: 1,
                capture_backpressure: CaptureBackpressure::Wait,
                pin_stage_threads: false,
            },
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `MIXCAST__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by a TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(PipelineError::Config(msg));

        if !(1..=30).contains(&self.recording.fps) {
            return fail(format!("fps must be within 1..=30, got {}", self.recording.fps));
        }
        if !(self.recording.sync_tolerance > 0.0 && self.recording.sync_tolerance <= 1.0) {
            return fail(format!(
                "sync_tolerance must be within (0, 1], got {}",
                self.recording.sync_tolerance
            ));
        }
        if self.passthrough.width == 0 || self.passthrough.height == 0 {
            return fail("passthrough resolution must be non-zero".into());
        }
        if self.output.width == 0 || self.output.height == 0 {
            return fail("output resolution must be non-zero".into());
        }
        let p = &self.pipeline;
        if p.raw_pool_size == 0
            || p.resized_pool_size == 0
            || p.render_pool_size == 0
            || p.output_pool_size == 0
        {
            return fail("pool sizes must be non-zero".into());
        }
        if p.poll_interval_ms == 0 {
            return fail("poll_interval_ms must be non-zero".into());
        }
        Ok(())
    }
}
