use thiserror::Error;

/// Errors surfaced by the recording pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to load configuration: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("No recording session is active")]
    NotRecording,

    #[error("Frame of {actual} bytes does not fit pool '{pool}' ({expected} bytes)")]
    FrameSize {
        pool: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Pool '{0}' is over capacity")]
    PoolOverflow(&'static str),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Failed to spawn stage thread '{name}': {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
