use thiserror::Error;

/// All errors produced by duckmix-core.
#[derive(Debug, Error)]
pub enum DuckmixError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed audio block: {0}")]
    MalformedBlock(String),

    #[error("failed to load audio asset {path}: {reason}")]
    AssetLoad {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("engine is not configured")]
    NotConfigured,

    #[error("engine is not running")]
    NotRunning,

    #[error("engine processing queue has shut down")]
    EngineGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DuckmixError>;
