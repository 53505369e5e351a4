use thiserror::Error;

/// All errors produced by vocalis-core.
#[derive(Debug, Error)]
pub enum VocalisError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("ring buffer is full — pipeline cannot keep up")]
    RingBufferFull,

    #[error("capture pipeline is already running")]
    AlreadyRunning,

    #[error("capture pipeline is not running")]
    NotRunning,

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("connection error: {0}")]
    Connection(#[from] crate::protocol::ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VocalisError>;
