//! Error types for the extraction pipeline.
//!
//! `ConfigError` is the only fatal class: it aborts an extraction before any
//! worker starts. Everything else is scoped to a single video (or, for sink
//! failures, to a single worker) and ends up in a `FailureNotice`.

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No devices requested")]
    NoDevices,

    #[error("Device {0} requested more than once")]
    DuplicateDevice(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Failed to initialize device {device}: {source}")]
    DeviceInit {
        device: String,
        #[source]
        source: ModelError,
    },

    #[error("No input videos: {0}")]
    NoInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

/// Frame source could not produce frames for a video.
#[derive(Debug, Error)]
#[error("Failed to decode {}: {message}", path.display())]
pub struct DecodeError {
    pub path: PathBuf,
    pub message: String,
}

impl DecodeError {
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Wrap a reader error, keeping the whole context chain in the message.
    pub fn from_anyhow(path: impl Into<PathBuf>, err: anyhow::Error) -> Self {
        Self::new(path, format!("{:#}", err))
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Feature shape changed for stream '{stream}': expected {expected}, got {actual}")]
    ShapeMismatch {
        stream: String,
        expected: usize,
        actual: usize,
    },

    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),
}

impl ModelError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write array {}: {message}", path.display())]
    Array { path: PathBuf, message: String },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SinkError {
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}
