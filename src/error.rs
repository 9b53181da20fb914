//! Error types for streamscribe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamscribeError {
    // Configuration errors — fail fast, never retried
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Unknown recognition provider: {name}")]
    UnknownProvider { name: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Transport errors
    #[error("No free {protocol} port in range {start}-{end}")]
    PortRangeExhausted {
        protocol: String,
        start: u16,
        end: u16,
    },

    #[error("Decode pipeline failed: {message}")]
    PipelineFailed { message: String },

    #[error("Ingestion worker {id} failed: {message}")]
    WorkerFailed { id: String, message: String },

    // Recognition errors
    #[error("Recognition model not found at {path}")]
    ModelNotFound { path: String },

    #[error("Recognition backend error: {message}")]
    Recognition { message: String },

    #[error("No recognition provider attached")]
    NoProvider,

    // Channel errors
    #[error("Unknown channel: {id}")]
    UnknownChannel { id: String },

    #[error("Channel {id} already active")]
    ChannelActive { id: String },

    // Serialization of wire messages
    #[error("Message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, StreamscribeError>;
