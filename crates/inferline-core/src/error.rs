//! Error types shared across inferline crates.

use std::path::PathBuf;

use thiserror::Error;

/// Errors reported to a caller of the serving core.
///
/// `Clone` because a single inference failure is delivered to every
/// request waiting on the failed batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServeError {
    #[error("queue at capacity ({depth}/{max} requests pending)")]
    Overloaded { depth: usize, max: usize },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("server is shutting down")]
    ShuttingDown,
}

impl ServeError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ServeError::Overloaded { .. } => "OVERLOADED",
            ServeError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ServeError::Inference(_) => "INFERENCE_ERROR",
            ServeError::InvalidInput(_) => "INVALID_INPUT",
            ServeError::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
