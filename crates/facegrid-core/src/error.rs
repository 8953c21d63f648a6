//! Error types shared across facegrid crates.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for calls across a service boundary.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failures reported by the external collaborators.
///
/// Every variant is transient from the point of view of the steady-state
/// loops: callers log it and move on to the next iteration.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("queue error: {0}")]
    Queue(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("blob store error: {0}")]
    Blob(String),

    #[error("instance api error: {0}")]
    Instance(String),

    #[error("recognition failed: {0}")]
    Recognition(String),
}

/// Errors raised while loading or validating configuration.
///
/// These are fatal: the daemon exits before any loop starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?} (expected e.g. \"500ms\", \"5s\", \"2m\")")]
    Duration(String),

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
