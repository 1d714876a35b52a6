use std::time::Duration;
use thiserror::Error;

/// Failures reported by an audio output primitive.
#[derive(Debug, Error)]
pub enum PrimitiveError {
    #[error("no source set")]
    NoSource,
    #[error("prepare failed: {0}")]
    Prepare(String),
    /// The primitive went away before reporting readiness.
    #[error("preparation abandoned")]
    Abandoned,
    #[error("not ready after {0:?}")]
    Timeout(Duration),
    #[error("backend: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("response is neither a JSON object nor an array")]
    NotJson,
}
