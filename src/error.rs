//! Harness-wide error types
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A container runtime invocation exited non-zero. Hard failure, never
    /// retried; recovery is re-running the idempotent operation.
    #[error("Runtime failure: {0}")]
    Runtime(String),

    #[error("Enrollment API error: {0}")]
    Enrollment(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local and remote enrollment state disagree in a way that cannot be
    /// reconciled (e.g. multiple identifiers registered for one hostname).
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Attestation verification failed: {0}")]
    Verify(String),

    #[error("Quote summary parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
