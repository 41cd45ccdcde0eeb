//! Custom error types for the application.
//!
//! This module defines the primary error type, `DeltaError`, for the entire
//! pipeline. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure categories that can occur, from
//! configuration and channel-grammar problems to transport, kernel and
//! storage failures.
//!
//! The variants map onto the process exit codes reported by the `delta`
//! binary: configuration-class errors exit with 1, transport errors with 2
//! and storage errors with 3. A normal end-of-stream drain is not an error
//! and exits with 0.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type Result<T> = std::result::Result<T, DeltaError>;

#[derive(Error, Debug)]
pub enum DeltaError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("malformed channel range: {0}")]
    MalformedRange(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bad FFT parameters: {0}")]
    BadFftParams(String),

    #[error("unknown analysis kind: {0}")]
    UnknownAnalysis(String),

    #[error("kernel failure: {0}")]
    Kernel(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeltaError {
    /// Maps the error onto the process exit code of the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeltaError::Config(_)
            | DeltaError::Configuration(_)
            | DeltaError::MalformedRange(_)
            | DeltaError::BadFftParams(_)
            | DeltaError::UnknownAnalysis(_)
            | DeltaError::FeatureNotEnabled(_) => 1,
            DeltaError::Transport(_) | DeltaError::Io(_) => 2,
            DeltaError::Backend(_) => 3,
            // Kernel failures are handled per (task, chunk) and never abort
            // the run on their own; one surfacing here means a task was
            // misconfigured.
            DeltaError::Kernel(_) => 1,
        }
    }
}
