//! Sandbox error types.

use thiserror::Error;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors that can occur while guaranteeing the execution environment.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No usable container runtime binary was found.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Invalid container name or image reference.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
